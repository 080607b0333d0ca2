//! Property-based tests for branch and database naming.

#[cfg(test)]
mod proptest_tests {
    use crate::branch::{normalize_issue, BranchNamer, InstanceNamer};
    use crate::instance::{default_db_name, BranchVersion, DB_NAME_MAX_LENGTH};
    use proptest::prelude::*;

    fn version() -> impl Strategy<Value = String> {
        prop_oneof![
            "[1-9][0-9]{1,2}".prop_map(String::from),
            Just("main".to_string()),
        ]
    }

    // ============================================================================
    // BranchNamer
    // ============================================================================

    proptest! {
        /// Property: parse(generate(issue, version, suffix)) recovers the parts
        #[test]
        fn branch_name_round_trip(
            issue in "[1-9][0-9]{0,5}",
            version in version(),
            suffix in proptest::option::of("[a-z][a-z0-9]{0,8}"),
        ) {
            let namer = BranchNamer::with_defaults().unwrap();
            let branch = namer.generate(&issue, &version, suffix.as_deref());
            let parsed = namer.parse(&branch).unwrap();
            prop_assert_eq!(parsed.issue, issue);
            prop_assert_eq!(parsed.version, version);
            prop_assert_eq!(parsed.suffix, suffix);
        }

        /// Property: an absent suffix never leaves a trailing separator
        #[test]
        fn branch_name_without_suffix_has_no_separator(
            issue in "[1-9][0-9]{0,5}",
            version in version(),
        ) {
            let namer = BranchNamer::with_defaults().unwrap();
            let branch = namer.generate(&issue, &version, None);
            prop_assert!(!branch.ends_with('-'));
            prop_assert_eq!(namer.generate(&issue, &version, Some("")), branch);
        }

        /// Property: the tracker prefix is stripped whatever its case
        #[test]
        fn issue_prefix_is_stripped(
            issue in "[1-9][0-9]{0,5}",
            prefix in "(mdl|MDL|Mdl)[-_]?",
        ) {
            prop_assert_eq!(normalize_issue(&format!("{}{}", prefix, issue)), issue);
        }

        /// Property: an explicit identifier keeps the suffix
        #[test]
        fn instance_name_keeps_suffix(
            identifier in "[a-z][a-z0-9 ]{0,10}",
            suffix in "[a-z]{1,5}",
        ) {
            let name =
                InstanceNamer::default().generate("405", false, Some(&suffix), Some(&identifier));
            prop_assert!(name.ends_with(&suffix));
            prop_assert!(!name.contains(' '));
        }
    }

    // ============================================================================
    // Database names and branch classification
    // ============================================================================

    proptest! {
        /// Property: default database names are short and alphanumeric
        #[test]
        fn db_name_is_bounded_and_alphanumeric(identifier in ".*") {
            let name = default_db_name(&identifier, "");
            prop_assert!(name.len() <= DB_NAME_MAX_LENGTH);
            prop_assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
        }

        /// Property: branches at or past the master threshold are main
        #[test]
        fn branch_at_threshold_is_main(master in 400u32..600, offset in 0u32..100) {
            prop_assert_eq!(
                BranchVersion::from_number(master + offset, master),
                BranchVersion::Main
            );
            prop_assert_eq!(
                BranchVersion::from_number(master + offset, master).to_string(),
                "main"
            );
        }

        /// Property: branches below the threshold stay numbered
        #[test]
        fn branch_below_threshold_is_numbered(master in 20u32..600, below in 1u32..20) {
            let number = master - below;
            prop_assert_eq!(
                BranchVersion::from_number(number, master),
                BranchVersion::Numbered(number)
            );
        }
    }
}
