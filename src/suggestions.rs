//! # Error Suggestions
//!
//! Helpers for user-facing errors that say what went wrong AND how to fix it.
//!
//! ```rust,ignore
//! use mdk::suggestions;
//!
//! // Instead of:
//! anyhow::bail!("No instance found");
//!
//! // Use:
//! return Err(suggestions::instance_not_resolved(None));
//! ```

use std::path::Path;

/// No instance could be resolved from a name or the working directory.
pub fn instance_not_resolved(name: Option<&str>) -> anyhow::Error {
    match name {
        Some(name) => anyhow::anyhow!(
            "This is not a Moodle instance: {name}\n\n\
             hint: Run 'mdk info --list' to see the available instances"
        ),
        None => anyhow::anyhow!(
            "This is not a Moodle instance\n\n\
             hint: Pass the instance name as an argument\n\
             hint: Or run the command from within an instance directory"
        ),
    }
}

/// A setting name was given with a typo.
///
/// Suggests the closest known setting when one is near enough.
pub fn unknown_setting(key: &str, known: &[String]) -> anyhow::Error {
    let candidates: Vec<&str> = known.iter().map(String::as_str).collect();
    let did_you_mean = find_similar(key, &candidates)
        .map(|s| format!("\nhint: Did you mean '{s}'?"))
        .unwrap_or_default();

    anyhow::anyhow!(
        "Unknown setting: {key}{did_you_mean}\n\n\
         hint: Run 'mdk config flatlist' to list every setting"
    )
}

/// A directory could not be removed for lack of permissions.
pub fn permission_denied(path: &Path) -> anyhow::Error {
    anyhow::anyhow!(
        "Permission denied while removing {path}\n\n\
         hint: Files created by the web server may belong to another user\n\
         hint: Try 'sudo chmod -R u+w {path}' and run the command again",
        path = path.display()
    )
}

/// The tracker could not be used because credentials are missing.
pub fn tracker_credentials_missing() -> anyhow::Error {
    anyhow::anyhow!(
        "No tracker credentials configured\n\n\
         hint: Run 'mdk config set tracker.username <username>'\n\
         hint: Export MDK_TRACKER_PASSWORD or set tracker.password"
    )
}

/// No issue number was given and none could be read from the current branch.
pub fn issue_not_given(branch: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "Could not extract an issue number from the branch '{branch}'\n\n\
         hint: Pass the issue number as an argument, e.g. 'mdk pull 12345'"
    )
}

/// Find a similar string from a list of candidates using edit distance.
fn find_similar<'a>(input: &str, candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .filter_map(|&candidate| {
            let distance = edit_distance(input, candidate);
            if distance <= 2 && distance < input.len() {
                Some((candidate, distance))
            } else {
                None
            }
        })
        .min_by_key(|(_, distance)| *distance)
        .map(|(candidate, _)| candidate)
}

/// Levenshtein edit distance between two strings.
fn edit_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    for (i, a_char) in a_chars.iter().enumerate() {
        let mut current = vec![i + 1; b_chars.len() + 1];
        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = usize::from(a_char != b_char);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        previous = current;
    }
    previous[b_chars.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_not_resolved_with_name() {
        let message = instance_not_resolved(Some("stable_39")).to_string();
        assert!(message.contains("stable_39"));
        assert!(message.contains("mdk info --list"));
    }

    #[test]
    fn test_instance_not_resolved_without_name() {
        let message = instance_not_resolved(None).to_string();
        assert!(message.contains("not a Moodle instance"));
        assert!(message.contains("hint:"));
    }

    #[test]
    fn test_unknown_setting_suggests_similar() {
        let known = vec!["upstreamRemote".to_string(), "myRemote".to_string()];
        let message = unknown_setting("upstreamRemot", &known).to_string();
        assert!(message.contains("Did you mean 'upstreamRemote'?"));

        let message = unknown_setting("somethingelse", &known).to_string();
        assert!(!message.contains("Did you mean"));
    }

    #[test]
    fn test_permission_denied_mentions_chmod() {
        let message = permission_denied(Path::new("/home/me/moodles/x")).to_string();
        assert!(message.contains("/home/me/moodles/x"));
        assert!(message.contains("chmod"));
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("purge", "purge"), 0);
        assert_eq!(edit_distance("purg", "purge"), 1);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
    }
}
