//! Aggregating the outcome of one operation over several instances.
//!
//! Each instance is processed to completion before the next one; a failure
//! is recorded and the batch goes on. Errors that mean "not applicable here"
//! ([`Error::is_skip`]) are counted as skips rather than failures.

use crate::error::{Error, Result};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    /// `(identifier, reason)`
    pub skipped: Vec<(String, String)>,
    /// `(identifier, message)`
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// File the result of processing `identifier`.
    pub fn record(&mut self, identifier: &str, result: Result<()>) {
        match result {
            Ok(()) => self.succeeded.push(identifier.to_string()),
            Err(e) if e.is_skip() => {
                log::info!("Skipping {}: {}", identifier, e);
                self.skipped.push((identifier.to_string(), e.to_string()));
            }
            Err(e) => {
                log::error!("{}: {}", identifier, e);
                self.failed.push((identifier.to_string(), e.to_string()));
            }
        }
    }

    /// Record a failure that did not come from the library, e.g. an unresolved name.
    pub fn fail(&mut self, identifier: &str, message: impl Into<String>) {
        self.failed.push((identifier.to_string(), message.into()));
    }

    pub fn targeted(&self) -> usize {
        self.succeeded.len() + self.skipped.len() + self.failed.len()
    }

    /// A single instance already reported its own error, so only multi-instance
    /// runs with at least one failure fail as a whole.
    pub fn should_fail(&self) -> bool {
        self.targeted() > 1 && !self.failed.is_empty()
    }

    pub fn log_summary(&self) {
        if self.failed.is_empty() {
            return;
        }
        log::warn!("Errors occurred on the following instances:");
        for (identifier, message) in &self.failed {
            log::warn!("- {}: {}", identifier, message);
        }
    }

    /// An error suitable for returning from a command when [`Self::should_fail`] holds.
    pub fn error(&self) -> Option<Error> {
        self.should_fail().then(|| Error::Process {
            command: "batch".to_string(),
            message: format!(
                "{} of {} instances failed: {}",
                self.failed.len(),
                self.targeted(),
                self.failed
                    .iter()
                    .map(|(identifier, _)| identifier.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> Result<()> {
        Err(Error::UpgradeFailed {
            identifier: "stable_main".to_string(),
            message: "exit status 1".to_string(),
        })
    }

    #[test]
    fn test_single_failure_does_not_fail_batch() {
        let mut report = BatchReport::new();
        report.record("stable_main", failure());
        assert_eq!(report.failed.len(), 1);
        assert!(!report.should_fail());
        assert!(report.error().is_none());
    }

    #[test]
    fn test_multiple_targets_with_failure() {
        let mut report = BatchReport::new();
        report.record("stable_405", Ok(()));
        report.record("stable_main", failure());
        assert!(report.should_fail());
        let message = report.error().unwrap().to_string();
        assert!(message.contains("1 of 2 instances failed: stable_main"));
    }

    #[test]
    fn test_skips_are_not_failures() {
        let mut report = BatchReport::new();
        report.record(
            "stable_405",
            Err(Error::UpgradeNotAllowed {
                identifier: "stable_405".to_string(),
                reason: "marker".to_string(),
            }),
        );
        report.record("stable_main", Ok(()));
        assert_eq!(report.skipped.len(), 1);
        assert!(!report.should_fail());
    }

    #[test]
    fn test_summary_lists_failures() {
        testing_logger::setup();
        let mut report = BatchReport::new();
        report.record("a", failure());
        report.fail("b", "not found");
        report.log_summary();
        testing_logger::validate(|logs| {
            assert!(logs.iter().any(|l| l.body == "- b: not found"));
        });
    }
}
