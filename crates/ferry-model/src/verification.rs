//! Verification result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one verification pass
///
/// Produced fresh on every pass and never persisted long-term.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub device_id: String,

    /// AND of every check after retries were exhausted
    pub overall_success: bool,

    pub checks: Vec<CheckResult>,

    pub completed_at: DateTime<Utc>,
}

impl VerificationResult {
    /// Build a result, deriving `overall_success` from the checks
    pub fn from_checks(device_id: impl Into<String>, checks: Vec<CheckResult>) -> Self {
        let overall_success = checks.iter().all(|c| c.passed);
        Self {
            device_id: device_id.into(),
            overall_success,
            checks,
            completed_at: Utc::now(),
        }
    }

    /// Checks that did not pass
    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// One-line description of the failing checks
    pub fn failure_summary(&self) -> String {
        self.failed_checks()
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Result of a single named check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,

    /// Evaluations performed, including the final one
    pub attempts: u32,
}

impl CheckResult {
    pub fn new(name: impl Into<String>, passed: bool, detail: impl Into<String>, attempts: u32) -> Self {
        Self {
            name: name.into(),
            passed,
            detail: detail.into(),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_success_is_and_of_checks() {
        let passing = VerificationResult::from_checks(
            "LAPTOP-042",
            vec![
                CheckResult::new("enrollment", true, "enrolled", 1),
                CheckResult::new("app:Company Portal", true, "installed", 2),
            ],
        );
        assert!(passing.overall_success);
        assert_eq!(passing.failure_summary(), "");

        let failing = VerificationResult::from_checks(
            "LAPTOP-042",
            vec![
                CheckResult::new("enrollment", true, "enrolled", 1),
                CheckResult::new("policy:BitLocker", false, "marker absent", 3),
            ],
        );
        assert!(!failing.overall_success);
        assert_eq!(failing.failed_checks().count(), 1);
        assert_eq!(failing.failure_summary(), "policy:BitLocker: marker absent");
        assert_eq!(failing.check("policy:BitLocker").unwrap().attempts, 3);
    }
}
