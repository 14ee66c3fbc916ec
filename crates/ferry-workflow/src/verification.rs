//! Post-migration verification
//!
//! Checks are independent boolean predicates against the device. They run
//! concurrently, each with its own retry budget, and a failing check never
//! stops the others. The overall result is the AND of every check once its
//! retries are exhausted.

use async_trait::async_trait;
use ferry_actions::{Capabilities, CapabilityContext};
use ferry_model::{Backoff, CheckResult, MigrationConfig, VerificationResult, VerificationSettings};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A named predicate against externally observed state
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> String;

    /// Evaluate once, returning whether it passed and why
    async fn evaluate(&self, ctx: &CapabilityContext) -> ferry_actions::Result<(bool, String)>;
}

/// Bounded retry for checks with propagation delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Evaluations per check, including the first
    pub attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            backoff,
        }
    }

    /// Delay after the `attempt`-th failed evaluation (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => self
                .delay
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
        }
    }
}

impl From<&VerificationSettings> for RetryPolicy {
    fn from(settings: &VerificationSettings) -> Self {
        Self::new(
            settings.attempts,
            Duration::from_secs(settings.delay_seconds),
            settings.backoff,
        )
    }
}

/// Runs checks with retry and aggregates the result
#[derive(Debug, Clone)]
pub struct VerificationEngine {
    policy: RetryPolicy,

    /// Deadline for one evaluation of one check
    call_timeout: Option<Duration>,
}

impl VerificationEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            call_timeout: None,
        }
    }

    /// Count an evaluation that runs past `timeout` as a failed attempt
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Evaluate every check against a device
    pub async fn verify(&self, device_id: &str, checks: &[Arc<dyn Check>]) -> VerificationResult {
        let mut ctx = CapabilityContext::new(device_id);
        if let Some(timeout) = self.call_timeout {
            ctx = ctx.with_timeout(timeout);
        }
        info!(device = %device_id, checks = checks.len(), "Verifying migration");

        let results = join_all(checks.iter().map(|check| self.run_check(&ctx, check.as_ref()))).await;
        let result = VerificationResult::from_checks(device_id, results);

        if result.overall_success {
            info!(device = %device_id, "Verification passed");
        } else {
            warn!(device = %device_id, failures = %result.failure_summary(), "Verification failed");
        }
        result
    }

    async fn run_check(&self, ctx: &CapabilityContext, check: &dyn Check) -> CheckResult {
        let name = check.name();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let evaluation = match self.call_timeout {
                Some(timeout) => tokio::time::timeout(timeout, check.evaluate(ctx))
                    .await
                    .unwrap_or_else(|_| {
                        Err(ferry_actions::CapabilityError::Timeout {
                            operation: name.clone(),
                            timeout,
                        })
                    }),
                None => check.evaluate(ctx).await,
            };
            let (passed, detail) = match evaluation {
                Ok(outcome) => outcome,
                Err(e) => (false, e.to_string()),
            };

            if passed || attempt >= self.policy.attempts {
                debug!(
                    device = %ctx.device_id(),
                    check = %name,
                    passed,
                    attempts = attempt,
                    "Check finished"
                );
                return CheckResult::new(name, passed, detail, attempt);
            }

            let delay = self.policy.delay_after(attempt);
            debug!(
                device = %ctx.device_id(),
                check = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                detail = %detail,
                "Check not yet passing, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Device is enrolled with the target management service
pub struct EnrollmentCheck {
    capabilities: Arc<dyn Capabilities>,
}

impl EnrollmentCheck {
    pub fn new(capabilities: Arc<dyn Capabilities>) -> Self {
        Self { capabilities }
    }
}

#[async_trait]
impl Check for EnrollmentCheck {
    fn name(&self) -> String {
        "enrollment".to_string()
    }

    async fn evaluate(&self, ctx: &CapabilityContext) -> ferry_actions::Result<(bool, String)> {
        self.capabilities.verify_enrollment(ctx).await
    }
}

/// A required application is installed
pub struct ApplicationCheck {
    capabilities: Arc<dyn Capabilities>,
    application: String,
}

impl ApplicationCheck {
    pub fn new(capabilities: Arc<dyn Capabilities>, application: impl Into<String>) -> Self {
        Self {
            capabilities,
            application: application.into(),
        }
    }
}

#[async_trait]
impl Check for ApplicationCheck {
    fn name(&self) -> String {
        format!("app:{}", self.application)
    }

    async fn evaluate(&self, ctx: &CapabilityContext) -> ferry_actions::Result<(bool, String)> {
        let installed = self
            .capabilities
            .application_installed(ctx, &self.application)
            .await?;
        let detail = if installed { "installed" } else { "not installed" };
        Ok((installed, detail.to_string()))
    }
}

/// A policy marker has been applied
pub struct PolicyMarkerCheck {
    capabilities: Arc<dyn Capabilities>,
    marker: String,
}

impl PolicyMarkerCheck {
    pub fn new(capabilities: Arc<dyn Capabilities>, marker: impl Into<String>) -> Self {
        Self {
            capabilities,
            marker: marker.into(),
        }
    }
}

#[async_trait]
impl Check for PolicyMarkerCheck {
    fn name(&self) -> String {
        format!("policy:{}", self.marker)
    }

    async fn evaluate(&self, ctx: &CapabilityContext) -> ferry_actions::Result<(bool, String)> {
        let present = self
            .capabilities
            .policy_marker_present(ctx, &self.marker)
            .await?;
        let detail = if present { "present" } else { "marker absent" };
        Ok((present, detail.to_string()))
    }
}

/// The checks every migrated device must pass
pub fn required_checks(
    capabilities: &Arc<dyn Capabilities>,
    config: &MigrationConfig,
) -> Vec<Arc<dyn Check>> {
    let mut checks: Vec<Arc<dyn Check>> =
        vec![Arc::new(EnrollmentCheck::new(capabilities.clone())) as Arc<dyn Check>];
    for application in &config.required_applications {
        checks.push(Arc::new(ApplicationCheck::new(
            capabilities.clone(),
            application.clone(),
        )));
    }
    for marker in &config.policy_markers {
        checks.push(Arc::new(PolicyMarkerCheck::new(
            capabilities.clone(),
            marker.clone(),
        )));
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_actions::ScriptedCapabilities;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails until it has been evaluated `passes_on` times
    struct FlakyCheck {
        passes_on: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Check for FlakyCheck {
        fn name(&self) -> String {
            "policy:propagation".to_string()
        }

        async fn evaluate(&self, _ctx: &CapabilityContext) -> ferry_actions::Result<(bool, String)> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.passes_on {
                Ok((true, "applied".to_string()))
            } else {
                Err(ferry_actions::CapabilityError::transient("policy", "not yet applied"))
            }
        }
    }

    fn fast_engine(attempts: u32) -> VerificationEngine {
        VerificationEngine::new(RetryPolicy::new(attempts, Duration::from_millis(1), Backoff::Fixed))
    }

    #[tokio::test]
    async fn test_passes_on_third_attempt() {
        let flaky = Arc::new(FlakyCheck {
            passes_on: 3,
            calls: AtomicU32::new(0),
        });
        let checks = vec![flaky.clone() as Arc<dyn Check>];

        let result = fast_engine(3).verify("LAPTOP-042", &checks).await;
        assert!(result.overall_success);
        assert_eq!(result.checks[0].attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failing_check_does_not_abort_others() {
        let caps: Arc<dyn Capabilities> = Arc::new(
            ScriptedCapabilities::new()
                .with_installed_app("Company Portal")
                .without_source(),
        );
        let config = MigrationConfig {
            required_applications: vec!["Company Portal".to_string(), "Defender".to_string()],
            policy_markers: vec!["BitLocker".to_string()],
            ..Default::default()
        };
        let checks = required_checks(&caps, &config);
        assert_eq!(checks.len(), 4);

        let result = fast_engine(2).verify("LAPTOP-042", &checks).await;
        assert!(!result.overall_success);
        assert_eq!(result.checks.len(), 4);

        let portal = result.check("app:Company Portal").unwrap();
        assert!(portal.passed);
        assert_eq!(portal.attempts, 1);

        let defender = result.check("app:Defender").unwrap();
        assert!(!defender.passed);
        assert_eq!(defender.attempts, 2);
        assert_eq!(defender.detail, "not installed");

        let enrollment = result.check("enrollment").unwrap();
        assert!(!enrollment.passed);
        assert_eq!(enrollment.detail, "not enrolled");
    }

    /// Never answers within any reasonable deadline
    struct HungCheck {
        seen_timeout: std::sync::Mutex<Option<Duration>>,
    }

    #[async_trait]
    impl Check for HungCheck {
        fn name(&self) -> String {
            "enrollment".to_string()
        }

        async fn evaluate(&self, ctx: &CapabilityContext) -> ferry_actions::Result<(bool, String)> {
            *self.seen_timeout.lock().unwrap() = ctx.timeout();
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok((true, "enrolled".to_string()))
        }
    }

    #[tokio::test]
    async fn test_hung_check_times_out_as_failed_attempt() {
        let hung = Arc::new(HungCheck {
            seen_timeout: std::sync::Mutex::new(None),
        });
        let checks = vec![hung.clone() as Arc<dyn Check>];
        let engine = fast_engine(2).with_call_timeout(Duration::from_millis(50));

        let result = engine.verify("LAPTOP-042", &checks).await;
        assert!(!result.overall_success);
        let enrollment = result.check("enrollment").unwrap();
        assert_eq!(enrollment.attempts, 2);
        assert!(enrollment.detail.contains("timed out"));
        assert_eq!(
            *hung.seen_timeout.lock().unwrap(),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn test_backoff_delays() {
        let fixed = RetryPolicy::new(3, Duration::from_secs(10), Backoff::Fixed);
        assert_eq!(fixed.delay_after(1), Duration::from_secs(10));
        assert_eq!(fixed.delay_after(2), Duration::from_secs(10));

        let exponential = RetryPolicy::new(4, Duration::from_secs(10), Backoff::Exponential);
        assert_eq!(exponential.delay_after(1), Duration::from_secs(10));
        assert_eq!(exponential.delay_after(2), Duration::from_secs(20));
        assert_eq!(exponential.delay_after(3), Duration::from_secs(40));

        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Backoff::Fixed).attempts, 1);
        assert_eq!(RetryPolicy::from(&VerificationSettings::default()).attempts, 3);
    }
}
