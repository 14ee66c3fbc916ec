//! Device availability
//!
//! Checked before every dispatch. An unavailable device is skipped, not
//! failed: the remediation is to retry later.

use async_trait::async_trait;
use ferry_actions::command::{check_predicate, render, run_line};
use ferry_actions::CapabilityContext;
use ferry_model::AvailabilityCommands;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Whether a device can be migrated right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unreachable(String),
    InUse(String),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Available => f.write_str("available"),
            Availability::Unreachable(reason) => write!(f, "unreachable: {}", reason),
            Availability::InUse(reason) => write!(f, "in use: {}", reason),
        }
    }
}

/// Probe for reachability and active use
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn check(&self, device_id: &str) -> Availability;
}

/// Treats every device as available
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAvailable;

#[async_trait]
impl AvailabilityProbe for AlwaysAvailable {
    async fn check(&self, _device_id: &str) -> Availability {
        Availability::Available
    }
}

/// Probe backed by operator command templates
pub struct CommandProbe {
    commands: AvailabilityCommands,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(commands: AvailabilityCommands) -> Self {
        Self {
            commands,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AvailabilityProbe for CommandProbe {
    async fn check(&self, device_id: &str) -> Availability {
        let ctx = CapabilityContext::new(device_id).with_timeout(self.timeout);
        let vars = [("device", device_id)];

        let line = render(&self.commands.reachable, &vars);
        let reachable = match run_line(&ctx, "reachable", &line).await {
            Ok(output) => check_predicate("reachable", &output),
            Err(e) => Err(e),
        };
        match reachable {
            Ok(true) => {}
            Ok(false) => return Availability::Unreachable("reachability probe failed".to_string()),
            Err(e) => return Availability::Unreachable(e.to_string()),
        }

        let Some(template) = &self.commands.in_use else {
            return Availability::Available;
        };
        let line = render(template, &vars);
        match run_line(&ctx, "inUse", &line).await {
            Ok(output) => match check_predicate("inUse", &output) {
                Ok(false) => Availability::Available,
                Ok(true) => Availability::InUse("a user is signed in".to_string()),
                Err(e) => {
                    debug!(device = %device_id, error = %e, "In-use probe failed");
                    Availability::InUse(format!("in-use probe failed: {}", e))
                }
            },
            Err(e) => Availability::InUse(format!("in-use probe failed: {}", e)),
        }
    }
}
