//! Capability call context
//!
//! The context identifies the device a call targets and carries the
//! settings that apply to every call made for it.

use std::collections::HashMap;
use std::time::Duration;

/// Context provided to capability calls
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    /// Device the call targets
    device_id: String,

    /// Extra variables exposed to command templates
    environment: HashMap<String, String>,

    /// Deadline for a single call
    timeout: Option<Duration>,
}

impl CapabilityContext {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            environment: HashMap::new(),
            timeout: None,
        }
    }

    /// Add a single environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment.get(key).map(|s| s.as_str())
    }

    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
