//! Error types for fleet orchestration

use ferry_actions::CapabilityError;
use ferry_workflow::WorkflowError;
use std::time::Duration;
use thiserror::Error;

/// Error type for driving a device
#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("capability call failed: {0}")]
    Capability(#[from] CapabilityError),

    /// The device did not come back from a restart in time
    #[error("device '{device_id}' did not restart within {timeout:?}")]
    RebootTimeout { device_id: String, timeout: Duration },
}

/// Result type for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    /// Whether the device was stopped by an operator rather than failing
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FleetError::Workflow(WorkflowError::Cancelled(_)))
    }
}
