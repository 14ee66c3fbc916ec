//! Migration stages
//!
//! Stages are ordered and forward-only. A record's stage names the last
//! stage whose work has completed; `Failed` and `RolledBack` are terminal
//! exits reachable from any non-terminal stage.

use crate::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named step in the migration state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    #[default]
    Preparation,
    SourceRemoval,
    IntermediateBoot,
    TargetEnrollment,
    ProfileCapture,
    Finalize,
    Verification,
    Completed,
    /// Terminal: a step or its rollback could not be completed
    Failed,
    /// Terminal: a step failed and its changes were restored
    RolledBack,
}

impl Stage {
    /// Forward stages in execution order
    pub const FORWARD: [Stage; 8] = [
        Stage::Preparation,
        Stage::SourceRemoval,
        Stage::IntermediateBoot,
        Stage::TargetEnrollment,
        Stage::ProfileCapture,
        Stage::Finalize,
        Stage::Verification,
        Stage::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preparation => "preparation",
            Stage::SourceRemoval => "sourceRemoval",
            Stage::IntermediateBoot => "intermediateBoot",
            Stage::TargetEnrollment => "targetEnrollment",
            Stage::ProfileCapture => "profileCapture",
            Stage::Finalize => "finalize",
            Stage::Verification => "verification",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::RolledBack => "rolledBack",
        }
    }

    /// Position in the forward order, `None` for terminal failure states
    pub fn ordinal(&self) -> Option<usize> {
        Self::FORWARD.iter().position(|s| s == self)
    }

    /// The stage that follows this one, if any
    pub fn next(&self) -> Option<Stage> {
        self.ordinal()
            .and_then(|i| Self::FORWARD.get(i + 1))
            .copied()
    }

    /// Whether no further work can run from this stage
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed | Stage::RolledBack)
    }

    /// Whether reaching this stage ends in a terminal failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Stage::Failed | Stage::RolledBack)
    }

    /// Whether the OS must restart before the work after this stage may run
    ///
    /// Target enrollment cannot share a boot session with source-agent
    /// removal, and a directory join only takes effect after a restart.
    pub fn requires_reboot_after(&self) -> bool {
        matches!(self, Stage::SourceRemoval | Stage::TargetEnrollment)
    }

    /// Check whether `to` is a legal successor of this stage
    pub fn can_transition_to(&self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to.is_failure() {
            return true;
        }
        match (self.ordinal(), to.ordinal()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }

    /// Validate a transition, returning a structured error if illegal
    pub fn check_transition(&self, to: Stage) -> Result<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(ModelError::InvalidStageTransition { from: *self, to })
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::FORWARD
            .iter()
            .chain([Stage::Failed, Stage::RolledBack].iter())
            .find(|stage| stage.as_str().to_ascii_lowercase() == wanted)
            .copied()
            .ok_or_else(|| ModelError::UnknownStage(s.to_string()))
    }
}
