//! Ferry capability layer
//!
//! This crate defines the narrow interface through which the migration
//! engine touches a device, plus the continuation handles that bring the
//! engine back after a reboot.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            StageController               │
//! └──────────────┬───────────────┬───────────┘
//!                │               │
//!                ▼               ▼
//! ┌─────────────────────┐ ┌──────────────────┐
//! │   Capabilities      │ │   Continuation   │
//! │  command | scripted │ │ schtasks | cmd | │
//! │                     │ │    simulated     │
//! └─────────────────────┘ └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use ferry_actions::{Capabilities, CapabilityContext, CommandCapabilities};
//!
//! let caps = CommandCapabilities::new(config.commands.clone());
//! let ctx = CapabilityContext::new("LAPTOP-042");
//! if caps.source_management_present(&ctx).await? {
//!     caps.remove_source_management(&ctx).await?;
//! }
//! ```

pub mod command;
pub mod context;
pub mod continuation;
pub mod error;
pub mod scripted;
pub mod traits;

pub use command::CommandCapabilities;
pub use context::*;
pub use continuation::*;
pub use error::*;
pub use scripted::*;
pub use traits::*;
