//! Ferry data model
//!
//! This crate provides the serializable types shared by every part of the
//! migration engine.
//!
//! # Resources
//!
//! - `MigrationRecord` - Durable per-device progress through the stages
//! - `Transaction` - Rollback-scoped unit of work with its backup manifest
//! - `VerificationResult` - Itemized post-migration checks
//! - `FleetJob` / `Summary` - Ephemeral per-run orchestration status
//! - `MigrationConfig` - Settings consumed by every component constructor

pub mod config;
pub mod error;
pub mod fleet;
pub mod record;
pub mod stage;
pub mod transaction;
pub mod verification;

pub use config::*;
pub use error::*;
pub use fleet::*;
pub use record::*;
pub use stage::*;
pub use transaction::*;
pub use verification::*;

/// Schema version written into persisted records
pub const SCHEMA_VERSION: u32 = 1;
