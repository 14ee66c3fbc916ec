//! Ferry migration workflow
//!
//! This crate drives one device through the migration stages. Each stage's
//! work runs inside a transaction that backs up what it changes, and every
//! transition is persisted before the next one starts so a crash or an OS
//! restart resumes from the last completed stage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              StageController                         │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │          StateStore                         │    │
//! │  │   Memory | ReDB                             │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                               │
//! │                      ▼                               │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │         TransactionManager                  │    │
//! │  │   Backup, run step, commit or roll back     │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                               │
//! │                      ▼                               │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │         VerificationEngine                  │    │
//! │  │   Independent checks with bounded retry     │    │
//! │  └─────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use ferry_workflow::{StageController, RedbStateStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(RedbStateStore::open(config.store_path())?);
//! let controller = StageController::new(&config, store, capabilities, continuation);
//!
//! let outcome = controller.resume("LAPTOP-042").await?;
//! if outcome.awaiting_reboot {
//!     capabilities.restart_device(&ctx).await?;
//! }
//! ```

pub mod controller;
pub mod error;
pub mod redb_store;
pub mod stages;
pub mod store;
pub mod transaction;
pub mod verification;

pub use controller::*;
pub use error::*;
pub use redb_store::RedbStateStore;
pub use store::{MemoryStateStore, StateStore, StoreError};
pub use transaction::*;
pub use verification::*;
