//! Ferry fleet orchestration
//!
//! Runs many device migrations with a bounded worker pool. Each worker
//! checks that its device is reachable and idle, hands it to a
//! `DeviceDriver`, and reports the outcome to a single aggregator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            FleetOrchestrator                 │
//! │                                              │
//! │   queue ──► worker 1 ─┐                      │
//! │         ──► worker 2 ─┼──► aggregator ──► Summary (watch)
//! │         ──► worker N ─┘                      │
//! │                │                             │
//! │                ▼                             │
//! │   AvailabilityProbe ──► DeviceDriver         │
//! │                          (LocalDriver)       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Skipped and failed are distinct outcomes: a skipped device was never
//! touched and can simply be retried later.

pub mod availability;
pub mod driver;
pub mod error;
pub mod orchestrator;

pub use availability::*;
pub use driver::*;
pub use error::*;
pub use orchestrator::*;
