//! Remote write pipeline
//!
//! Provides the asynchronous save-to-remote coordinator with:
//! - At-most-one in-flight write per resource (registry-enforced)
//! - Local temp staging before any remote job
//! - mkdir-then-transfer job sequencing over ssh/scp/rsync
//! - Per-operation watchdog for vanished jobs and timeouts
//! - One idempotent completion funnel for every finish path

pub mod coordinator;
pub mod registry;
pub mod staging;

pub(crate) mod runner;
mod watchdog;

pub use coordinator::{
    StartOutcome, WriteCoordinator, WriteEvent, WriteStatus, SYNTHETIC_EXIT_CODE,
};
pub use registry::{RegistryError, WriteOperation, WriteRegistry};
pub use staging::{stage_content, StagedContent};
