//! `cirrus-core`: job model building blocks.
//!
//! This crate contains **pure** primitives (no IO, no async): identifiers, the
//! job record and its state machine, the retry schedule, and parameter
//! redaction.

pub mod error;
pub mod id;
pub mod job;
pub mod redact;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, ProjectId};
pub use job::{Job, JobChanges, JobStatus, JobSummary, NewJob};
pub use redact::redact;
pub use retry::RetryDecision;
