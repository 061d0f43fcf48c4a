//! Asynchronous job engine.
//!
//! ## Design
//!
//! - Jobs are persisted records moving along `pending -> running ->
//!   finished | error`, with failed attempts going back to `pending`
//! - A store row lock gives at most one worker execution rights per job
//! - Failed attempts are retried with linear backoff until `try_max`
//! - Lifecycle events fan out synchronously to registered notifiers
//!
//! ## Components
//!
//! - `JobStore`: persistence (PostgreSQL or in-memory) with locking sessions
//! - `ExecutionContext`: per-unit correlation id and transaction/lock scopes
//! - `JobController`: every lifecycle operation on a job
//! - `Worker`: recovery sweep, poll loop and bounded execution pool

pub mod action;
pub mod context;
pub mod error;
pub mod in_memory;
pub mod lifecycle;
pub mod postgres;
pub mod store;
pub mod worker;

pub use action::{Action, ActionContext, ActionError, ActionRegistry};
pub use context::{ExecutionContext, LockScope, TransactionScope, footprint};
pub use error::JobError;
pub use in_memory::InMemoryJobStore;
pub use lifecycle::{JobController, JobOutcome, Lifecycle};
pub use postgres::PostgresJobStore;
pub use store::{JobFilter, JobPage, JobQuery, JobStore, JobTransaction, SortOrder, StoreError};
pub use worker::{Worker, WorkerConfig, WorkerStatsSnapshot, shutdown_signal};
