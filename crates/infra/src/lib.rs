//! Infrastructure layer: job storage, execution engine, worker process.

pub mod bootstrap;
pub mod config;
pub mod jobs;
pub mod waiter;

#[cfg(test)]
mod integration_tests;
