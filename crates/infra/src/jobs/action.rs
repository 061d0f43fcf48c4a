//! Action handlers: the code that performs a job's work.
//!
//! Jobs name their action by kind; a worker only runs kinds registered in its
//! [`ActionRegistry`], and job creation refuses kinds the registry does not
//! know.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use cirrus_core::{JobId, ProjectId};

/// Failure reported by an action (or imposed on it).
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid params: {0}")]
    InvalidParams(#[from] serde_json::Error),

    /// A cloud provider call failed; `trace` is the stack at capture time.
    #[error("provider error: {source}")]
    Provider {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
        trace: String,
    },

    #[error("action `{0}` is not registered on this worker")]
    Unsupported(String),

    #[error("execution deadline of {}s exceeded", .0.as_secs())]
    TimedOut(Duration),
}

impl ActionError {
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    pub fn provider(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Provider {
            source: Box::new(source),
            trace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }
}

/// What an action knows about the attempt it runs in.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub job_id: JobId,
    pub project_id: ProjectId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// No retry follows if this attempt fails.
    pub is_last_chance: bool,
}

impl ActionContext {
    /// Cooperative sleep; cancelled with the attempt when the deadline fires.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A unit of work runnable by the job engine.
#[async_trait::async_trait]
pub trait Action: Send + Sync {
    async fn handle(&self, params: Value, ctx: ActionContext) -> Result<Value, ActionError>;
}

/// Action backed by an async closure.
pub struct FnAction<F> {
    handler: F,
}

#[async_trait::async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(Value, ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    async fn handle(&self, params: Value, ctx: ActionContext) -> Result<Value, ActionError> {
        (self.handler)(params, ctx).await
    }
}

/// Closed set of actions a worker can run, keyed by kind.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action for `kind`, replacing any previous one.
    pub fn register(mut self, kind: impl Into<String>, action: impl Action + 'static) -> Self {
        self.actions.insert(kind.into(), Arc::new(action));
        self
    }

    /// Register an async closure for `kind`.
    pub fn register_fn<F, Fut>(self, kind: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
    {
        self.register(kind, FnAction { handler })
    }

    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.actions.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
