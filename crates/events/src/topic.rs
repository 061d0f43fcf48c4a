use core::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle topics a notifier can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    JobStarted,
    JobFailed,
    JobFinished,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::JobStarted, Topic::JobFailed, Topic::JobFinished];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::JobStarted => "job-started",
            Topic::JobFailed => "job-failed",
            Topic::JobFinished => "job-finished",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages that belong to exactly one topic.
pub trait Topical {
    fn topic(&self) -> Topic;
}
