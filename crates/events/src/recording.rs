//! In-memory notifier for tests/dev.

use std::sync::Mutex;

use crate::bus::{Notifier, NotifyError};
use crate::topic::{Topic, Topical};

/// Keeps a copy of every message it cares about.
///
/// - No IO
/// - Unbounded; meant for tests and local debugging
#[derive(Debug)]
pub struct RecordingNotifier<M> {
    name: String,
    topics: Vec<Topic>,
    received: Mutex<Vec<M>>,
}

impl<M> RecordingNotifier<M> {
    /// Record every topic.
    pub fn new(name: impl Into<String>) -> Self {
        Self::for_topics(name, Topic::ALL)
    }

    pub fn for_topics(name: impl Into<String>, topics: impl IntoIterator<Item = Topic>) -> Self {
        Self {
            name: name.into(),
            topics: topics.into_iter().collect(),
            received: Mutex::new(Vec::new()),
        }
    }
}

impl<M: Clone> RecordingNotifier<M> {
    /// Messages received so far, oldest first.
    pub fn received(&self) -> Vec<M> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl<M: Topical> RecordingNotifier<M> {
    pub fn topics_seen(&self) -> Vec<Topic> {
        self.received
            .lock()
            .map(|r| r.iter().map(Topical::topic).collect())
            .unwrap_or_default()
    }
}

impl<M> Notifier<M> for RecordingNotifier<M>
where
    M: Clone + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn cares(&self, topic: Topic) -> bool {
        self.topics.contains(&topic)
    }

    fn notify(&self, message: &M) -> Result<(), NotifyError> {
        // A poisoned recorder only loses test output.
        if let Ok(mut received) = self.received.lock() {
            received.push(message.clone());
        }
        Ok(())
    }
}
