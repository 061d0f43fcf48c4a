//! Notifier bus: synchronous, ordered observer fan-out.
//!
//! Unlike a broadcast channel, publishing runs every interested notifier
//! inline, in registration order, before returning. A notifier that fails
//! stops the fan-out and its error is returned to the publisher; isolation
//! between notifiers is the notifiers' own business.
//!
//! ```ignore
//! let bus = NotifierBus::new()
//!     .add_notifier(LogNotifier::default())
//!     .add_notifier(notifier_fn("audit", [Topic::JobFailed], |event: &JobEvent| {
//!         audit.record(event.job());
//!         Ok(())
//!     }));
//!
//! bus.publish(&JobEvent::started(&job))?;
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use crate::topic::{Topic, Topical};

/// A notifier failed while handling a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("notifier `{notifier}` failed on {topic}: {message}")]
pub struct NotifyError {
    pub notifier: String,
    pub topic: Topic,
    pub message: String,
}

impl NotifyError {
    pub fn new(notifier: impl Into<String>, topic: Topic, message: impl Into<String>) -> Self {
        Self {
            notifier: notifier.into(),
            topic,
            message: message.into(),
        }
    }
}

/// Subscriber of lifecycle messages.
pub trait Notifier<M>: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Whether this notifier wants messages of `topic`.
    fn cares(&self, topic: Topic) -> bool;

    fn notify(&self, message: &M) -> Result<(), NotifyError>;
}

impl<M, N> Notifier<M> for Arc<N>
where
    N: Notifier<M> + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn cares(&self, topic: Topic) -> bool {
        (**self).cares(topic)
    }

    fn notify(&self, message: &M) -> Result<(), NotifyError> {
        (**self).notify(message)
    }
}

/// Ordered list of notifiers.
pub struct NotifierBus<M> {
    notifiers: Vec<Arc<dyn Notifier<M>>>,
}

impl<M> NotifierBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a notifier (builder style).
    pub fn add_notifier(mut self, notifier: impl Notifier<M> + 'static) -> Self {
        self.register(notifier);
        self
    }

    /// Append several notifiers, keeping their order.
    pub fn add_notifiers<I>(mut self, notifiers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Notifier<M>>>,
    {
        self.notifiers.extend(notifiers);
        self
    }

    pub fn register(&mut self, notifier: impl Notifier<M> + 'static) -> &mut Self {
        self.notifiers.push(Arc::new(notifier));
        self
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl<M: Topical> NotifierBus<M> {
    /// Deliver `message` to every notifier that cares about its topic.
    ///
    /// Returns how many notifiers received it.
    pub fn publish(&self, message: &M) -> Result<usize, NotifyError> {
        let topic = message.topic();
        let mut delivered = 0;

        for notifier in self.notifiers.iter().filter(|n| n.cares(topic)) {
            notifier.notify(message)?;
            delivered += 1;
        }

        Ok(delivered)
    }
}

impl<M> Default for NotifierBus<M> {
    fn default() -> Self {
        Self {
            notifiers: Vec::new(),
        }
    }
}

impl<M> Clone for NotifierBus<M> {
    fn clone(&self) -> Self {
        Self {
            notifiers: self.notifiers.clone(),
        }
    }
}

impl<M> core::fmt::Debug for NotifierBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.notifiers.iter().map(|n| n.name()))
            .finish()
    }
}

/// Notifier backed by a closure.
pub struct FnNotifier<M, F> {
    name: String,
    topics: Vec<Topic>,
    callback: F,
    _message: PhantomData<fn(&M)>,
}

/// Build a notifier from a closure caring about `topics`.
pub fn notifier_fn<M, F>(
    name: impl Into<String>,
    topics: impl IntoIterator<Item = Topic>,
    callback: F,
) -> FnNotifier<M, F>
where
    F: Fn(&M) -> Result<(), NotifyError> + Send + Sync,
{
    FnNotifier {
        name: name.into(),
        topics: topics.into_iter().collect(),
        callback,
        _message: PhantomData,
    }
}

impl<M, F> Notifier<M> for FnNotifier<M, F>
where
    F: Fn(&M) -> Result<(), NotifyError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn cares(&self, topic: Topic) -> bool {
        self.topics.contains(&topic)
    }

    fn notify(&self, message: &M) -> Result<(), NotifyError> {
        (self.callback)(message)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    struct Ping(Topic);

    impl Topical for Ping {
        fn topic(&self) -> Topic {
            self.0
        }
    }

    fn recorder(
        name: &'static str,
        topics: impl IntoIterator<Item = Topic>,
        log: Arc<Mutex<Vec<&'static str>>>,
    ) -> impl Notifier<Ping> {
        notifier_fn(name, topics, move |_: &Ping| {
            log.lock().unwrap().push(name);
            Ok(())
        })
    }

    #[test]
    fn delivers_in_registration_order_to_interested_notifiers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = NotifierBus::new()
            .add_notifier(recorder("first", Topic::ALL, log.clone()))
            .add_notifier(recorder("only-failed", [Topic::JobFailed], log.clone()))
            .add_notifier(recorder("last", [Topic::JobStarted], log.clone()));

        assert_eq!(bus.publish(&Ping(Topic::JobStarted)).unwrap(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "last"]);

        log.lock().unwrap().clear();
        assert_eq!(bus.publish(&Ping(Topic::JobFailed)).unwrap(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "only-failed"]);
    }

    #[test]
    fn failing_notifier_stops_fan_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = NotifierBus::new()
            .add_notifier(notifier_fn("broken", Topic::ALL, |msg: &Ping| {
                Err(NotifyError::new("broken", msg.0, "downstream unavailable"))
            }))
            .add_notifier(recorder("after", Topic::ALL, log.clone()));

        let err = bus.publish(&Ping(Topic::JobFinished)).unwrap_err();
        assert_eq!(err.notifier, "broken");
        assert_eq!(err.topic, Topic::JobFinished);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_bus_delivers_nothing() {
        let bus: NotifierBus<Ping> = NotifierBus::default();
        assert!(bus.is_empty());
        assert_eq!(bus.publish(&Ping(Topic::JobStarted)).unwrap(), 0);
    }
}
