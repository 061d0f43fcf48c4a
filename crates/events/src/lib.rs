//! Job lifecycle events and the notifier bus that fans them out.

pub mod bus;
pub mod job_event;
pub mod recording;
pub mod topic;

pub use bus::{FnNotifier, Notifier, NotifierBus, NotifyError, notifier_fn};
pub use job_event::{JobEvent, LogNotifier};
pub use recording::RecordingNotifier;
pub use topic::{Topic, Topical};
