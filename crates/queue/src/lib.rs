//! Generic work-item scheduling for chunked uploads.
//!
//! - [`WorkItem`] / [`Queueable`]: per-item lifecycle, progress and retries
//! - [`Queue`]: slot-limited dispatch, retry policy, disconnect backoff
//! - [`Stats`]: aggregate counters recomputed from the queue contents

pub mod backoff;
pub mod event;
pub mod item;
pub mod queue;
pub mod stats;

pub use backoff::{Backoff, BackoffConfig};
pub use event::EventBus;
pub use item::{ItemEvent, ItemState, Outcome, ProgressUpdate, Queueable, WorkItem, percent_of};
pub use queue::{Queue, QueueEvent, QueueOptions, QueueState, Wakeup};
pub use stats::Stats;
