//! C5 + C6: the execution dispatcher and its log/progress multiplexer.

pub mod admission;
pub mod dispatcher;
pub mod mux;
pub mod queue;

pub use admission::{AdmissionControl, FixedConcurrencyAdmission, NoopAdmission};
pub use dispatcher::{Dispatcher, DispatcherError};
pub use mux::{LogMultiplexer, MuxConfig, MuxEvent, PublishedEvent};
pub use queue::{QueueError, RedisRunQueue, RunQueue, RunRequest};
