//! C2: distributed locks, the cache-stampede recompute guard, pub/sub, and
//! the worker heartbeat registry. All backed by a single Redis deployment
//! via `fred`.

pub mod heartbeat;
pub mod lock;
pub mod pubsub;
pub mod stampede;

pub use heartbeat::HeartbeatRegistry;
pub use lock::{LockError, LockService};
pub use pubsub::PubSub;
pub use stampede::StampedeGuard;
