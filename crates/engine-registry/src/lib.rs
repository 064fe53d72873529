//! C8: the durable run registry — the single writer of truth for the
//! status machine, plus the ordered log table the multiplexer (C6) flushes
//! into.

pub mod log;
pub mod run;

pub use log::{LogRecord, RunLogStore};
pub use run::{Run, RunRegistry, RunRegistryError};
