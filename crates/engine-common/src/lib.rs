//! Shared types and ambient-stack plumbing used by every engine crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod tracing_init;

pub use clock::Clock;
pub use error::{EngineError, ErrorKind};

/// Implemented by every config struct so it can be logged safely at startup.
///
/// Mirrors the teacher's `golem_common::SafeDisplay`: `to_safe_string` must
/// never leak secrets (tokens, DSN passwords); `to_safe_string_indented`
/// exists so nested configs compose without each variant re-implementing
/// indentation.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
