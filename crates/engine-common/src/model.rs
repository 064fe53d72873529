//! Identifiers and small value types shared across every component (C1-C8).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique id of a run. ULID/UUID per spec §6; backed by a UUIDv7 so ids sort
/// roughly by creation time without needing a separate ULID dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// An org id, or `Global` — the engine's two-level scoping model (spec §3, §9).
///
/// `Global` is a distinct value from any `Org(_)`, matching the data model's
/// invariant that a NULL org column and a real org id never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgScope {
    Global,
    Org(Uuid),
}

impl OrgScope {
    pub fn is_global(&self) -> bool {
        matches!(self, OrgScope::Global)
    }
}

impl fmt::Display for OrgScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrgScope::Global => write!(f, "global"),
            OrgScope::Org(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing, gap-free per `RunId` (spec §3 Log Record, §8 I1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    pub fn next(self) -> Self {
        SequenceNumber(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The run status machine from spec §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    CompletedWithErrors,
    Timeout,
    Cancelling,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success
                | RunStatus::Failed
                | RunStatus::CompletedWithErrors
                | RunStatus::Timeout
                | RunStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition per the status machine in
    /// spec §3. Enforced by the registry (`transition_status`); kept here so
    /// both the registry and its callers can pre-check without round-tripping
    /// to storage.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Pending, Cancelled) => true,
            (Running, Success | Failed | CompletedWithErrors | Timeout) => true,
            (Running, Cancelling) => true,
            (Cancelling, Cancelled) => true,
            // A stuck-run sweep (spec §4.7) that finds the owning pool's
            // heartbeat gone can never observe the pool's own terminal
            // report, so it reclaims a `Cancelling` run directly as `Failed`.
            (Cancelling, Failed) => true,
            // A run that already reached a terminal state cannot transition
            // further: the final outcome wins (spec §5, cancellation semantics).
            _ => false,
        }
    }
}

/// What a run executes: a named workflow module, or transient inline code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunTarget {
    Module {
        path: String,
        function_name: String,
    },
    Inline {
        code_blob_id: String,
        function_name: String,
    },
}

/// Entity types a module store record may hold (spec §3 Module).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleEntityType {
    Module,
    Workflow,
    Form,
    AppFile,
    Agent,
}

/// Resource accounting captured per run (spec §3 Run attributes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_memory_bytes: u64,
    pub cpu_seconds: f64,
    pub duration_ms: u64,
    pub ai_token_usage: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_machine_matches_spec() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Cancelled));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelling));
        assert!(RunStatus::Cancelling.can_transition_to(RunStatus::Cancelled));
        assert!(RunStatus::Cancelling.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn org_scope_global_distinct_from_any_org() {
        let g = OrgScope::Global;
        let o = OrgScope::Org(Uuid::nil());
        assert_ne!(g, o);
    }

    #[test]
    fn sequence_numbers_are_gap_free_by_construction() {
        let first = SequenceNumber::FIRST;
        let second = first.next();
        assert_eq!(first.0 + 1, second.0);
    }
}
