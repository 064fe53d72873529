//! Optional per-org admission control (spec §4.5 "optional per-org
//! admission/quota"). The dispatcher consults this before handing a run to
//! the pool; a `NoopAdmission` is wired in when no quota policy is
//! configured.

use async_trait::async_trait;
use dashmap::DashMap;
use engine_common::model::OrgScope;
use std::sync::atomic::{AtomicUsize, Ordering};

#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Called before a run is dispatched. `true` admits it; `false` asks
    /// the caller to back the request off and retry later.
    async fn admit(&self, org: OrgScope) -> bool;

    /// Called once the run reaches a terminal state, releasing whatever
    /// slot `admit` reserved.
    async fn release(&self, org: OrgScope);
}

pub struct NoopAdmission;

#[async_trait]
impl AdmissionControl for NoopAdmission {
    async fn admit(&self, _org: OrgScope) -> bool {
        true
    }

    async fn release(&self, _org: OrgScope) {}
}

/// A simple fixed per-org concurrency cap, enforced in-process. Multi-node
/// deployments would back this with a shared counter (e.g. a Redis
/// `INCR`/`DECR` pair) instead of the in-memory map used here.
pub struct FixedConcurrencyAdmission {
    limit: usize,
    in_flight: DashMap<OrgScopeKey, AtomicUsize>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct OrgScopeKey(Option<uuid::Uuid>);

impl From<OrgScope> for OrgScopeKey {
    fn from(org: OrgScope) -> Self {
        match org {
            OrgScope::Global => OrgScopeKey(None),
            OrgScope::Org(id) => OrgScopeKey(Some(id)),
        }
    }
}

impl FixedConcurrencyAdmission {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: DashMap::new(),
        }
    }
}

#[async_trait]
impl AdmissionControl for FixedConcurrencyAdmission {
    async fn admit(&self, org: OrgScope) -> bool {
        let counter = self
            .in_flight
            .entry(org.into())
            .or_insert_with(|| AtomicUsize::new(0));
        let current = counter.fetch_add(1, Ordering::SeqCst);
        if current >= self.limit {
            counter.fetch_sub(1, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    async fn release(&self, org: OrgScope) {
        if let Some(counter) = self.in_flight.get(&OrgScopeKey::from(org)) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org() -> OrgScope {
        OrgScope::Org(uuid::Uuid::now_v7())
    }

    #[tokio::test]
    async fn noop_admission_always_admits() {
        let admission = NoopAdmission;
        assert!(admission.admit(org()).await);
        assert!(admission.admit(OrgScope::Global).await);
    }

    #[tokio::test]
    async fn fixed_concurrency_admits_up_to_limit_then_rejects() {
        let admission = FixedConcurrencyAdmission::new(2);
        let org = org();
        assert!(admission.admit(org).await);
        assert!(admission.admit(org).await);
        assert!(!admission.admit(org).await);
    }

    #[tokio::test]
    async fn fixed_concurrency_release_frees_a_slot() {
        let admission = FixedConcurrencyAdmission::new(1);
        let org = org();
        assert!(admission.admit(org).await);
        assert!(!admission.admit(org).await);

        admission.release(org).await;
        assert!(admission.admit(org).await);
    }

    #[tokio::test]
    async fn fixed_concurrency_tracks_orgs_independently() {
        let admission = FixedConcurrencyAdmission::new(1);
        let org_a = org();
        let org_b = org();
        assert!(admission.admit(org_a).await);
        assert!(admission.admit(org_b).await);
        assert!(!admission.admit(org_a).await);
        assert!(!admission.admit(org_b).await);
    }
}
