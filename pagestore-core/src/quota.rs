//! Logical size quota
//!
//! A tenant may cap the logical size either per timeline or summed over all
//! of its timelines. Batches that do not grow the logical size are always
//! admitted, so writers can free space after hitting the limit.

use crate::size::SizeTracker;
use crate::{PageStoreError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// What the logical size limit applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    #[default]
    Timeline,
    Tenant,
}

/// Admission check for ingest batches of one tenant
pub struct QuotaGuard {
    limit: Option<u64>,
    scope: QuotaScope,
    members: Mutex<Vec<Weak<SizeTracker>>>,
    /// Serializes check-and-commit across timelines
    admission: Mutex<()>,
}

impl QuotaGuard {
    pub fn new(limit: Option<u64>, scope: QuotaScope) -> Self {
        Self {
            limit,
            scope,
            members: Mutex::new(Vec::new()),
            admission: Mutex::new(()),
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn scope(&self) -> QuotaScope {
        self.scope
    }

    /// Add a timeline's tracker to the tenant-wide sum
    pub fn register(&self, tracker: &Arc<SizeTracker>) {
        let mut members = self.members.lock();
        members.retain(|m| m.strong_count() > 0);
        members.push(Arc::downgrade(tracker));
    }

    /// Logical size summed over all live member timelines
    pub fn tenant_logical_size(&self) -> u64 {
        self.members
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|t| t.logical())
            .sum()
    }

    /// Run `commit` if growing `own` by `growth` bytes stays within the limit
    ///
    /// `commit` runs under the admission lock, so no other batch of the
    /// tenant can be admitted against a stale sum while it runs.
    pub fn admit(
        &self,
        own: &SizeTracker,
        growth: i64,
        commit: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let limit = match self.limit {
            Some(limit) if growth > 0 => limit,
            _ => return commit(),
        };

        let _admission = self.admission.lock();
        let current = match self.scope {
            QuotaScope::Timeline => own.logical(),
            QuotaScope::Tenant => self.tenant_logical_size(),
        };
        let requested = growth as u64;
        if current.saturating_add(requested) > limit {
            return Err(PageStoreError::QuotaExceeded {
                current,
                requested,
                limit,
            });
        }
        commit()
    }
}

impl std::fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("limit", &self.limit)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Delta, Key, Lsn};

    #[test]
    fn test_tenant_scope_sums_timelines() {
        let quota = QuotaGuard::new(Some(1000), QuotaScope::Tenant);
        let a = Arc::new(SizeTracker::new());
        let b = Arc::new(SizeTracker::new());
        quota.register(&a);
        quota.register(&b);

        a.apply(Lsn(1), &[Delta::put(Key::new(1, 1, 0), vec![0u8; 600])], Some(&quota))
            .unwrap();
        let err = b
            .apply(Lsn(1), &[Delta::put(Key::new(1, 1, 0), vec![0u8; 600])], Some(&quota))
            .unwrap_err();
        assert!(matches!(err, PageStoreError::QuotaExceeded { current: 600, .. }));
        assert_eq!(quota.tenant_logical_size(), 600);

        drop(a);
        assert_eq!(quota.tenant_logical_size(), 0);
    }

    #[test]
    fn test_no_limit_admits_everything() {
        let quota = QuotaGuard::new(None, QuotaScope::Timeline);
        let t = Arc::new(SizeTracker::new());
        t.apply(Lsn(1), &[Delta::put(Key::new(1, 1, 0), vec![0u8; 1 << 20])], Some(&quota))
            .unwrap();
        assert_eq!(t.logical(), 1 << 20);
    }
}
