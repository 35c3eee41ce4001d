//! Resource lock contract.
//!
//! The engine holds no locks itself. Side effects that touch shared
//! resources (documents, todo lists) go through a [`LockManager`], usually
//! via [`crate::workflow::actions::LockingActionHandler`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    pub success: bool,
    /// Current holder when the lock was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_by: Option<String>,
    /// Monotonically increasing token attached to a successful grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fence_token: Option<u64>,
}

/// Who holds a resource, and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub holder_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub fence_token: u64,
    pub acquired_at: DateTime<Utc>,
}

/// Identifies a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub scope: String,
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceKey {
    pub fn new(
        scope: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock manager unavailable: {0}")]
    Unavailable(String),
}

type LockFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LockError>> + Send + 'a>>;

/// Arbitrates exclusive access to shared resources.
pub trait LockManager: Send + Sync {
    fn acquire<'a>(
        &'a self,
        key: &'a ResourceKey,
        holder_id: &'a str,
        reason: Option<&'a str>,
    ) -> LockFuture<'a, LockGrant>;

    /// Release a lock held by `holder_id`. Returns `false` if it was not held
    /// by that holder.
    fn release<'a>(&'a self, key: &'a ResourceKey, holder_id: &'a str) -> LockFuture<'a, bool>;

    fn status<'a>(&'a self, key: &'a ResourceKey) -> LockFuture<'a, Option<LockStatus>>;
}

// ---------------------------------------------------------------------------
// InMemoryLockManager
// ---------------------------------------------------------------------------

/// Process-local lock manager. Re-acquiring by the current holder succeeds
/// and keeps the original fence token.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    locks: DashMap<ResourceKey, LockStatus>,
    next_fence: AtomicU64,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire_sync(&self, key: &ResourceKey, holder_id: &str, reason: Option<&str>) -> LockGrant {
        match self.locks.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let current = entry.get();
                if current.holder_id == holder_id {
                    LockGrant {
                        success: true,
                        held_by: None,
                        fence_token: Some(current.fence_token),
                    }
                } else {
                    LockGrant {
                        success: false,
                        held_by: Some(current.holder_id.clone()),
                        fence_token: None,
                    }
                }
            }
            Entry::Vacant(entry) => {
                let fence_token = self.next_fence.fetch_add(1, Ordering::SeqCst) + 1;
                entry.insert(LockStatus {
                    holder_id: holder_id.to_string(),
                    reason: reason.map(String::from),
                    fence_token,
                    acquired_at: Utc::now(),
                });
                LockGrant {
                    success: true,
                    held_by: None,
                    fence_token: Some(fence_token),
                }
            }
        }
    }
}

impl LockManager for InMemoryLockManager {
    fn acquire<'a>(
        &'a self,
        key: &'a ResourceKey,
        holder_id: &'a str,
        reason: Option<&'a str>,
    ) -> LockFuture<'a, LockGrant> {
        Box::pin(async move { Ok(self.acquire_sync(key, holder_id, reason)) })
    }

    fn release<'a>(&'a self, key: &'a ResourceKey, holder_id: &'a str) -> LockFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .locks
                .remove_if(key, |_, status| status.holder_id == holder_id)
                .is_some())
        })
    }

    fn status<'a>(&'a self, key: &'a ResourceKey) -> LockFuture<'a, Option<LockStatus>> {
        Box::pin(async move { Ok(self.locks.get(key).map(|s| s.clone())) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> ResourceKey {
        ResourceKey::new("notes", "document", "doc-1")
    }

    #[tokio::test]
    async fn test_acquire_conflict_and_release() {
        let locks = InMemoryLockManager::new();
        let key = doc();

        let first = locks.acquire(&key, "run-a", Some("editing")).await.unwrap();
        assert!(first.success);

        let second = locks.acquire(&key, "run-b", None).await.unwrap();
        assert!(!second.success);
        assert_eq!(second.held_by.as_deref(), Some("run-a"));

        assert!(!locks.release(&key, "run-b").await.unwrap());
        assert!(locks.release(&key, "run-a").await.unwrap());
        assert!(locks.status(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fence_tokens_increase() {
        let locks = InMemoryLockManager::new();
        let key = doc();

        let a = locks.acquire(&key, "a", None).await.unwrap().fence_token.unwrap();
        let again = locks.acquire(&key, "a", None).await.unwrap().fence_token.unwrap();
        assert_eq!(a, again);
        locks.release(&key, "a").await.unwrap();

        let b = locks.acquire(&key, "b", None).await.unwrap().fence_token.unwrap();
        assert!(b > a);

        let status = locks.status(&key).await.unwrap().unwrap();
        assert_eq!(status.holder_id, "b");
        assert_eq!(status.fence_token, b);
    }

    #[tokio::test]
    async fn test_keys_are_scoped() {
        let locks = InMemoryLockManager::new();
        let a = ResourceKey::new("one", "document", "doc-1");
        let b = ResourceKey::new("two", "document", "doc-1");
        assert!(locks.acquire(&a, "x", None).await.unwrap().success);
        assert!(locks.acquire(&b, "y", None).await.unwrap().success);
    }
}
