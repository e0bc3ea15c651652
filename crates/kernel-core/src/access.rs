use crate::audit::AuditSink;
use crate::storage::KernelStore;
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::info;

/// Deny reasons resolved internally; the transport layer collapses every non-`Ok`
/// variant into the same opaque response (existence concealment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotFound,
    NoAcl,
    InsufficientTier,
    InsufficientClearance,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::NoAcl => "no_acl",
            Self::InsufficientTier => "insufficient_tier",
            Self::InsufficientClearance => "insufficient_clearance",
        }
    }
}

pub type AccessResult = Result<(), DenyReason>;

struct CacheEntry {
    label: SecurityLabel,
    expires_at: Instant,
}

/// Process-local, thread-safe clearance cache with 30-second sliding expiration
/// (default). Explicit eviction on grant/revoke; a flush clears every entry.
/// Stale reads are accepted within the window — revocation is not instantaneous,
/// by design.
pub struct ClearanceCache {
    ttl: Duration,
    entries: RwLock<HashMap<(PrincipalId, OrgId), CacheEntry>>,
}

impl ClearanceCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, principal: &str, org: OrgId) -> Option<SecurityLabel> {
        let entries = self.entries.read().await;
        let entry = entries.get(&(principal.to_string(), org))?;
        if entry.expires_at < Instant::now() {
            return None;
        }
        Some(entry.label.clone())
    }

    pub async fn put(&self, principal: &str, org: OrgId, label: SecurityLabel) {
        let mut entries = self.entries.write().await;
        entries.insert(
            (principal.to_string(), org),
            CacheEntry {
                label,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub async fn evict(&self, principal: &str, org: OrgId) {
        self.entries.write().await.remove(&(principal.to_string(), org));
    }

    pub async fn flush(&self) {
        self.entries.write().await.clear();
    }
}

/// The single `resolve` entry point of the access control kernel.
pub struct AccessControlKernel {
    store: Arc<KernelStore>,
    audit: Arc<AuditSink>,
    cache: ClearanceCache,
}

impl AccessControlKernel {
    pub fn new(store: Arc<KernelStore>, audit: Arc<AuditSink>, clearance_cache_ttl_secs: u64) -> Self {
        Self {
            store,
            audit,
            cache: ClearanceCache::new(clearance_cache_ttl_secs),
        }
    }

    pub fn cache(&self) -> &ClearanceCache {
        &self.cache
    }

    pub async fn resolve(
        &self,
        principal: &str,
        notebook_id: NotebookId,
        required_tier: AccessTier,
    ) -> AccessResult {
        let notebooks = self.store.notebooks.read().await;
        let Some(notebook) = notebooks.get(&notebook_id).cloned() else {
            drop(notebooks);
            self.deny(principal, notebook_id, DenyReason::NotFound).await;
            return Err(DenyReason::NotFound);
        };
        drop(notebooks);

        if notebook.owner == principal {
            return Ok(());
        }

        let Some(effective_tier) = self.effective_tier(principal, &notebook).await else {
            self.deny(principal, notebook_id, DenyReason::NoAcl).await;
            return Err(DenyReason::NotFound);
        };

        if !effective_tier.at_least(required_tier) {
            self.deny(principal, notebook_id, DenyReason::InsufficientTier).await;
            return Err(DenyReason::InsufficientTier);
        }

        let Some(org) = self.owning_org(&notebook).await else {
            // No owning group means no organization-scoped clearance gate applies.
            return Ok(());
        };

        let clearance = self.clearance_for(principal, org).await;
        let dominates = clearance.map(|label| label.dominates(&notebook.label)).unwrap_or(false);
        if !dominates {
            self.deny(principal, notebook_id, DenyReason::InsufficientClearance).await;
            return Err(DenyReason::InsufficientClearance);
        }

        Ok(())
    }

    /// `None` means no grant exists at all (direct or inherited) — strictly below
    /// `existence` — as distinct from an explicit `existence`-tier grant.
    async fn effective_tier(&self, principal: &str, notebook: &Notebook) -> Option<AccessTier> {
        let direct = self
            .store
            .access_grants
            .read()
            .await
            .get(&(notebook.id, principal.to_string()))
            .map(|g| g.tier);

        let inherited = match notebook.owning_group {
            Some(group) => self.inherited_tier(principal, group).await,
            None => None,
        };

        match (direct, inherited) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Walks descendants of the owning group; admin membership anywhere in that
    /// subtree inherits `admin`, plain membership inherits `read_write`.
    async fn inherited_tier(&self, principal: &str, owning_group: GroupId) -> Option<AccessTier> {
        let edges = self.store.group_edges.read().await;
        let memberships = self.store.group_memberships.read().await;

        let mut visited = std::collections::HashSet::new();
        let mut frontier = vec![(owning_group, 0usize)];
        let mut best: Option<AccessTier> = None;

        while let Some((group, depth)) = frontier.pop() {
            if depth > 64 || !visited.insert(group) {
                continue;
            }
            for membership in memberships.iter().filter(|m| m.group == group && m.principal == principal) {
                let tier = match membership.role {
                    MembershipRole::Admin => AccessTier::Admin,
                    MembershipRole::Member => AccessTier::ReadWrite,
                };
                best = Some(best.map(|b| b.max(tier)).unwrap_or(tier));
            }
            for edge in edges.iter().filter(|e| e.parent == group) {
                frontier.push((edge.child, depth + 1));
            }
        }

        best
    }

    async fn owning_org(&self, notebook: &Notebook) -> Option<OrgId> {
        let group_id = notebook.owning_group?;
        self.store.groups.read().await.get(&group_id).map(|g| g.org)
    }

    async fn clearance_for(&self, principal: &str, org: OrgId) -> Option<SecurityLabel> {
        if let Some(cached) = self.cache.get(principal, org).await {
            return Some(cached);
        }
        let stored = self
            .store
            .clearances
            .read()
            .await
            .get(&(principal.to_string(), org))
            .map(|c| c.label.clone());
        if let Some(label) = &stored {
            self.cache.put(principal, org, label.clone()).await;
        }
        stored
    }

    async fn deny(&self, principal: &str, notebook: NotebookId, reason: DenyReason) {
        info!(principal, notebook = %notebook, reason = reason.as_str(), "access.denied");
        self.audit
            .record(
                AuditEvent::new("access.denied", notebook.to_string())
                    .actor(principal)
                    .notebook(notebook)
                    .detail(serde_json::json!({ "reason": reason.as_str() })),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn harness() -> (AccessControlKernel, Arc<KernelStore>) {
        let store = KernelStore::bootstrap(&StorageConfig::Memory).await.unwrap();
        let audit = Arc::new(
            AuditSink::bootstrap(store.clone(), 1024, 16, 50, PathBuf::from("/tmp/kernel-test-access.jsonl")).await,
        );
        (AccessControlKernel::new(store.clone(), audit, 30), store)
    }

    async fn seed_notebook(store: &Arc<KernelStore>, owner: &str, label: SecurityLabel) -> NotebookId {
        let id = Uuid::new_v4();
        store.notebooks.write().await.insert(
            id,
            Notebook {
                id,
                name: "n".into(),
                owner: owner.to_string(),
                label,
                owning_group: None,
                current_sequence: 0,
                created_at: chrono::Utc::now(),
            },
        );
        id
    }

    #[tokio::test]
    async fn owner_always_passes() {
        let (kernel, store) = harness().await;
        let notebook = seed_notebook(&store, "alice", SecurityLabel::new(ClassificationLevel::Secret, [])).await;
        assert!(kernel.resolve("alice", notebook, AccessTier::Admin).await.is_ok());
    }

    #[tokio::test]
    async fn missing_notebook_and_missing_grant_yield_same_deny_shape() {
        let (kernel, store) = harness().await;
        let notebook = seed_notebook(&store, "alice", SecurityLabel::new(ClassificationLevel::Internal, [])).await;

        let missing = kernel.resolve("bob", Uuid::new_v4(), AccessTier::Read).await;
        let unauthorized = kernel.resolve("bob", notebook, AccessTier::Read).await;

        assert_eq!(missing, Err(DenyReason::NotFound));
        assert_eq!(unauthorized, Err(DenyReason::NotFound));
    }

    #[tokio::test]
    async fn direct_grant_allows_required_tier() {
        let (kernel, store) = harness().await;
        let notebook = seed_notebook(&store, "alice", SecurityLabel::new(ClassificationLevel::Internal, [])).await;
        store.access_grants.write().await.insert(
            (notebook, "bob".to_string()),
            AccessGrant {
                notebook,
                principal: "bob".to_string(),
                tier: AccessTier::Read,
                granted_at: chrono::Utc::now(),
            },
        );

        assert!(kernel.resolve("bob", notebook, AccessTier::Read).await.is_ok());
        assert_eq!(
            kernel.resolve("bob", notebook, AccessTier::ReadWrite).await,
            Err(DenyReason::InsufficientTier)
        );
    }

    #[tokio::test]
    async fn clearance_below_notebook_label_is_denied() {
        let (kernel, store) = harness().await;
        let org = Uuid::new_v4();
        let group = Uuid::new_v4();
        store.organizations.write().await.insert(
            org,
            Organization { id: org, name: "o".into(), owner: "alice".into(), created_at: chrono::Utc::now() },
        );
        store.groups.write().await.insert(
            group,
            Group { id: group, org, name: "g".into(), created_at: chrono::Utc::now() },
        );

        let notebook_id = Uuid::new_v4();
        store.notebooks.write().await.insert(
            notebook_id,
            Notebook {
                id: notebook_id,
                name: "n".into(),
                owner: "alice".into(),
                label: SecurityLabel::new(ClassificationLevel::Secret, ["ALPHA".to_string()]),
                owning_group: Some(group),
                current_sequence: 0,
                created_at: chrono::Utc::now(),
            },
        );
        store.access_grants.write().await.insert(
            (notebook_id, "bob".to_string()),
            AccessGrant { notebook: notebook_id, principal: "bob".into(), tier: AccessTier::Admin, granted_at: chrono::Utc::now() },
        );
        store.clearances.write().await.insert(
            ("bob".to_string(), org),
            PrincipalClearance {
                principal: "bob".into(),
                org,
                label: SecurityLabel::new(ClassificationLevel::Internal, []),
                granted_at: chrono::Utc::now(),
            },
        );

        assert_eq!(
            kernel.resolve("bob", notebook_id, AccessTier::Read).await,
            Err(DenyReason::InsufficientClearance)
        );
    }
}
