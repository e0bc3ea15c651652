use crate::access::AccessControlKernel;
use crate::audit::AuditSink;
use crate::entry_store::EntryStore;
use crate::error::KernelError;
use crate::storage::KernelStore;
use crate::types::*;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Cross-notebook watermarked sync engine. `create` enforces the lattice and
/// acyclicity invariants before a subscription is ever written; the sync loop is a
/// single process-wide background task with a bounded worker pool and exponential
/// backoff on repeated failure.
pub struct SubscriptionEngine {
    store: Arc<KernelStore>,
    audit: Arc<AuditSink>,
    access: Arc<AccessControlKernel>,
    entries: Arc<EntryStore>,
    poll_interval_secs: u64,
    concurrency_cap: usize,
    backoff_cap_secs: u64,
    currently_syncing: Arc<AtomicUsize>,
}

impl SubscriptionEngine {
    pub fn new(
        store: Arc<KernelStore>,
        audit: Arc<AuditSink>,
        access: Arc<AccessControlKernel>,
        entries: Arc<EntryStore>,
        poll_interval_secs: u64,
        concurrency_cap: usize,
        backoff_cap_secs: u64,
    ) -> Self {
        Self {
            store,
            audit,
            access,
            entries,
            poll_interval_secs,
            concurrency_cap,
            backoff_cap_secs,
            currently_syncing: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn create(
        &self,
        caller: &str,
        subscriber_notebook: NotebookId,
        source_notebook: NotebookId,
        scope: SubscriptionScope,
        topic_filter: Option<String>,
        discount_factor: f64,
        poll_interval_secs: u64,
    ) -> Result<Subscription, KernelError> {
        if subscriber_notebook == source_notebook {
            return Err(KernelError::conflict("cannot subscribe a notebook to itself"));
        }
        if !(0.0..=1.0).contains(&discount_factor) || discount_factor <= 0.0 {
            return Err(KernelError::invalid("discount_factor must be in (0, 1]"));
        }

        self.access
            .resolve(caller, subscriber_notebook, AccessTier::Admin)
            .await
            .map_err(|_| KernelError::NotFound)?;

        let notebooks = self.store.notebooks.read().await;
        let subscriber = notebooks.get(&subscriber_notebook).cloned().ok_or(KernelError::NotFound)?;
        let source = notebooks.get(&source_notebook).cloned().ok_or(KernelError::NotFound)?;
        drop(notebooks);

        if !subscriber.label.dominates(&source.label) {
            return Err(KernelError::InsufficientClearance);
        }

        let subscriptions = self.store.subscriptions.read().await;
        let duplicate = subscriptions
            .values()
            .any(|s| s.subscriber_notebook == subscriber_notebook && s.source_notebook == source_notebook);
        if duplicate {
            return Err(KernelError::conflict("subscription already exists"));
        }

        if self.creates_cycle(&subscriptions, source_notebook, subscriber_notebook) {
            drop(subscriptions);
            return Err(KernelError::conflict("subscription would create a cycle"));
        }
        drop(subscriptions);

        let subscription = Subscription {
            id: Uuid::new_v4(),
            subscriber_notebook,
            source_notebook,
            scope,
            topic_filter,
            discount_factor,
            poll_interval_secs: poll_interval_secs.max(1),
            base_poll_interval_secs: poll_interval_secs.max(1),
            watermark_sequence: 0,
            sync_status: SyncStatus::Idle,
            last_error: None,
            mirrored_count: 0,
            last_sync_at: Utc::now() - chrono::Duration::seconds(poll_interval_secs.max(1) as i64 + 1),
            created_at: Utc::now(),
        };
        self.store
            .subscriptions
            .write()
            .await
            .insert(subscription.id, subscription.clone());

        self.audit
            .record(
                AuditEvent::new("subscription.created", subscription.id.to_string())
                    .actor(caller)
                    .notebook(subscriber_notebook),
            )
            .await;

        Ok(subscription)
    }

    /// Reachability search from `source` back to `subscriber`: if `source` can
    /// already reach `subscriber` via existing subscription edges, adding
    /// `subscriber -> source` would close a cycle.
    fn creates_cycle(
        &self,
        subscriptions: &std::collections::HashMap<SubscriptionId, Subscription>,
        source: NotebookId,
        subscriber: NotebookId,
    ) -> bool {
        let mut visited = std::collections::HashSet::new();
        let mut frontier = vec![source];
        while let Some(current) = frontier.pop() {
            if !visited.insert(current) {
                continue;
            }
            if current == subscriber {
                return true;
            }
            for sub in subscriptions.values().filter(|s| s.subscriber_notebook == current) {
                frontier.push(sub.source_notebook);
            }
        }
        false
    }

    pub async fn list(&self, notebook: NotebookId) -> Vec<Subscription> {
        self.store
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.subscriber_notebook == notebook)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: SubscriptionId) -> Result<Subscription, KernelError> {
        self.store.subscriptions.read().await.get(&id).cloned().ok_or(KernelError::NotFound)
    }

    pub async fn delete(&self, caller: &str, id: SubscriptionId) -> Result<(), KernelError> {
        let subscriber = self.get(id).await?.subscriber_notebook;
        self.access
            .resolve(caller, subscriber, AccessTier::Admin)
            .await
            .map_err(|_| KernelError::NotFound)?;
        self.store.subscriptions.write().await.remove(&id);
        self.store.mirrored_entries.write().await.retain(|_, m| m.subscription != id);
        Ok(())
    }

    /// Spawns the single process-wide sync loop. Returns the cancellation token the
    /// caller should trigger on teardown.
    pub fn spawn_sync_loop(self: Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.poll_interval_secs));
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_due_subscriptions().await;
                    }
                }
            }
        });
        token
    }

    async fn run_due_subscriptions(&self) {
        let now = Utc::now();
        let due: Vec<SubscriptionId> = {
            let subscriptions = self.store.subscriptions.read().await;
            let available_slots = self
                .concurrency_cap
                .saturating_sub(self.currently_syncing.load(Ordering::SeqCst));
            let mut due: Vec<&Subscription> = subscriptions
                .values()
                .filter(|s| s.sync_status != SyncStatus::Suspended)
                .filter(|s| {
                    now.signed_duration_since(s.last_sync_at).num_seconds() >= s.poll_interval_secs as i64
                })
                .collect();
            due.sort_by_key(|s| s.last_sync_at);
            due.truncate(available_slots);
            due.into_iter().map(|s| s.id).collect()
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency_cap.max(1)));
        let mut handles = Vec::new();
        for id in due {
            let permit = semaphore.clone().acquire_owned().await.unwrap();
            self.currently_syncing.fetch_add(1, Ordering::SeqCst);
            let this = self.clone_refs();
            handles.push(tokio::spawn(async move {
                this.sync_one(id).await;
                drop(permit);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn clone_refs(&self) -> SyncWorker {
        SyncWorker {
            store: self.store.clone(),
            audit: self.audit.clone(),
            entries: self.entries.clone(),
            backoff_cap_secs: self.backoff_cap_secs,
            currently_syncing: self.currently_syncing.clone(),
        }
    }

    async fn sync_one(&self, id: SubscriptionId) {
        self.clone_refs().sync_one(id).await;
    }

    /// Exposed for an explicit `trigger sync` command outside the poll cadence.
    pub async fn trigger_sync(&self, id: SubscriptionId) -> Result<(), KernelError> {
        self.get(id).await?;
        self.clone_refs().sync_one(id).await;
        Ok(())
    }
}

/// Owns only the handles a single sync iteration needs; kept separate so the
/// bounded worker pool in `run_due_subscriptions` can fan out without holding a
/// borrow across `.await` points on `self`.
struct SyncWorker {
    store: Arc<KernelStore>,
    audit: Arc<AuditSink>,
    entries: Arc<EntryStore>,
    backoff_cap_secs: u64,
    currently_syncing: Arc<AtomicUsize>,
}

impl SyncWorker {
    async fn sync_one(&self, id: SubscriptionId) {
        let result = self.sync_inner(id).await;

        let mut subscriptions = self.store.subscriptions.write().await;
        if let Some(sub) = subscriptions.get_mut(&id) {
            match result {
                Ok(()) => {
                    sub.sync_status = SyncStatus::Idle;
                    sub.last_error = None;
                    sub.poll_interval_secs = sub.base_poll_interval_secs;
                }
                Err(e) => {
                    sub.sync_status = SyncStatus::Error;
                    sub.last_error = Some(e.to_string());
                    sub.poll_interval_secs = (sub.poll_interval_secs * 2).min(self.backoff_cap_secs);
                    warn!(subscription = %id, error = %e, "subscription sync failed; backing off");
                }
            }
            sub.last_sync_at = Utc::now();
        }
        self.currently_syncing.fetch_sub(1, Ordering::SeqCst);
    }

    async fn sync_inner(&self, id: SubscriptionId) -> Result<(), KernelError> {
        {
            let mut subscriptions = self.store.subscriptions.write().await;
            let sub = subscriptions.get_mut(&id).ok_or(KernelError::NotFound)?;
            sub.sync_status = SyncStatus::Syncing;
        }

        let (subscriber_notebook, source_notebook, watermark, scope, topic_filter, discount_factor, sub_id) = {
            let subscriptions = self.store.subscriptions.read().await;
            let sub = subscriptions.get(&id).ok_or(KernelError::NotFound)?;
            (
                sub.subscriber_notebook,
                sub.source_notebook,
                sub.watermark_sequence,
                sub.scope,
                sub.topic_filter.clone(),
                sub.discount_factor,
                sub.id,
            )
        };

        let page = self.entries.observe(source_notebook, watermark, 1000).await?;

        let mut new_watermark = watermark;
        let mut mirrored = 0u64;
        for change in &page.changes {
            if let Some(prefix) = &topic_filter {
                let matches = change
                    .topic
                    .as_ref()
                    .map(|t| t == prefix || t.starts_with(&format!("{prefix}/")))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }

            let source_entry = self.entries.get_entry(change.entry_id, source_notebook).await?;
            let content = if scope == SubscriptionScope::Entries {
                Some(source_entry.content.clone())
            } else {
                None
            };
            let claims = if matches!(scope, SubscriptionScope::Claims | SubscriptionScope::Entries) {
                source_entry.claims.clone()
            } else {
                Vec::new()
            };
            let embedding = if matches!(scope, SubscriptionScope::Claims | SubscriptionScope::Entries) {
                source_entry.embedding.clone()
            } else {
                None
            };

            let mirror = MirroredEntry {
                id: source_entry.id,
                subscriber_notebook,
                subscription: sub_id,
                source_notebook,
                source_entry: source_entry.id,
                topic: source_entry.topic.clone(),
                content,
                claims,
                embedding,
                source_sequence: source_entry.sequence,
                discount_factor,
                tombstoned: false,
                updated_at: Utc::now(),
            };
            self.store.mirrored_entries.write().await.insert(mirror.id, mirror);
            mirrored += 1;
            new_watermark = new_watermark.max(source_entry.sequence);
        }

        let mut subscriptions = self.store.subscriptions.write().await;
        if let Some(sub) = subscriptions.get_mut(&id) {
            sub.watermark_sequence = new_watermark;
            sub.mirrored_count += mirrored;
        }
        drop(subscriptions);

        if mirrored > 0 {
            info!(subscription = %id, mirrored, "subscription sync mirrored entries");
            self.audit
                .record(
                    AuditEvent::new("subscription.synced", id.to_string())
                        .notebook(subscriber_notebook)
                        .detail(serde_json::json!({ "mirrored": mirrored, "watermark": new_watermark })),
                )
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use std::path::PathBuf;

    async fn harness() -> (Arc<SubscriptionEngine>, Arc<KernelStore>) {
        let store = KernelStore::bootstrap(&StorageConfig::Memory).await.unwrap();
        let audit = Arc::new(
            AuditSink::bootstrap(store.clone(), 1024, 16, 50, PathBuf::from("/tmp/kernel-test-sub.jsonl")).await,
        );
        let access = Arc::new(AccessControlKernel::new(store.clone(), audit.clone(), 30));
        let entries = Arc::new(EntryStore::new(store.clone(), audit.clone(), 64));
        (
            Arc::new(SubscriptionEngine::new(store.clone(), audit, access, entries, 5, 10, 3600)),
            store,
        )
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
                created_at: Utc::now(),
            },
        );
        id
    }

    #[tokio::test]
    async fn lattice_enforcement_blocks_downward_subscription() {
        let (engine, store) = harness().await;
        let s = seed_notebook(&store, "alice", SecurityLabel::new(ClassificationLevel::Internal, [])).await;
        let t = seed_notebook(
            &store,
            "alice",
            SecurityLabel::new(ClassificationLevel::Secret, ["ALPHA".to_string()]),
        )
        .await;

        let ok = engine
            .create("alice", t, s, SubscriptionScope::Catalog, None, 1.0, 5)
            .await;
        assert!(ok.is_ok());

        let bad = engine
            .create("alice", s, t, SubscriptionScope::Catalog, None, 1.0, 5)
            .await;
        assert_eq!(bad.err().map(|e| e.to_string()), Some(KernelError::InsufficientClearance.to_string()));
    }

    #[tokio::test]
    async fn compartment_mismatch_is_rejected() {
        let (engine, store) = harness().await;
        let t = seed_notebook(
            &store,
            "alice",
            SecurityLabel::new(ClassificationLevel::Secret, ["ALPHA".to_string()]),
        )
        .await;
        let u = seed_notebook(
            &store,
            "alice",
            SecurityLabel::new(ClassificationLevel::Internal, ["ALPHA".to_string(), "BRAVO".to_string()]),
        )
        .await;

        let result = engine
            .create("alice", t, u, SubscriptionScope::Catalog, None, 1.0, 5)
            .await;
        assert!(matches!(result, Err(KernelError::InsufficientClearance)));
    }

    #[tokio::test]
    async fn cyclic_subscription_is_rejected() {
        let (engine, store) = harness().await;
        let a = seed_notebook(&store, "alice", SecurityLabel::new(ClassificationLevel::Internal, [])).await;
        let b = seed_notebook(&store, "alice", SecurityLabel::new(ClassificationLevel::Internal, [])).await;

        engine.create("alice", a, b, SubscriptionScope::Catalog, None, 1.0, 5).await.unwrap();
        let result = engine.create("alice", b, a, SubscriptionScope::Catalog, None, 1.0, 5).await;
        assert!(matches!(result, Err(KernelError::Conflict(_))));
    }

    #[tokio::test]
    async fn successful_sync_resets_backoff_to_base_interval() {
        let (engine, store) = harness().await;
        let source = seed_notebook(&store, "alice", SecurityLabel::new(ClassificationLevel::Internal, [])).await;
        let subscriber = seed_notebook(&store, "alice", SecurityLabel::new(ClassificationLevel::Internal, [])).await;

        let sub = engine
            .create("alice", subscriber, source, SubscriptionScope::Catalog, None, 1.0, 5)
            .await
            .unwrap();

        {
            let mut subs = store.subscriptions.write().await;
            let sub = subs.get_mut(&sub.id).unwrap();
            sub.poll_interval_secs = 80;
            sub.sync_status = SyncStatus::Error;
            sub.last_error = Some("boom".into());
        }

        engine.trigger_sync(sub.id).await.unwrap();

        let synced = engine.get(sub.id).await.unwrap();
        assert_eq!(synced.poll_interval_secs, synced.base_poll_interval_secs);
        assert_eq!(synced.poll_interval_secs, 5);
        assert_eq!(synced.sync_status, SyncStatus::Idle);
        assert!(synced.last_error.is_none());
    }
}
