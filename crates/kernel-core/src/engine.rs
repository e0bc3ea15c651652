use crate::access::AccessControlKernel;
use crate::audit::{self, AuditSink};
use crate::config::KernelConfig;
use crate::embedding::{EmbeddingClient, UnavailableEmbeddingClient};
use crate::entry_store::{EntryStore, WriteOutcome};
use crate::error::KernelError;
use crate::job_queue::JobQueue;
use crate::org::OrgGroupService;
use crate::orchestrator::{cosine_similarity, Orchestrator};
use crate::review::ReviewGate;
use crate::storage::KernelStore;
use crate::subscription::SubscriptionEngine;
use crate::types::*;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Top-level bootstrap wiring every subsystem in the dependency order the rest of
/// the crate assumes: audit sink first (everything else emits into it), then the
/// stores that don't depend on access control, then access control itself, then
/// the subsystems that call through it. Mirrors the reference service's single
/// `AppState`/`bootstrap()` entry point.
pub struct KernelEngine {
    config: KernelConfig,
    store: Arc<KernelStore>,
    audit: Arc<AuditSink>,
    access: Arc<AccessControlKernel>,
    entries: Arc<EntryStore>,
    jobs: Arc<JobQueue>,
    orchestrator: Arc<Orchestrator>,
    org: Arc<OrgGroupService>,
    review: Arc<ReviewGate>,
    subscriptions: Arc<SubscriptionEngine>,
    sync_loop_token: Option<CancellationToken>,
    embedding_client: Arc<dyn EmbeddingClient>,
}

impl KernelEngine {
    pub async fn bootstrap(config: KernelConfig, overflow_path: PathBuf) -> Result<Self, KernelError> {
        let store = KernelStore::bootstrap(&config.storage).await?;
        let audit = Arc::new(
            AuditSink::bootstrap(
                store.clone(),
                config.audit_channel_capacity,
                config.audit_batch_size,
                config.audit_flush_interval_ms,
                overflow_path,
            )
            .await,
        );

        let entries = Arc::new(EntryStore::new(store.clone(), audit.clone(), config.traversal_depth_bound));
        let org = Arc::new(OrgGroupService::new(store.clone(), audit.clone()));
        let access = Arc::new(AccessControlKernel::new(store.clone(), audit.clone(), config.clearance_cache_ttl_secs));
        let jobs = Arc::new(JobQueue::new(store.clone(), audit.clone(), config.job_lease_timeout_secs, config.job_max_retries));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            entries.clone(),
            jobs.clone(),
            config.embed_neighbor_k,
            config.embed_similarity_threshold,
            config.min_comparisons_for_integration,
            config.friction_threshold,
            config.review_threshold,
            config.max_claims_per_entry,
        ));
        let review = Arc::new(ReviewGate::new(store.clone(), audit.clone(), access.clone(), entries.clone()));
        let subscriptions = Arc::new(SubscriptionEngine::new(
            store.clone(),
            audit.clone(),
            access.clone(),
            entries.clone(),
            config.subscription_poll_interval_secs,
            config.subscription_concurrency_cap,
            config.subscription_backoff_cap_secs,
        ));

        Ok(Self {
            config,
            store,
            audit,
            access,
            entries,
            jobs,
            orchestrator,
            org,
            review,
            subscriptions,
            sync_loop_token: None,
            embedding_client: Arc::new(UnavailableEmbeddingClient),
        })
    }

    /// Starts the background subscription sync loop. Idempotent: calling twice
    /// replaces the previous loop's cancellation handle (the prior loop keeps
    /// running until dropped, matching the reference service's `spawn()` pattern).
    pub fn start_background_tasks(&mut self) {
        self.sync_loop_token = Some(self.subscriptions.clone().spawn_sync_loop());
    }

    /// Swaps in a real embedding backend for `semantic_search`. Without this the
    /// kernel runs with `UnavailableEmbeddingClient`, which fails every search.
    pub fn set_embedding_client(&mut self, client: Arc<dyn EmbeddingClient>) {
        self.embedding_client = client;
    }

    pub fn shutdown(&mut self) {
        if let Some(token) = self.sync_loop_token.take() {
            token.cancel();
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // ---- Notebooks -----------------------------------------------------

    pub async fn create_notebook(
        &self,
        owner: &str,
        name: &str,
        label: SecurityLabel,
        owning_group: Option<GroupId>,
    ) -> Result<Notebook, KernelError> {
        let notebook = Notebook {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner: owner.to_string(),
            label,
            owning_group,
            current_sequence: 0,
            created_at: Utc::now(),
        };
        self.store.notebooks.write().await.insert(notebook.id, notebook.clone());
        self.audit
            .record(AuditEvent::new("notebook.created", notebook.id.to_string()).actor(owner))
            .await;
        Ok(notebook)
    }

    pub async fn get_notebook(&self, caller: &str, id: NotebookId) -> Result<Notebook, KernelError> {
        self.access.resolve(caller, id, AccessTier::Existence).await.map_err(|_| KernelError::NotFound)?;
        self.store.notebooks.read().await.get(&id).cloned().ok_or(KernelError::NotFound)
    }

    pub async fn delete_notebook(&self, caller: &str, id: NotebookId) -> Result<(), KernelError> {
        self.access.resolve(caller, id, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;
        self.store.notebooks.write().await.remove(&id);
        self.access.cache().flush().await;
        self.audit
            .record(AuditEvent::new("notebook.deleted", id.to_string()).actor(caller).notebook(id))
            .await;
        Ok(())
    }

    pub async fn rename_notebook(&self, caller: &str, id: NotebookId, new_name: &str) -> Result<Notebook, KernelError> {
        self.access.resolve(caller, id, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;
        let mut notebooks = self.store.notebooks.write().await;
        let notebook = notebooks.get_mut(&id).ok_or(KernelError::NotFound)?;
        notebook.name = new_name.to_string();
        let updated = notebook.clone();
        drop(notebooks);
        self.audit
            .record(
                AuditEvent::new("notebook.renamed", id.to_string())
                    .actor(caller)
                    .notebook(id)
                    .detail(serde_json::json!({ "name": new_name })),
            )
            .await;
        Ok(updated)
    }

    pub async fn assign_owning_group(
        &self,
        caller: &str,
        id: NotebookId,
        group: Option<GroupId>,
    ) -> Result<Notebook, KernelError> {
        self.access.resolve(caller, id, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;
        let mut notebooks = self.store.notebooks.write().await;
        let notebook = notebooks.get_mut(&id).ok_or(KernelError::NotFound)?;
        notebook.owning_group = group;
        let updated = notebook.clone();
        drop(notebooks);
        // owning group changes the inherited-tier computation, so stale cached
        // clearances must not outlive the reassignment.
        self.access.cache().flush().await;
        self.audit
            .record(
                AuditEvent::new("notebook.owning_group_assigned", id.to_string())
                    .actor(caller)
                    .notebook(id)
                    .detail(serde_json::json!({ "group": group })),
            )
            .await;
        Ok(updated)
    }

    pub async fn list_notebooks(&self, caller: &str) -> Vec<Notebook> {
        let notebooks = self.store.notebooks.read().await;
        let mut visible = Vec::new();
        for notebook in notebooks.values() {
            if self.access.resolve(caller, notebook.id, AccessTier::Existence).await.is_ok() {
                visible.push(notebook.clone());
            }
        }
        visible
    }

    // ---- Entries ---------------------------------------------------------

    pub async fn write_entry(
        &self,
        caller: &str,
        notebook_id: NotebookId,
        new_entry: NewEntry,
    ) -> Result<WriteOutcome, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::ReadWrite).await.map_err(|_| KernelError::NotFound)?;
        let notebook = self.store.notebooks.read().await.get(&notebook_id).cloned().ok_or(KernelError::NotFound)?;
        let review_status = self.review.classify_submission(caller, &notebook).await?;

        let outcome = self
            .entries
            .write_entry(notebook_id, caller, new_entry, review_status, self.config.fragment_char_threshold)
            .await?;

        for entry in &outcome.entries {
            if review_status == ReviewStatus::Pending {
                self.review.record_submission(entry.id, notebook_id, caller, review_status).await?;
            } else {
                self.jobs
                    .enqueue(
                        notebook_id,
                        JobType::DistillClaims,
                        serde_json::json!({ "entry_id": entry.id }),
                    )
                    .await?;
            }
        }

        Ok(outcome)
    }

    /// Writes up to `batch_request_limit` entries in submission order. Each
    /// entry goes through the same single-entry path (review gate, fragmenting,
    /// job enqueue); a failure partway through leaves the earlier entries in the
    /// batch committed, matching the single-entry endpoint's own atomicity scope.
    pub async fn batch_write_entries(
        &self,
        caller: &str,
        notebook_id: NotebookId,
        new_entries: Vec<NewEntry>,
    ) -> Result<Vec<WriteOutcome>, KernelError> {
        if new_entries.len() > self.config.batch_request_limit {
            return Err(KernelError::invalid("batch exceeds request limit"));
        }
        let mut outcomes = Vec::with_capacity(new_entries.len());
        for new_entry in new_entries {
            outcomes.push(self.write_entry(caller, notebook_id, new_entry).await?);
        }
        Ok(outcomes)
    }

    pub async fn get_entry(&self, caller: &str, notebook_id: NotebookId, entry_id: EntryId) -> Result<Entry, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Read).await.map_err(|_| KernelError::NotFound)?;
        let entry = self.entries.get_entry(entry_id, notebook_id).await?;
        if entry.review_status == ReviewStatus::Pending && entry.author != caller {
            self.access.resolve(caller, notebook_id, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;
        }
        Ok(entry)
    }

    pub async fn revise_entry(
        &self,
        caller: &str,
        notebook_id: NotebookId,
        revision_of: EntryId,
        mut new_entry: NewEntry,
    ) -> Result<WriteOutcome, KernelError> {
        new_entry.revision_of = Some(revision_of);
        self.write_entry(caller, notebook_id, new_entry).await
    }

    pub async fn list_revisions(&self, caller: &str, notebook_id: NotebookId, entry_id: EntryId) -> Result<Vec<Entry>, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Read).await.map_err(|_| KernelError::NotFound)?;
        self.entries.list_revisions(entry_id).await
    }

    pub async fn browse(&self, caller: &str, notebook_id: NotebookId, filter: EntryFilter) -> Result<Vec<Entry>, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Read).await.map_err(|_| KernelError::NotFound)?;
        self.entries.browse(notebook_id, &filter).await
    }

    pub async fn observe(&self, caller: &str, notebook_id: NotebookId, since_sequence: u64) -> Result<ObserveResponse, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Read).await.map_err(|_| KernelError::NotFound)?;
        self.entries.observe(notebook_id, since_sequence, self.config.observe_page_limit).await
    }

    pub async fn references_of(&self, caller: &str, notebook_id: NotebookId, entry_id: EntryId) -> Result<Vec<EntryId>, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Read).await.map_err(|_| KernelError::NotFound)?;
        self.entries.references_of(entry_id).await
    }

    pub async fn referencing(&self, caller: &str, notebook_id: NotebookId, entry_id: EntryId) -> Result<Vec<EntryId>, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Read).await.map_err(|_| KernelError::NotFound)?;
        self.entries.referencing(entry_id).await
    }

    /// Returns claims for up to `batch_request_limit` entries in one call.
    pub async fn claims_batch(
        &self,
        caller: &str,
        notebook_id: NotebookId,
        entry_ids: Vec<EntryId>,
    ) -> Result<Vec<(EntryId, Vec<Claim>)>, KernelError> {
        if entry_ids.len() > self.config.batch_request_limit {
            return Err(KernelError::invalid("batch exceeds request limit"));
        }
        self.access.resolve(caller, notebook_id, AccessTier::Read).await.map_err(|_| KernelError::NotFound)?;
        let mut out = Vec::with_capacity(entry_ids.len());
        for id in entry_ids {
            let entry = self.entries.get_entry(id, notebook_id).await?;
            out.push((id, entry.claims));
        }
        Ok(out)
    }

    /// Server-side embedding of `query`, ranked by cosine similarity against every
    /// embedded entry in the notebook. Fails fast with `UpstreamUnavailable` rather
    /// than queuing the search as background work, since this is a read path and a
    /// waiting caller should not be made to poll.
    pub async fn semantic_search(
        &self,
        caller: &str,
        notebook_id: NotebookId,
        query: &str,
    ) -> Result<Vec<Entry>, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Read).await.map_err(|_| KernelError::NotFound)?;
        let query_embedding = self.embedding_client.embed(query)?;

        let mut scored: Vec<(f64, Entry)> = self
            .entries
            .all_embedded_in_notebook(notebook_id, Uuid::nil())
            .await
            .into_iter()
            .filter_map(|entry| {
                let embedding = entry.embedding.as_ref()?;
                Some((cosine_similarity(&query_embedding, embedding), entry))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.embed_neighbor_k);
        Ok(scored.into_iter().map(|(_, entry)| entry).collect())
    }

    // ---- Jobs --------------------------------------------------------------

    pub async fn claim_job(
        &self,
        notebook_id: NotebookId,
        job_type: Option<JobType>,
        worker_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Option<Job>, KernelError> {
        let notebook = self.store.notebooks.read().await.get(&notebook_id).cloned().ok_or(KernelError::NotFound)?;
        let agent_label = match agent_id {
            Some(id) => self.store.agents.read().await.get(id).map(|a| a.label.clone()),
            None => None,
        };
        self.jobs.claim_next(notebook_id, job_type, worker_id, agent_id, agent_label.as_ref(), &notebook.label).await
    }

    pub async fn complete_job(
        &self,
        worker_id: &str,
        job_id: JobId,
        entry_id: EntryId,
        result: JobResult,
    ) -> Result<Job, KernelError> {
        self.orchestrator.complete(job_id, worker_id, result, entry_id).await
    }

    pub async fn fail_job(&self, worker_id: &str, job_id: JobId, error: &str) -> Result<Job, KernelError> {
        self.jobs.fail(job_id, worker_id, error).await
    }

    pub async fn queue_stats(&self, caller: &str, notebook_id: NotebookId) -> Result<QueueStats, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Read).await.map_err(|_| KernelError::NotFound)?;
        self.jobs.stats(notebook_id).await
    }

    pub async fn retry_failed_jobs(&self, caller: &str, notebook_id: NotebookId) -> Result<u64, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;
        self.jobs.retry_failed(notebook_id).await
    }

    // ---- Access --------------------------------------------------------------

    pub async fn share(
        &self,
        caller: &str,
        notebook_id: NotebookId,
        principal: &str,
        tier: AccessTier,
    ) -> Result<(), KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;
        self.store.access_grants.write().await.insert(
            (notebook_id, principal.to_string()),
            AccessGrant {
                notebook: notebook_id,
                principal: principal.to_string(),
                tier,
                granted_at: Utc::now(),
            },
        );
        self.audit
            .record(
                AuditEvent::new("access.granted", notebook_id.to_string())
                    .actor(caller)
                    .notebook(notebook_id)
                    .detail(serde_json::json!({ "principal": principal, "tier": tier })),
            )
            .await;
        Ok(())
    }

    pub async fn revoke(&self, caller: &str, notebook_id: NotebookId, principal: &str) -> Result<(), KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;
        self.store.access_grants.write().await.remove(&(notebook_id, principal.to_string()));
        self.audit
            .record(
                AuditEvent::new("access.revoked", notebook_id.to_string())
                    .actor(caller)
                    .notebook(notebook_id)
                    .detail(serde_json::json!({ "principal": principal })),
            )
            .await;
        Ok(())
    }

    pub async fn list_grants(&self, caller: &str, notebook_id: NotebookId) -> Result<Vec<AccessGrant>, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;
        Ok(self
            .store
            .access_grants
            .read()
            .await
            .values()
            .filter(|g| g.notebook == notebook_id)
            .cloned()
            .collect())
    }

    // ---- Organizations / Groups ------------------------------------------

    pub async fn create_organization(&self, owner: &str, name: &str) -> Result<Organization, KernelError> {
        self.org.create_organization(owner, name).await
    }

    pub async fn create_group(&self, caller: &str, org: OrgId, name: &str) -> Result<Group, KernelError> {
        self.org.create_group(caller, org, name).await
    }

    pub async fn add_group_member(&self, caller: &str, org: OrgId, group: GroupId, principal: &str, role: MembershipRole) -> Result<(), KernelError> {
        self.org.add_member(caller, org, group, principal, role).await
    }

    pub async fn remove_group_member(&self, caller: &str, org: OrgId, group: GroupId, principal: &str) -> Result<(), KernelError> {
        self.org.remove_member(caller, org, group, principal).await
    }

    pub async fn add_group_edge(&self, caller: &str, org: OrgId, parent: GroupId, child: GroupId) -> Result<(), KernelError> {
        self.org.add_edge(caller, org, parent, child).await
    }

    pub async fn remove_group_edge(&self, caller: &str, org: OrgId, parent: GroupId, child: GroupId) -> Result<(), KernelError> {
        self.org.remove_edge(caller, org, parent, child).await
    }

    // ---- Clearances --------------------------------------------------------

    pub async fn grant_clearance(
        &self,
        caller: &str,
        org: OrgId,
        principal: &str,
        label: SecurityLabel,
    ) -> Result<(), KernelError> {
        let memberships = self.store.group_memberships.read().await;
        let is_org_admin = memberships
            .iter()
            .any(|m| m.org == org && m.principal == caller && m.role == MembershipRole::Admin);
        drop(memberships);
        if !is_org_admin {
            return Err(KernelError::InsufficientTier);
        }

        self.store.clearances.write().await.insert(
            (principal.to_string(), org),
            PrincipalClearance {
                principal: principal.to_string(),
                org,
                label,
                granted_at: Utc::now(),
            },
        );
        self.access.cache().evict(principal, org).await;
        self.audit
            .record(AuditEvent::new("clearance.granted", principal.to_string()).actor(caller))
            .await;
        Ok(())
    }

    pub async fn revoke_clearance(&self, caller: &str, org: OrgId, principal: &str) -> Result<(), KernelError> {
        let memberships = self.store.group_memberships.read().await;
        let is_org_admin = memberships
            .iter()
            .any(|m| m.org == org && m.principal == caller && m.role == MembershipRole::Admin);
        drop(memberships);
        if !is_org_admin {
            return Err(KernelError::InsufficientTier);
        }

        self.store.clearances.write().await.remove(&(principal.to_string(), org));
        self.access.cache().evict(principal, org).await;
        self.audit
            .record(AuditEvent::new("clearance.revoked", principal.to_string()).actor(caller))
            .await;
        Ok(())
    }

    pub async fn list_clearances(&self, org: OrgId) -> Vec<PrincipalClearance> {
        self.store
            .clearances
            .read()
            .await
            .values()
            .filter(|c| c.org == org)
            .cloned()
            .collect()
    }

    pub async fn flush_clearance_cache(&self) {
        self.access.cache().flush().await;
    }

    // ---- Agents --------------------------------------------------------------

    pub async fn register_agent(&self, id: &str, org: OrgId, label: SecurityLabel, infrastructure: &str) -> Result<Agent, KernelError> {
        let agent = Agent {
            id: id.to_string(),
            org,
            label,
            infrastructure: infrastructure.to_string(),
            registered_at: Utc::now(),
        };
        self.store.agents.write().await.insert(agent.id.clone(), agent.clone());
        self.audit.record(AuditEvent::new("agent.registered", agent.id.clone())).await;
        Ok(agent)
    }

    pub async fn list_agents(&self, org: OrgId) -> Vec<Agent> {
        self.store.agents.read().await.values().filter(|a| a.org == org).cloned().collect()
    }

    pub async fn update_agent_label(
        &self,
        caller: &str,
        org: OrgId,
        agent_id: &str,
        label: SecurityLabel,
    ) -> Result<Agent, KernelError> {
        self.org.update_agent_label(caller, org, agent_id, label).await
    }

    pub async fn deregister_agent(&self, id: &str) -> Result<(), KernelError> {
        self.store.agents.write().await.remove(id).ok_or(KernelError::NotFound)?;
        Ok(())
    }

    // ---- Subscriptions --------------------------------------------------------

    pub async fn create_subscription(
        &self,
        caller: &str,
        subscriber_notebook: NotebookId,
        source_notebook: NotebookId,
        scope: SubscriptionScope,
        topic_filter: Option<String>,
        discount_factor: f64,
    ) -> Result<Subscription, KernelError> {
        self.subscriptions
            .create(
                caller,
                subscriber_notebook,
                source_notebook,
                scope,
                topic_filter,
                discount_factor,
                self.config.subscription_poll_interval_secs,
            )
            .await
    }

    pub async fn list_subscriptions(&self, notebook_id: NotebookId) -> Vec<Subscription> {
        self.subscriptions.list(notebook_id).await
    }

    pub async fn get_subscription(&self, id: SubscriptionId) -> Result<Subscription, KernelError> {
        self.subscriptions.get(id).await
    }

    pub async fn trigger_subscription_sync(&self, id: SubscriptionId) -> Result<(), KernelError> {
        self.subscriptions.trigger_sync(id).await
    }

    pub async fn delete_subscription(&self, caller: &str, id: SubscriptionId) -> Result<(), KernelError> {
        self.subscriptions.delete(caller, id).await
    }

    // ---- Reviews --------------------------------------------------------------

    pub async fn list_pending_reviews(&self, caller: &str, notebook_id: NotebookId) -> Result<Vec<EntryReview>, KernelError> {
        self.review.list_pending(caller, notebook_id).await
    }

    pub async fn approve_review(&self, caller: &str, entry_id: EntryId) -> Result<EntryReview, KernelError> {
        let review = self.review.approve(caller, entry_id).await?;
        self.jobs
            .enqueue(review.notebook, JobType::DistillClaims, serde_json::json!({ "entry_id": review.entry }))
            .await?;
        Ok(review)
    }

    pub async fn reject_review(&self, caller: &str, entry_id: EntryId) -> Result<EntryReview, KernelError> {
        self.review.reject(caller, entry_id).await
    }

    // ---- Audit --------------------------------------------------------------

    pub async fn query_audit(&self, caller: &str, notebook_id: NotebookId, filter: AuditFilter) -> Result<Vec<AuditEvent>, KernelError> {
        self.access.resolve(caller, notebook_id, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;
        let mut scoped = filter;
        scoped.notebook = Some(notebook_id);
        let events = self.store.audit_log.read().await;
        Ok(audit::apply_filter(&events, &scoped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;

    async fn harness() -> KernelEngine {
        let config = KernelConfig {
            storage: StorageConfig::Memory,
            ..KernelConfig::default()
        };
        KernelEngine::bootstrap(config, PathBuf::from("/tmp/kernel-test-engine-overflow.jsonl"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rename_notebook_requires_admin_tier() {
        let engine = harness().await;
        let notebook = engine
            .create_notebook("alice", "n", SecurityLabel::new(ClassificationLevel::Internal, []), None)
            .await
            .unwrap();

        let renamed = engine.rename_notebook("alice", notebook.id, "renamed").await.unwrap();
        assert_eq!(renamed.name, "renamed");

        let result = engine.rename_notebook("mallory", notebook.id, "nope").await;
        assert!(matches!(result, Err(KernelError::NotFound)));
    }

    #[tokio::test]
    async fn assign_owning_group_flushes_clearance_cache() {
        let engine = harness().await;
        let notebook = engine
            .create_notebook("alice", "n", SecurityLabel::new(ClassificationLevel::Internal, []), None)
            .await
            .unwrap();
        let org = engine.create_organization("alice", "acme").await.unwrap();
        let group = engine.create_group("alice", org.id, "g").await.unwrap();

        let updated = engine.assign_owning_group("alice", notebook.id, Some(group.id)).await.unwrap();
        assert_eq!(updated.owning_group, Some(group.id));
    }

    #[tokio::test]
    async fn batch_write_rejects_oversized_batches() {
        let engine = harness().await;
        let notebook = engine
            .create_notebook("alice", "n", SecurityLabel::new(ClassificationLevel::Internal, []), None)
            .await
            .unwrap();

        let too_many: Vec<NewEntry> = (0..engine.config().batch_request_limit + 1)
            .map(|i| NewEntry::new(format!("entry {i}"), MimeKind::PlainText))
            .collect();

        let result = engine.batch_write_entries("alice", notebook.id, too_many).await;
        assert!(matches!(result, Err(KernelError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn batch_write_commits_every_entry_in_order() {
        let engine = harness().await;
        let notebook = engine
            .create_notebook("alice", "n", SecurityLabel::new(ClassificationLevel::Internal, []), None)
            .await
            .unwrap();

        let batch = vec![
            NewEntry::new("first", MimeKind::PlainText),
            NewEntry::new("second", MimeKind::PlainText),
        ];
        let outcomes = engine.batch_write_entries("alice", notebook.id, batch).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].entries[0].content, "first");
        assert_eq!(outcomes[1].entries[0].content, "second");
    }

    #[tokio::test]
    async fn claims_batch_returns_claims_per_entry() {
        let engine = harness().await;
        let notebook = engine
            .create_notebook("alice", "n", SecurityLabel::new(ClassificationLevel::Internal, []), None)
            .await
            .unwrap();
        let outcome = engine
            .write_entry("alice", notebook.id, NewEntry::new("content", MimeKind::PlainText))
            .await
            .unwrap();
        let entry_id = outcome.entries[0].id;

        let claims = engine.claims_batch("alice", notebook.id, vec![entry_id]).await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].0, entry_id);
        assert!(claims[0].1.is_empty());
    }

    #[tokio::test]
    async fn semantic_search_fails_fast_without_an_embedding_backend() {
        let engine = harness().await;
        let notebook = engine
            .create_notebook("alice", "n", SecurityLabel::new(ClassificationLevel::Internal, []), None)
            .await
            .unwrap();

        let result = engine.semantic_search("alice", notebook.id, "query text").await;
        assert!(matches!(result, Err(KernelError::UpstreamUnavailable(_))));
    }

    struct FixedEmbeddingClient(Vec<f64>);

    impl EmbeddingClient for FixedEmbeddingClient {
        fn embed(&self, _text: &str) -> Result<Vec<f64>, KernelError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn semantic_search_ranks_by_cosine_similarity_once_a_client_is_wired_in() {
        let mut engine = harness().await;
        engine.set_embedding_client(Arc::new(FixedEmbeddingClient(vec![1.0, 0.0, 0.0])));

        let notebook = engine
            .create_notebook("alice", "n", SecurityLabel::new(ClassificationLevel::Internal, []), None)
            .await
            .unwrap();
        let outcome = engine
            .write_entry("alice", notebook.id, NewEntry::new("near", MimeKind::PlainText))
            .await
            .unwrap();
        let near_id = outcome.entries[0].id;
        engine
            .entries
            .update_entry(near_id, |e| {
                e.embedding = Some(vec![0.9, 0.1, 0.0]);
                Ok(())
            })
            .await
            .unwrap();

        let results = engine.semantic_search("alice", notebook.id, "query text").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, near_id);
    }

    #[tokio::test]
    async fn update_agent_label_requires_org_admin() {
        let engine = harness().await;
        let org = engine.create_organization("alice", "acme").await.unwrap();
        engine
            .register_agent("agent-1", org.id, SecurityLabel::new(ClassificationLevel::Internal, []), "worker-pool-a")
            .await
            .unwrap();

        let result = engine
            .update_agent_label("mallory", org.id, "agent-1", SecurityLabel::new(ClassificationLevel::Secret, []))
            .await;
        assert!(matches!(result, Err(KernelError::InsufficientTier)));

        let updated = engine
            .update_agent_label("alice", org.id, "agent-1", SecurityLabel::new(ClassificationLevel::Secret, []))
            .await
            .unwrap();
        assert_eq!(updated.label.level, ClassificationLevel::Secret);
    }
}
