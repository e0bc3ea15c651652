use crate::entry_store::EntryStore;
use crate::error::KernelError;
use crate::job_queue::JobQueue;
use crate::storage::KernelStore;
use crate::types::*;
use std::sync::Arc;

/// Routes the results of `DISTILL_CLAIMS`/`EMBED_CLAIMS`/`COMPARE_CLAIMS` jobs into
/// follow-up state transitions and follow-up jobs. Every transition this
/// orchestrator performs and the follow-up jobs it enqueues are applied against the
/// same in-memory store before the job is marked completed, so a crash between job
/// completion and follow-up enqueue cannot happen: either both land or neither does.
pub struct Orchestrator {
    store: Arc<KernelStore>,
    entries: Arc<EntryStore>,
    jobs: Arc<JobQueue>,
    neighbor_k: usize,
    similarity_threshold: f64,
    min_comparisons_for_integration: u32,
    friction_threshold: f64,
    review_threshold: f64,
    max_claims_per_entry: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<KernelStore>,
        entries: Arc<EntryStore>,
        jobs: Arc<JobQueue>,
        neighbor_k: usize,
        similarity_threshold: f64,
        min_comparisons_for_integration: u32,
        friction_threshold: f64,
        review_threshold: f64,
        max_claims_per_entry: usize,
    ) -> Self {
        Self {
            store,
            entries,
            jobs,
            neighbor_k,
            similarity_threshold,
            min_comparisons_for_integration,
            friction_threshold,
            review_threshold,
            max_claims_per_entry,
        }
    }

    /// `complete(job)`: applies the worker-reported result and enqueues any
    /// follow-up work in one logical step.
    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JobResult,
        entry_id: EntryId,
    ) -> Result<Job, KernelError> {
        let job = self.jobs.mark_completed(job_id, worker_id).await?;

        match result {
            JobResult::DistillClaims { claims } => {
                self.apply_distill(job.notebook, entry_id, claims).await?;
            }
            JobResult::EmbedClaims { embedding } => {
                self.apply_embed(job.notebook, entry_id, embedding).await?;
            }
            JobResult::CompareClaims {
                compare_against_id,
                entropy,
                friction,
                contradictions,
            } => {
                self.apply_compare(entry_id, compare_against_id, entropy, friction, contradictions)
                    .await?;
            }
            JobResult::ClassifyTopic { topic } => {
                self.entries
                    .update_entry(entry_id, |e| {
                        e.topic = Some(topic);
                        Ok(())
                    })
                    .await?;
            }
        }

        Ok(job)
    }

    async fn apply_distill(
        &self,
        notebook: NotebookId,
        entry_id: EntryId,
        claims: Vec<Claim>,
    ) -> Result<(), KernelError> {
        if claims.len() > self.max_claims_per_entry {
            return Err(KernelError::invalid("claim list exceeds bound"));
        }

        let entry = self.entries.get_entry(entry_id, notebook).await?;

        if let Some(fragment_of) = entry.fragment_of {
            let artifact = self.entries.get_entry(fragment_of, notebook).await?;
            let siblings = self.fragment_siblings(fragment_of, notebook).await?;
            let mut context_claims = siblings
                .iter()
                .filter(|f| f.fragment_index.unwrap_or(0) < entry.fragment_index.unwrap_or(0))
                .flat_map(|f| f.claims.clone())
                .collect::<Vec<_>>();
            context_claims.extend(claims.clone());

            self.write_claims(entry_id, claims).await?;

            let next_fragment = siblings
                .iter()
                .find(|f| f.fragment_index == Some(entry.fragment_index.unwrap_or(0) + 1));

            match next_fragment {
                Some(next) => {
                    self.jobs
                        .enqueue(
                            notebook,
                            JobType::DistillClaims,
                            serde_json::json!({
                                "entry_id": next.id,
                                "context_claims": context_claims,
                            }),
                        )
                        .await?;
                }
                None => {
                    self.jobs
                        .enqueue(
                            notebook,
                            JobType::DistillClaims,
                            serde_json::json!({
                                "entry_id": artifact.id,
                                "context_claims": context_claims,
                            }),
                        )
                        .await?;
                }
            }
            return Ok(());
        }

        self.write_claims(entry_id, claims.clone()).await?;
        self.jobs
            .enqueue(
                notebook,
                JobType::EmbedClaims,
                serde_json::json!({
                    "entry_id": entry_id,
                    "claim_texts": claims.iter().map(|c| c.text.clone()).collect::<Vec<_>>(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn fragment_siblings(&self, artifact_id: EntryId, notebook: NotebookId) -> Result<Vec<Entry>, KernelError> {
        let filter = EntryFilter {
            fragment_of: Some(artifact_id),
            limit: Some(1024),
            ..Default::default()
        };
        // fragments are not review-gated independently of the artifact; browse()
        // filters to approved entries, which matches fragment visibility rules.
        self.entries.browse(notebook, &filter).await
    }

    async fn write_claims(&self, entry_id: EntryId, claims: Vec<Claim>) -> Result<(), KernelError> {
        self.entries
            .update_entry(entry_id, |e| {
                if e.claim_status != ClaimStatus::Pending {
                    return Err(KernelError::conflict(
                        "claims already distilled for this entry",
                    ));
                }
                e.claims = claims;
                e.claim_status = ClaimStatus::Distilled;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn apply_embed(
        &self,
        notebook: NotebookId,
        entry_id: EntryId,
        embedding: Vec<f64>,
    ) -> Result<(), KernelError> {
        self.entries
            .update_entry(entry_id, |e| {
                e.embedding = Some(embedding.clone());
                Ok(())
            })
            .await?;

        let entry = self.entries.get_entry(entry_id, notebook).await?;
        let embedding = entry.embedding.clone().ok_or_else(|| KernelError::internal("embedding missing after write"))?;

        let mut candidates: Vec<(f64, EntryId, Vec<Claim>, Option<f64>)> = Vec::new();

        for neighbor in self.entries.all_embedded_in_notebook(notebook, entry_id).await {
            if let Some(neighbor_embedding) = &neighbor.embedding {
                let similarity = cosine_similarity(&embedding, neighbor_embedding);
                if similarity > self.similarity_threshold {
                    candidates.push((similarity, neighbor.id, neighbor.claims.clone(), None));
                }
            }
        }

        for mirrored in self.mirrored_claim_scope_candidates(notebook).await {
            if let Some(neighbor_embedding) = &mirrored.embedding {
                let similarity = cosine_similarity(&embedding, neighbor_embedding);
                if similarity > self.similarity_threshold {
                    candidates.push((
                        similarity,
                        mirrored.id,
                        mirrored.claims.clone(),
                        Some(mirrored.discount_factor),
                    ));
                }
            }
        }

        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(self.neighbor_k);

        for (_, neighbor_id, neighbor_claims, discount_factor) in candidates {
            self.jobs
                .enqueue(
                    notebook,
                    JobType::CompareClaims,
                    serde_json::json!({
                        "entry_id": entry_id,
                        "claims_a": entry.claims,
                        "claims_b": neighbor_claims,
                        "compare_against_id": neighbor_id,
                        "discount_factor": discount_factor,
                    }),
                )
                .await?;
        }

        Ok(())
    }

    async fn mirrored_claim_scope_candidates(&self, notebook: NotebookId) -> Vec<MirroredEntry> {
        let subscriptions = self.store.subscriptions.read().await;
        let eligible_subscriptions: std::collections::HashSet<_> = subscriptions
            .values()
            .filter(|s| s.subscriber_notebook == notebook)
            .filter(|s| matches!(s.scope, SubscriptionScope::Claims | SubscriptionScope::Entries))
            .map(|s| s.id)
            .collect();
        drop(subscriptions);

        let mirrored = self.store.mirrored_entries.read().await;
        mirrored
            .values()
            .filter(|m| m.subscriber_notebook == notebook)
            .filter(|m| eligible_subscriptions.contains(&m.subscription))
            .filter(|m| !m.tombstoned)
            .cloned()
            .collect()
    }

    async fn apply_compare(
        &self,
        entry_id: EntryId,
        compare_against_id: EntryId,
        mut entropy: f64,
        mut friction: f64,
        contradictions: Vec<Contradiction>,
    ) -> Result<(), KernelError> {
        let discount_factor = self.discount_factor_for(compare_against_id).await;
        if let Some(discount) = discount_factor {
            entropy *= discount;
            friction *= discount;
        }

        let min_comparisons = self.min_comparisons_for_integration;
        let friction_threshold = self.friction_threshold;
        let review_threshold = self.review_threshold;

        self.entries
            .update_entry(entry_id, |e| {
                e.comparisons.push(Comparison {
                    against: compare_against_id,
                    entropy,
                    friction,
                    contradictions: contradictions.clone(),
                    timestamp: chrono::Utc::now(),
                    discount_factor,
                });
                e.recompute_derived(min_comparisons, friction_threshold, review_threshold);
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn discount_factor_for(&self, compare_against_id: EntryId) -> Option<f64> {
        let mirrored = self.store.mirrored_entries.read().await;
        mirrored
            .values()
            .find(|m| m.id == compare_against_id)
            .map(|m| m.discount_factor)
    }
}

pub(crate) fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::storage::StorageConfig;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn harness() -> (Arc<Orchestrator>, Arc<EntryStore>, Arc<JobQueue>, Arc<KernelStore>) {
        let store = KernelStore::bootstrap(&StorageConfig::Memory).await.unwrap();
        let audit = Arc::new(
            AuditSink::bootstrap(store.clone(), 1024, 16, 50, PathBuf::from("/tmp/kernel-test-orch.jsonl")).await,
        );
        let entries = Arc::new(EntryStore::new(store.clone(), audit.clone(), 64));
        let jobs = Arc::new(JobQueue::new(store.clone(), audit, 300, 3));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            entries.clone(),
            jobs.clone(),
            5,
            0.3,
            1,
            0.2,
            0.2,
            20,
        ));
        (orchestrator, entries, jobs, store)
    }

    async fn seed_notebook(store: &Arc<KernelStore>) -> NotebookId {
        let id = Uuid::new_v4();
        let notebook = Notebook {
            id,
            name: "n".to_string(),
            owner: "owner".to_string(),
            label: SecurityLabel::new(ClassificationLevel::Internal, []),
            owning_group: None,
            current_sequence: 0,
            created_at: chrono::Utc::now(),
        };
        store.notebooks.write().await.insert(id, notebook);
        id
    }

    #[tokio::test]
    async fn distill_then_embed_chains_into_compare_jobs() {
        let (orchestrator, entries, jobs, store) = harness().await;
        let notebook = seed_notebook(&store).await;

        let neighbor_a = entries
            .insert_entry(notebook, "a1", NewEntry::new("x", MimeKind::PlainText), ReviewStatus::Approved)
            .await
            .unwrap();
        entries
            .update_entry(neighbor_a.id, |e| {
                e.embedding = Some(vec![1.0, 0.0, 0.0]);
                e.claims = vec![Claim { text: "a".into(), confidence: 0.9 }];
                Ok(())
            })
            .await
            .unwrap();

        let target = entries
            .insert_entry(notebook, "a2", NewEntry::new("y", MimeKind::PlainText), ReviewStatus::Approved)
            .await
            .unwrap();

        let job = jobs
            .enqueue(notebook, JobType::DistillClaims, serde_json::json!({ "entry_id": target.id }))
            .await
            .unwrap();
        let claimed = jobs
            .claim_next(notebook, None, "w1", None, None, &SecurityLabel::new(ClassificationLevel::Internal, []))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);

        orchestrator
            .complete(
                claimed.id,
                "w1",
                JobResult::DistillClaims {
                    claims: vec![Claim { text: "claim-1".into(), confidence: 0.8 }],
                },
                target.id,
            )
            .await
            .unwrap();

        let stats = jobs.stats(notebook).await.unwrap();
        assert_eq!(stats.pending, 1); // the EMBED_CLAIMS follow-up

        let embed_job = jobs
            .claim_next(notebook, Some(JobType::EmbedClaims), "w1", None, None, &SecurityLabel::new(ClassificationLevel::Internal, []))
            .await
            .unwrap()
            .unwrap();

        orchestrator
            .complete(
                embed_job.id,
                "w1",
                JobResult::EmbedClaims {
                    embedding: vec![0.9, 0.1, 0.0],
                },
                target.id,
            )
            .await
            .unwrap();

        let stats = jobs.stats(notebook).await.unwrap();
        assert_eq!(stats.pending, 1); // one COMPARE_CLAIMS follow-up for the one neighbor
    }

    #[tokio::test]
    async fn compare_result_recomputes_integration_status() {
        let (orchestrator, entries, jobs, store) = harness().await;
        let notebook = seed_notebook(&store).await;

        let target = entries
            .insert_entry(notebook, "a1", NewEntry::new("y", MimeKind::PlainText), ReviewStatus::Approved)
            .await
            .unwrap();
        let neighbor = entries
            .insert_entry(notebook, "a2", NewEntry::new("z", MimeKind::PlainText), ReviewStatus::Approved)
            .await
            .unwrap();

        let job = jobs
            .enqueue(notebook, JobType::CompareClaims, serde_json::json!({}))
            .await
            .unwrap();
        jobs.claim_next(notebook, None, "w1", None, None, &SecurityLabel::new(ClassificationLevel::Internal, []))
            .await
            .unwrap();

        orchestrator
            .complete(
                job.id,
                "w1",
                JobResult::CompareClaims {
                    compare_against_id: neighbor.id,
                    entropy: 0.5,
                    friction: 0.9,
                    contradictions: vec![],
                },
                target.id,
            )
            .await
            .unwrap();

        let updated = entries.get_entry(target.id, notebook).await.unwrap();
        assert_eq!(updated.integration_status, IntegrationStatus::Contested);
        assert!(updated.needs_review);
    }

    #[tokio::test]
    async fn claims_cannot_be_overwritten_once_distilled() {
        let (orchestrator, entries, jobs, store) = harness().await;
        let notebook = seed_notebook(&store).await;
        let target = entries
            .insert_entry(notebook, "a1", NewEntry::new("y", MimeKind::PlainText), ReviewStatus::Approved)
            .await
            .unwrap();

        let job_a = jobs
            .enqueue(notebook, JobType::DistillClaims, serde_json::json!({}))
            .await
            .unwrap();
        jobs.claim_next(notebook, None, "w1", None, None, &SecurityLabel::new(ClassificationLevel::Internal, []))
            .await
            .unwrap();
        orchestrator
            .complete(job_a.id, "w1", JobResult::DistillClaims { claims: vec![] }, target.id)
            .await
            .unwrap();

        let job_b = jobs
            .enqueue(notebook, JobType::DistillClaims, serde_json::json!({}))
            .await
            .unwrap();
        jobs.claim_next(notebook, None, "w1", None, None, &SecurityLabel::new(ClassificationLevel::Internal, []))
            .await
            .unwrap();
        let result = orchestrator
            .complete(job_b.id, "w1", JobResult::DistillClaims { claims: vec![] }, target.id)
            .await;

        assert!(matches!(result, Err(KernelError::Conflict(_))));
    }
}
