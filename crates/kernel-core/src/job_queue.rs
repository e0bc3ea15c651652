use crate::audit::AuditSink;
use crate::error::KernelError;
use crate::storage::KernelStore;
use crate::types::*;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Persistent typed work queue with lease/retry/timeout semantics. Claiming
/// is the queue's one atomic operation: select-oldest-pending, filter by type and
/// by the claiming agent's label dominance, transition to `in_progress`, record the
/// lease. Lease ownership lives in the row; no in-memory handle is authoritative.
pub struct JobQueue {
    store: Arc<KernelStore>,
    audit: Arc<AuditSink>,
    lease_timeout_secs: u64,
    max_retries: u32,
}

impl JobQueue {
    pub fn new(store: Arc<KernelStore>, audit: Arc<AuditSink>, lease_timeout_secs: u64, max_retries: u32) -> Self {
        Self {
            store,
            audit,
            lease_timeout_secs,
            max_retries,
        }
    }

    pub async fn enqueue(
        &self,
        notebook: NotebookId,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Job, KernelError> {
        let job = Job {
            id: Uuid::new_v4(),
            notebook,
            job_type,
            payload,
            status: JobStatus::Pending,
            lease: None,
            retry_count: 0,
            max_retries: self.max_retries,
            error: None,
            created_at: Utc::now(),
        };
        self.store.jobs.write().await.insert(job.id, job.clone());
        self.store.mirror.mirror_job(&job).await?;
        Ok(job)
    }

    /// Timeout reclamation runs before every claim attempt: any `in_progress` job
    /// past its lease timeout returns to `pending` with its retry counter unchanged.
    pub async fn reclaim_timed_out(&self, notebook: NotebookId) -> Result<u64, KernelError> {
        let now = Utc::now();
        let mut jobs = self.store.jobs.write().await;
        let mut reclaimed = 0u64;
        for job in jobs.values_mut().filter(|j| j.notebook == notebook) {
            if job.status == JobStatus::InProgress {
                if let Some(lease) = &job.lease {
                    if lease.expired(now) {
                        job.status = JobStatus::Pending;
                        job.lease = None;
                        reclaimed += 1;
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    pub async fn claim_next(
        &self,
        notebook: NotebookId,
        type_filter: Option<JobType>,
        worker_id: &str,
        agent_id: Option<&str>,
        agent_label: Option<&SecurityLabel>,
        notebook_label: &SecurityLabel,
    ) -> Result<Option<Job>, KernelError> {
        self.reclaim_timed_out(notebook).await?;

        if let Some(agent_label) = agent_label {
            if !agent_label.dominates(notebook_label) {
                return Ok(None);
            }
        }

        let mut jobs = self.store.jobs.write().await;
        let mut candidates: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|j| j.notebook == notebook)
            .filter(|j| j.status == JobStatus::Pending)
            .filter(|j| type_filter.map(|t| t == j.job_type).unwrap_or(true))
            .collect();
        candidates.sort_by_key(|j| j.created_at);

        let Some(job) = candidates.into_iter().next() else {
            return Ok(None);
        };

        job.status = JobStatus::InProgress;
        job.lease = Some(JobLease {
            worker_id: worker_id.to_string(),
            agent_id: agent_id.map(|a| a.to_string()),
            claimed_at: Utc::now(),
            timeout_secs: self.lease_timeout_secs,
        });

        let claimed = job.clone();
        drop(jobs);
        self.store.mirror.mirror_job(&claimed).await?;
        Ok(Some(claimed))
    }

    /// Marks a job completed and returns the job for orchestrator interpretation.
    /// Follow-up enqueues are the orchestrator's responsibility, invoked in the same
    /// logical transaction by the caller (see `Orchestrator::complete`).
    pub async fn mark_completed(&self, job_id: JobId, worker_id: &str) -> Result<Job, KernelError> {
        let mut jobs = self.store.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(KernelError::NotFound)?;
        verify_lease(job, worker_id)?;
        job.status = JobStatus::Completed;
        job.lease = None;
        let completed = job.clone();
        drop(jobs);
        self.store.mirror.mirror_job(&completed).await?;
        Ok(completed)
    }

    pub async fn fail(&self, job_id: JobId, worker_id: &str, error: &str) -> Result<Job, KernelError> {
        let mut jobs = self.store.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(KernelError::NotFound)?;
        verify_lease(job, worker_id)?;

        job.lease = None;
        job.error = Some(error.to_string());
        if job.retry_count < job.max_retries {
            job.retry_count += 1;
            job.status = JobStatus::Pending;
        } else {
            job.status = JobStatus::Failed;
        }
        let updated = job.clone();
        drop(jobs);
        self.store.mirror.mirror_job(&updated).await?;

        self.audit
            .record(
                AuditEvent::new("job.failed", job_id.to_string())
                    .notebook(updated.notebook)
                    .detail(serde_json::json!({ "error": error, "retry_count": updated.retry_count })),
            )
            .await;

        Ok(updated)
    }

    pub async fn retry_failed(&self, notebook: NotebookId) -> Result<u64, KernelError> {
        let mut jobs = self.store.jobs.write().await;
        let mut retried = 0u64;
        for job in jobs
            .values_mut()
            .filter(|j| j.notebook == notebook && j.status == JobStatus::Failed)
        {
            job.status = JobStatus::Pending;
            job.retry_count = 0;
            job.error = None;
            retried += 1;
        }
        Ok(retried)
    }

    pub async fn stats(&self, notebook: NotebookId) -> Result<QueueStats, KernelError> {
        let jobs = self.store.jobs.read().await;
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| j.notebook == notebook) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::InProgress => stats.in_progress += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            *stats.by_type.entry(format!("{:?}", job.job_type)).or_insert(0) += 1;
        }
        Ok(stats)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job, KernelError> {
        self.store
            .jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(KernelError::NotFound)
    }
}

fn verify_lease(job: &Job, worker_id: &str) -> Result<(), KernelError> {
    match &job.lease {
        Some(lease) if lease.worker_id == worker_id => Ok(()),
        Some(_) => Err(KernelError::conflict("job is leased by a different worker")),
        None => Err(KernelError::conflict("job is not currently leased")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use std::path::PathBuf;

    async fn harness() -> JobQueue {
        let store = KernelStore::bootstrap(&StorageConfig::Memory).await.unwrap();
        let audit = Arc::new(
            AuditSink::bootstrap(store.clone(), 1024, 16, 50, PathBuf::from("/tmp/kernel-test-jobqueue.jsonl")).await,
        );
        JobQueue::new(store, audit, 300, 3)
    }

    fn public_label() -> SecurityLabel {
        SecurityLabel::new(ClassificationLevel::Public, [])
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_completed() {
        let queue = harness().await;
        let notebook = Uuid::new_v4();
        queue
            .enqueue(notebook, JobType::DistillClaims, serde_json::json!({}))
            .await
            .unwrap();

        let claimed = queue
            .claim_next(notebook, None, "worker-a", None, None, &public_label())
            .await
            .unwrap()
            .unwrap();
        let second = queue
            .claim_next(notebook, None, "worker-b", None, None, &public_label())
            .await
            .unwrap();
        assert!(second.is_none());

        queue.mark_completed(claimed.id, "worker-a").await.unwrap();
        let stats = queue.stats(notebook).await.unwrap();
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn failure_retries_then_terminally_fails() {
        let queue = harness().await;
        let notebook = Uuid::new_v4();
        queue
            .enqueue(notebook, JobType::EmbedClaims, serde_json::json!({}))
            .await
            .unwrap();

        for attempt in 0..3 {
            let claimed = queue
                .claim_next(notebook, None, "worker-a", None, None, &public_label())
                .await
                .unwrap()
                .unwrap();
            let job = queue.fail(claimed.id, "worker-a", "boom").await.unwrap();
            assert_eq!(job.retry_count, attempt + 1);
            assert_eq!(job.status, JobStatus::Pending);
        }

        let claimed = queue
            .claim_next(notebook, None, "worker-a", None, None, &public_label())
            .await
            .unwrap()
            .unwrap();
        let job = queue.fail(claimed.id, "worker-a", "boom").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn timed_out_lease_is_reclaimed() {
        let queue = harness().await;
        let notebook = Uuid::new_v4();
        queue
            .enqueue(notebook, JobType::EmbedClaims, serde_json::json!({}))
            .await
            .unwrap();

        let claimed = queue
            .claim_next(notebook, None, "worker-a", None, None, &public_label())
            .await
            .unwrap()
            .unwrap();

        {
            let mut jobs = queue.store.jobs.write().await;
            let job = jobs.get_mut(&claimed.id).unwrap();
            job.lease.as_mut().unwrap().claimed_at = Utc::now() - chrono::Duration::seconds(301);
        }

        let reclaimed = queue.reclaim_timed_out(notebook).await.unwrap();
        assert_eq!(reclaimed, 1);

        let rescued = queue
            .claim_next(notebook, None, "worker-b", None, None, &public_label())
            .await
            .unwrap();
        assert!(rescued.is_some());
    }

    #[tokio::test]
    async fn agent_label_gates_claiming() {
        let queue = harness().await;
        let notebook = Uuid::new_v4();
        queue
            .enqueue(notebook, JobType::DistillClaims, serde_json::json!({}))
            .await
            .unwrap();

        let low_clearance = SecurityLabel::new(ClassificationLevel::Public, []);
        let secret_notebook = SecurityLabel::new(ClassificationLevel::Secret, []);

        let claimed = queue
            .claim_next(notebook, None, "worker-a", None, Some(&low_clearance), &secret_notebook)
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn lease_records_the_claiming_agent() {
        let queue = harness().await;
        let notebook = Uuid::new_v4();
        queue
            .enqueue(notebook, JobType::DistillClaims, serde_json::json!({}))
            .await
            .unwrap();

        let claimed = queue
            .claim_next(notebook, None, "worker-a", Some("agent-7"), None, &public_label())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(claimed.lease.as_ref().unwrap().agent_id.as_deref(), Some("agent-7"));
    }
}
