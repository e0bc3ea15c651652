use crate::access::AccessControlKernel;
use crate::audit::AuditSink;
use crate::entry_store::EntryStore;
use crate::error::KernelError;
use crate::storage::KernelStore;
use crate::types::*;
use chrono::Utc;
use std::sync::Arc;

/// External-contribution quarantine and approval/rejection workflow. The
/// gate only decides whether an incoming write enters the pipeline immediately
/// (`approved`) or waits (`pending`) — the engine is responsible for skipping
/// `DISTILL_CLAIMS` enqueue for `pending` entries. Once a decision is made, the
/// gate itself transitions the entry's own `review_status` to match the review
/// row, since `browse`/`observe`/neighbor search all filter on that field.
pub struct ReviewGate {
    store: Arc<KernelStore>,
    audit: Arc<AuditSink>,
    access: Arc<AccessControlKernel>,
    entries: Arc<EntryStore>,
}

impl ReviewGate {
    pub fn new(
        store: Arc<KernelStore>,
        audit: Arc<AuditSink>,
        access: Arc<AccessControlKernel>,
        entries: Arc<EntryStore>,
    ) -> Self {
        Self { store, audit, access, entries }
    }

    /// Decides the `review_status` a new entry should be written with.
    pub async fn classify_submission(
        &self,
        author: &str,
        notebook: &Notebook,
    ) -> Result<ReviewStatus, KernelError> {
        if author == notebook.owner {
            return Ok(ReviewStatus::Approved);
        }

        if self.access.resolve(author, notebook.id, AccessTier::Admin).await.is_ok() {
            return Ok(ReviewStatus::Approved);
        }

        if let Some(group) = notebook.owning_group {
            let memberships = self.store.group_memberships.read().await;
            if memberships.iter().any(|m| m.group == group && m.principal == author) {
                return Ok(ReviewStatus::Approved);
            }
        }

        Ok(ReviewStatus::Pending)
    }

    pub async fn record_submission(
        &self,
        entry: EntryId,
        notebook: NotebookId,
        author: &str,
        status: ReviewStatus,
    ) -> Result<(), KernelError> {
        if status == ReviewStatus::Pending {
            self.store.reviews.write().await.insert(
                entry,
                EntryReview {
                    entry,
                    notebook,
                    submitted_by: author.to_string(),
                    status,
                    submitted_at: Utc::now(),
                    decided_at: None,
                    decided_by: None,
                },
            );
        }
        Ok(())
    }

    pub async fn list_pending(&self, caller: &str, notebook: NotebookId) -> Result<Vec<EntryReview>, KernelError> {
        self.access.resolve(caller, notebook, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;
        let reviews = self.store.reviews.read().await;
        Ok(reviews
            .values()
            .filter(|r| r.notebook == notebook && r.status == ReviewStatus::Pending)
            .cloned()
            .collect())
    }

    /// Returns the updated review status; the engine enqueues `DISTILL_CLAIMS`
    /// when the result is `Approved`.
    pub async fn approve(&self, caller: &str, entry: EntryId) -> Result<EntryReview, KernelError> {
        self.decide(caller, entry, ReviewStatus::Approved).await
    }

    /// No rejection reason is ever returned to the submitter (information-flow
    /// prevention).
    pub async fn reject(&self, caller: &str, entry: EntryId) -> Result<EntryReview, KernelError> {
        self.decide(caller, entry, ReviewStatus::Rejected).await
    }

    async fn decide(&self, caller: &str, entry: EntryId, status: ReviewStatus) -> Result<EntryReview, KernelError> {
        let notebook = {
            let reviews = self.store.reviews.read().await;
            reviews.get(&entry).map(|r| r.notebook).ok_or(KernelError::NotFound)?
        };
        self.access.resolve(caller, notebook, AccessTier::Admin).await.map_err(|_| KernelError::NotFound)?;

        let mut reviews = self.store.reviews.write().await;
        let review = reviews.get_mut(&entry).ok_or(KernelError::NotFound)?;
        review.status = status;
        review.decided_at = Some(Utc::now());
        review.decided_by = Some(caller.to_string());
        let updated = review.clone();
        drop(reviews);

        self.entries
            .update_entry(entry, |e| {
                e.review_status = status;
                Ok(())
            })
            .await?;

        self.audit
            .record(
                AuditEvent::new(
                    if status == ReviewStatus::Approved { "review.approved" } else { "review.rejected" },
                    entry.to_string(),
                )
                .actor(caller)
                .notebook(notebook),
            )
            .await;

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn harness() -> (ReviewGate, Arc<KernelStore>, Arc<AccessControlKernel>) {
        let store = KernelStore::bootstrap(&StorageConfig::Memory).await.unwrap();
        let audit = Arc::new(
            AuditSink::bootstrap(store.clone(), 1024, 16, 50, PathBuf::from("/tmp/kernel-test-review.jsonl")).await,
        );
        let access = Arc::new(AccessControlKernel::new(store.clone(), audit.clone(), 30));
        let entries = Arc::new(EntryStore::new(store.clone(), audit.clone(), 64));
        (ReviewGate::new(store.clone(), audit, access.clone(), entries), store, access)
    }

    #[tokio::test]
    async fn non_member_submission_is_quarantined() {
        let (gate, store, _access) = harness().await;
        let group = Uuid::new_v4();
        let notebook_id = Uuid::new_v4();
        let notebook = Notebook {
            id: notebook_id,
            name: "n".into(),
            owner: "owner".into(),
            label: SecurityLabel::new(ClassificationLevel::Internal, []),
            owning_group: Some(group),
            current_sequence: 0,
            created_at: chrono::Utc::now(),
        };
        store.notebooks.write().await.insert(notebook_id, notebook.clone());
        store.access_grants.write().await.insert(
            (notebook_id, "p".to_string()),
            AccessGrant { notebook: notebook_id, principal: "p".into(), tier: AccessTier::ReadWrite, granted_at: chrono::Utc::now() },
        );

        let status = gate.classify_submission("p", &notebook).await.unwrap();
        assert_eq!(status, ReviewStatus::Pending);
    }

    #[tokio::test]
    async fn group_member_submission_is_approved() {
        let (gate, store, _access) = harness().await;
        let group = Uuid::new_v4();
        let notebook_id = Uuid::new_v4();
        let notebook = Notebook {
            id: notebook_id,
            name: "n".into(),
            owner: "owner".into(),
            label: SecurityLabel::new(ClassificationLevel::Internal, []),
            owning_group: Some(group),
            current_sequence: 0,
            created_at: chrono::Utc::now(),
        };
        store.notebooks.write().await.insert(notebook_id, notebook.clone());
        store.group_memberships.write().await.push(GroupMembership {
            org: Uuid::new_v4(),
            group,
            principal: "p".into(),
            role: MembershipRole::Member,
        });

        let status = gate.classify_submission("p", &notebook).await.unwrap();
        assert_eq!(status, ReviewStatus::Approved);
    }

    #[tokio::test]
    async fn approval_unlocks_the_entry_itself() {
        let (gate, store, _access) = harness().await;
        let entries = Arc::new(EntryStore::new(store.clone(), store_audit(&store).await, 64));
        let notebook_id = Uuid::new_v4();
        let notebook = Notebook {
            id: notebook_id,
            name: "n".into(),
            owner: "owner".into(),
            label: SecurityLabel::new(ClassificationLevel::Internal, []),
            owning_group: None,
            current_sequence: 0,
            created_at: chrono::Utc::now(),
        };
        store.notebooks.write().await.insert(notebook_id, notebook);

        let entry = entries
            .insert_entry(
                notebook_id,
                "p",
                NewEntry {
                    content: "body".into(),
                    mime: MimeKind::PlainText,
                    topic: None,
                    references: Vec::new(),
                    revision_of: None,
                    fragment_of: None,
                    fragment_index: None,
                    asserted_classification: None,
                },
                ReviewStatus::Pending,
            )
            .await
            .unwrap();
        gate.record_submission(entry.id, notebook_id, "p", ReviewStatus::Pending).await.unwrap();

        let decided = gate.approve("owner", entry.id).await.unwrap();
        assert_eq!(decided.status, ReviewStatus::Approved);

        let stored = entries.get_entry(entry.id, notebook_id).await.unwrap();
        assert_eq!(stored.review_status, ReviewStatus::Approved);

        let visible = entries.browse(notebook_id, &EntryFilter::default()).await.unwrap();
        assert!(visible.iter().any(|e| e.id == entry.id));
    }

    async fn store_audit(store: &Arc<KernelStore>) -> Arc<AuditSink> {
        Arc::new(
            AuditSink::bootstrap(store.clone(), 1024, 16, 50, PathBuf::from("/tmp/kernel-test-review-entries.jsonl"))
                .await,
        )
    }
}
