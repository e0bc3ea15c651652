use crate::audit::AuditSink;
use crate::error::KernelError;
use crate::storage::KernelStore;
use crate::types::*;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// The immutable, sequence-numbered entry store. Cycles in the reference
/// graph are allowed and intentional; every traversal here carries a visited set
/// and the configured depth bound rather than recursing blindly.
pub struct EntryStore {
    store: Arc<KernelStore>,
    audit: Arc<AuditSink>,
    traversal_depth_bound: usize,
}

pub struct WriteOutcome {
    pub entries: Vec<Entry>,
    pub causal_position: CausalPosition,
}

impl EntryStore {
    pub fn new(store: Arc<KernelStore>, audit: Arc<AuditSink>, traversal_depth_bound: usize) -> Self {
        Self {
            store,
            audit,
            traversal_depth_bound,
        }
    }

    /// Converts HTML to a markdown-like plaintext rendering and splits oversized
    /// content at heading/paragraph boundaries, producing an artifact entry (full
    /// content) plus ordered fragment entries (each referencing the artifact).
    pub async fn write_entry(
        &self,
        notebook: NotebookId,
        author: &str,
        mut new_entry: NewEntry,
        review_status: ReviewStatus,
        fragment_char_threshold: usize,
    ) -> Result<WriteOutcome, KernelError> {
        new_entry.content = normalize_content(&new_entry.content, new_entry.mime);
        new_entry.mime = match new_entry.mime {
            MimeKind::Html => MimeKind::Markdown,
            other => other,
        };

        if new_entry.content.len() <= fragment_char_threshold || new_entry.fragment_of.is_some() {
            let entry = self
                .insert_entry(notebook, author, new_entry, review_status)
                .await?;
            let causal_position = self.causal_position_for(&entry).await?;
            return Ok(WriteOutcome {
                entries: vec![entry],
                causal_position,
            });
        }

        let sections = split_sections(&new_entry.content, fragment_char_threshold);
        let artifact_new = NewEntry {
            content: new_entry.content.clone(),
            mime: new_entry.mime,
            topic: new_entry.topic.clone(),
            references: new_entry.references.clone(),
            revision_of: new_entry.revision_of,
            fragment_of: None,
            fragment_index: None,
            asserted_classification: new_entry.asserted_classification,
        };
        let artifact = self
            .insert_entry(notebook, author, artifact_new, review_status)
            .await?;

        let mut entries = vec![artifact.clone()];
        for (index, section) in sections.into_iter().enumerate() {
            let fragment_new = NewEntry {
                content: section,
                mime: new_entry.mime,
                topic: new_entry.topic.clone(),
                references: Vec::new(),
                revision_of: None,
                fragment_of: Some(artifact.id),
                fragment_index: Some(index as u32),
                asserted_classification: new_entry.asserted_classification,
            };
            let fragment = self
                .insert_entry(notebook, author, fragment_new, review_status)
                .await?;
            entries.push(fragment);
        }

        let causal_position = self.causal_position_for(entries.last().unwrap()).await?;
        Ok(WriteOutcome {
            entries,
            causal_position,
        })
    }

    /// Insert a single physical entry row within one serialized transaction:
    /// increment+read the notebook sequence, validate references/revision/fragment
    /// targets, insert the row, emit an audit event.
    pub async fn insert_entry(
        &self,
        notebook_id: NotebookId,
        author: &str,
        new_entry: NewEntry,
        review_status: ReviewStatus,
    ) -> Result<Entry, KernelError> {
        let lock = self.store.notebook_lock(notebook_id).await;
        let _guard = lock.lock().await;

        let sequence = {
            let mut notebooks = self.store.notebooks.write().await;
            let notebook = notebooks
                .get_mut(&notebook_id)
                .ok_or(KernelError::NotFound)?;

            if let Some(asserted) = new_entry.asserted_classification {
                if asserted > notebook.classification() {
                    return Err(KernelError::invalid(
                        "asserted classification exceeds notebook classification",
                    ));
                }
            }

            notebook.current_sequence += 1;
            notebook.current_sequence
        };

        {
            let entries = self.store.entries.read().await;
            for reference in &new_entry.references {
                match entries.get(reference) {
                    Some(target) if target.notebook == notebook_id => {}
                    _ => return Err(KernelError::invalid("reference targets a foreign or missing entry")),
                }
            }
            if let Some(revision_of) = new_entry.revision_of {
                match entries.get(&revision_of) {
                    Some(target) if target.notebook == notebook_id => {}
                    _ => return Err(KernelError::invalid("revision_of targets a foreign or missing entry")),
                }
            }
            if let Some(fragment_of) = new_entry.fragment_of {
                match entries.get(&fragment_of) {
                    Some(target) if target.notebook == notebook_id => {}
                    _ => return Err(KernelError::invalid("fragment_of targets a foreign or missing entry")),
                }
            }
        }

        let entry = Entry {
            id: Uuid::new_v4(),
            notebook: notebook_id,
            author: author.to_string(),
            content: new_entry.content,
            mime: new_entry.mime,
            topic: new_entry.topic,
            references: new_entry.references,
            revision_of: new_entry.revision_of,
            fragment_of: new_entry.fragment_of,
            fragment_index: new_entry.fragment_index,
            sequence,
            created_at: Utc::now(),
            review_status,
            integration_status: IntegrationStatus::Probation,
            integration_cost: IntegrationCost::default(),
            claims: Vec::new(),
            claim_status: ClaimStatus::Pending,
            embedding: None,
            comparisons: Vec::new(),
            max_friction: 0.0,
            needs_review: false,
        };

        {
            let mut entries = self.store.entries.write().await;
            entries.insert(entry.id, entry.clone());
        }
        {
            let mut index = self.store.notebook_sequence_index.write().await;
            index.entry(notebook_id).or_default().push(entry.id);
        }

        self.store.mirror.mirror_entry(&entry).await?;

        self.audit
            .record(
                AuditEvent::new("entry.inserted", entry.id.to_string())
                    .actor(author)
                    .notebook(notebook_id)
                    .detail(serde_json::json!({ "sequence": entry.sequence })),
            )
            .await;

        Ok(entry)
    }

    pub async fn get_entry(&self, id: EntryId, notebook: NotebookId) -> Result<Entry, KernelError> {
        let entries = self.store.entries.read().await;
        entries
            .get(&id)
            .filter(|e| e.notebook == notebook)
            .cloned()
            .ok_or(KernelError::NotFound)
    }

    pub async fn list_revisions(&self, id: EntryId) -> Result<Vec<Entry>, KernelError> {
        let entries = self.store.entries.read().await;
        let root = entries.get(&id).ok_or(KernelError::NotFound)?;
        let notebook = root.notebook;
        let mut chain = vec![root.clone()];

        let mut cursor = id;
        let mut depth = 0;
        while depth < self.traversal_depth_bound {
            if let Some(next) = entries
                .values()
                .find(|e| e.notebook == notebook && e.revision_of == Some(cursor))
            {
                chain.push(next.clone());
                cursor = next.id;
                depth += 1;
            } else {
                break;
            }
        }
        Ok(chain)
    }

    /// Transitive references with a visited set and depth bound; cycles terminate
    /// traversal instead of recursing forever.
    pub async fn references_of(&self, id: EntryId) -> Result<Vec<EntryId>, KernelError> {
        let entries = self.store.entries.read().await;
        let mut visited = std::collections::HashSet::new();
        let mut frontier = vec![(id, 0usize)];
        let mut out = Vec::new();

        while let Some((current, depth)) = frontier.pop() {
            if depth >= self.traversal_depth_bound || !visited.insert(current) {
                continue;
            }
            let Some(entry) = entries.get(&current) else {
                continue;
            };
            for reference in &entry.references {
                out.push(*reference);
                frontier.push((*reference, depth + 1));
            }
        }
        Ok(out)
    }

    pub async fn referencing(&self, id: EntryId) -> Result<Vec<EntryId>, KernelError> {
        let entries = self.store.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| e.references.contains(&id))
            .map(|e| e.id)
            .collect())
    }

    pub async fn browse(
        &self,
        notebook: NotebookId,
        filter: &EntryFilter,
    ) -> Result<Vec<Entry>, KernelError> {
        let entries = self.store.entries.read().await;
        let mut matched: Vec<Entry> = entries
            .values()
            .filter(|e| e.notebook == notebook)
            .filter(|e| e.review_status == ReviewStatus::Approved)
            .filter(|e| matches_filter(e, filter))
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(matched.len());
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn observe(
        &self,
        notebook_id: NotebookId,
        since_sequence: u64,
        page_limit: usize,
    ) -> Result<ObserveResponse, KernelError> {
        let notebooks = self.store.notebooks.read().await;
        let notebook = notebooks.get(&notebook_id).ok_or(KernelError::NotFound)?;
        let true_current = notebook.current_sequence;
        drop(notebooks);

        let entries = self.store.entries.read().await;
        let mut changes: Vec<&Entry> = entries
            .values()
            .filter(|e| e.notebook == notebook_id)
            .filter(|e| e.sequence > since_sequence)
            .filter(|e| e.review_status == ReviewStatus::Approved)
            .collect();
        changes.sort_by_key(|e| e.sequence);
        changes.truncate(page_limit);

        let current_sequence = changes.last().map(|e| e.sequence).unwrap_or(true_current);
        let notebook_entropy = changes.iter().map(|e| e.integration_cost.catalog_shift).sum();

        let changes = changes
            .into_iter()
            .map(|e| ObservedChange {
                entry_id: e.id,
                operation: if e.revision_of.is_some() {
                    ObserveOperation::Revise
                } else {
                    ObserveOperation::Write
                },
                author: e.author.clone(),
                topic: e.topic.clone(),
                integration_cost: e.integration_cost.clone(),
                causal_position: SequencedPosition { sequence: e.sequence },
                created: e.created_at,
            })
            .collect();

        Ok(ObserveResponse {
            changes,
            notebook_entropy,
            current_sequence,
        })
    }

    async fn causal_position_for(&self, entry: &Entry) -> Result<CausalPosition, KernelError> {
        let index = self.store.notebook_sequence_index.read().await;
        let entries = self.store.entries.read().await;
        let sequence_ids = index.get(&entry.notebook).cloned().unwrap_or_default();

        let entries_since_last_by_author = sequence_ids
            .iter()
            .rev()
            .skip(1)
            .take_while(|id| {
                entries
                    .get(id)
                    .map(|e| e.author != entry.author)
                    .unwrap_or(false)
            })
            .count() as u32;

        let recent_entropy = sequence_ids
            .iter()
            .rev()
            .take(10)
            .filter_map(|id| entries.get(id))
            .map(|e| e.integration_cost.catalog_shift)
            .sum();

        Ok(CausalPosition {
            sequence: entry.sequence,
            activity_context: ActivityContext {
                entries_since_last_by_author,
                total_notebook_entries: sequence_ids.len() as u64,
                recent_entropy,
            },
        })
    }

    /// Apply a claim/embedding/comparison mutation and persist it back.
    pub async fn update_entry<F>(&self, id: EntryId, mutate: F) -> Result<Entry, KernelError>
    where
        F: FnOnce(&mut Entry) -> Result<(), KernelError>,
    {
        let mut entries = self.store.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(KernelError::NotFound)?;
        mutate(entry)?;
        let updated = entry.clone();
        drop(entries);
        self.store.mirror.mirror_entry(&updated).await?;
        Ok(updated)
    }

    pub async fn all_embedded_in_notebook(&self, notebook: NotebookId, exclude: EntryId) -> Vec<Entry> {
        let entries = self.store.entries.read().await;
        entries
            .values()
            .filter(|e| e.notebook == notebook)
            .filter(|e| e.id != exclude)
            .filter(|e| e.review_status == ReviewStatus::Approved)
            .filter(|e| e.embedding.is_some())
            .cloned()
            .collect()
    }
}

fn matches_filter(entry: &Entry, filter: &EntryFilter) -> bool {
    if let Some(query) = &filter.query {
        let haystack = format!("{} {}", entry.content, entry.topic.clone().unwrap_or_default());
        if !haystack.to_lowercase().contains(&query.to_lowercase()) {
            return false;
        }
    }
    if let Some(prefix) = &filter.topic_prefix {
        match &entry.topic {
            Some(topic) if topic == prefix || topic.starts_with(&format!("{prefix}/")) => {}
            _ => return false,
        }
    }
    if let Some(status) = filter.claims_status {
        if entry.claim_status != status {
            return false;
        }
    }
    if let Some(status) = filter.integration_status {
        if entry.integration_status != status {
            return false;
        }
    }
    if let Some(author) = &filter.author {
        if &entry.author != author {
            return false;
        }
    }
    if let Some(min) = filter.sequence_min {
        if entry.sequence < min {
            return false;
        }
    }
    if let Some(max) = filter.sequence_max {
        if entry.sequence > max {
            return false;
        }
    }
    if let Some(fragment_of) = filter.fragment_of {
        if entry.fragment_of != Some(fragment_of) {
            return false;
        }
    }
    if let Some(threshold) = filter.has_friction_above {
        if entry.max_friction <= threshold {
            return false;
        }
    }
    if let Some(needs_review) = filter.needs_review {
        if entry.needs_review != needs_review {
            return false;
        }
    }
    true
}

/// Minimal HTML-to-markdown conversion: strip tags, keep block breaks. Good enough
/// for the kernel's own normalization boundary; a full renderer is out of scope.
fn normalize_content(content: &str, mime: MimeKind) -> String {
    if mime != MimeKind::Html {
        return content.to_string();
    }
    let mut out = String::with_capacity(content.len());
    let mut in_tag = false;
    for ch in content.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if in_tag => {}
            _ => out.push(ch),
        }
    }
    out.split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Split content into sections at heading/paragraph boundaries once it exceeds
/// `threshold` characters. Never splits mid-paragraph.
fn split_sections(content: &str, threshold: usize) -> Vec<String> {
    let paragraphs: Vec<&str> = content.split("\n\n").collect();
    let mut sections = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs {
        let is_heading = paragraph.trim_start().starts_with('#');
        if is_heading && !current.is_empty() {
            sections.push(current.trim().to_string());
            current = String::new();
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
        if current.len() >= threshold {
            sections.push(current.trim().to_string());
            current = String::new();
        }
    }
    if !current.is_empty() {
        sections.push(current.trim().to_string());
    }
    if sections.is_empty() {
        sections.push(content.to_string());
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use std::path::PathBuf;

    async fn harness() -> (EntryStore, Arc<KernelStore>) {
        let store = KernelStore::bootstrap(&StorageConfig::Memory).await.unwrap();
        let audit = Arc::new(
            AuditSink::bootstrap(store.clone(), 1024, 16, 50, PathBuf::from("/tmp/kernel-test-overflow.jsonl")).await,
        );
        (EntryStore::new(store.clone(), audit, 64), store)
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
            created_at: Utc::now(),
        };
        store.notebooks.write().await.insert(id, notebook);
        id
    }

    #[tokio::test]
    async fn sequences_assigned_densely_and_monotonically() {
        let (store, kstore) = harness().await;
        let notebook = seed_notebook(&kstore).await;

        for content in ["a", "b", "c"] {
            store
                .insert_entry(
                    notebook,
                    "author-1",
                    NewEntry::new(content, MimeKind::PlainText),
                    ReviewStatus::Approved,
                )
                .await
                .unwrap();
        }

        let entries = kstore.entries.read().await;
        let mut sequences: Vec<u64> = entries.values().map(|e| e.sequence).collect();
        sequences.sort();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reference_to_foreign_notebook_is_rejected() {
        let (store, kstore) = harness().await;
        let notebook_a = seed_notebook(&kstore).await;
        let notebook_b = seed_notebook(&kstore).await;

        let foreign = store
            .insert_entry(
                notebook_b,
                "author-1",
                NewEntry::new("x", MimeKind::PlainText),
                ReviewStatus::Approved,
            )
            .await
            .unwrap();

        let mut new_entry = NewEntry::new("y", MimeKind::PlainText);
        new_entry.references = vec![foreign.id];

        let result = store
            .insert_entry(notebook_a, "author-1", new_entry, ReviewStatus::Approved)
            .await;
        assert!(matches!(result, Err(KernelError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn cyclic_references_do_not_hang_traversal() {
        let (store, kstore) = harness().await;
        let notebook = seed_notebook(&kstore).await;

        let a = store
            .insert_entry(notebook, "author-1", NewEntry::new("a", MimeKind::PlainText), ReviewStatus::Approved)
            .await
            .unwrap();

        let mut b_new = NewEntry::new("b", MimeKind::PlainText);
        b_new.references = vec![a.id];
        let b = store
            .insert_entry(notebook, "author-1", b_new, ReviewStatus::Approved)
            .await
            .unwrap();

        // simulate a cycle by mutating a's references to point back at b
        store
            .update_entry(a.id, |e| {
                e.references = vec![b.id];
                Ok(())
            })
            .await
            .unwrap();

        let refs = store.references_of(a.id).await.unwrap();
        assert!(refs.contains(&b.id));
    }

    #[tokio::test]
    async fn fragmentation_splits_oversized_markdown_entries() {
        let (store, kstore) = harness().await;
        let notebook = seed_notebook(&kstore).await;

        let section_a = "# Heading one\n\n".to_string() + &"word ".repeat(2000);
        let section_b = "# Heading two\n\n".to_string() + &"term ".repeat(2000);
        let content = format!("{section_a}\n\n{section_b}");

        let outcome = store
            .write_entry(
                notebook,
                "author-1",
                NewEntry::new(content, MimeKind::Markdown),
                ReviewStatus::Approved,
                16_000,
            )
            .await
            .unwrap();

        assert!(outcome.entries.len() >= 2);
        let artifact = &outcome.entries[0];
        assert!(outcome.entries[1..]
            .iter()
            .all(|f| f.fragment_of == Some(artifact.id)));
    }

    #[tokio::test]
    async fn pending_review_entries_are_excluded_from_observe() {
        let (store, kstore) = harness().await;
        let notebook = seed_notebook(&kstore).await;

        store
            .insert_entry(notebook, "author-1", NewEntry::new("visible", MimeKind::PlainText), ReviewStatus::Approved)
            .await
            .unwrap();
        store
            .insert_entry(notebook, "author-2", NewEntry::new("hidden", MimeKind::PlainText), ReviewStatus::Pending)
            .await
            .unwrap();

        let observed = store.observe(notebook, 0, 1000).await.unwrap();
        assert_eq!(observed.changes.len(), 1);
    }
}
