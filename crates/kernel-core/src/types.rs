use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub type NotebookId = Uuid;
pub type EntryId = Uuid;
pub type JobId = Uuid;
pub type OrgId = Uuid;
pub type GroupId = Uuid;
pub type SubscriptionId = Uuid;
/// Opaque 32-byte authenticated principal identifier carried at the transport boundary.
pub type PrincipalId = String;

/// Lattice classification level. Ordering is the derived `Ord` over variant position,
/// which is the dominance order the spec requires (`PUBLIC < ... < TOP_SECRET`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationLevel {
    Public,
    Internal,
    Confidential,
    Secret,
    TopSecret,
}

/// `(level, compartments)` pair carried by notebooks, principals, and agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityLabel {
    pub level: ClassificationLevel,
    pub compartments: BTreeSet<String>,
}

impl SecurityLabel {
    pub fn new(level: ClassificationLevel, compartments: impl IntoIterator<Item = String>) -> Self {
        Self {
            level,
            compartments: compartments.into_iter().collect(),
        }
    }

    /// `self.dominates(other)` iff `self.level >= other.level && self.compartments ⊇ other.compartments`.
    pub fn dominates(&self, other: &SecurityLabel) -> bool {
        self.level >= other.level && self.compartments.is_superset(&other.compartments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    Existence,
    Read,
    ReadWrite,
    Admin,
}

impl AccessTier {
    fn rank(self) -> u8 {
        match self {
            Self::Existence => 0,
            Self::Read => 1,
            Self::ReadWrite => 2,
            Self::Admin => 3,
        }
    }

    pub fn max(self, other: Self) -> Self {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    pub fn at_least(self, required: Self) -> bool {
        self.rank() >= required.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notebook {
    pub id: NotebookId,
    pub name: String,
    pub owner: PrincipalId,
    pub label: SecurityLabel,
    pub owning_group: Option<GroupId>,
    pub current_sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl Notebook {
    pub fn classification(&self) -> ClassificationLevel {
        self.label.level
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Approved,
    Pending,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Probation,
    Integrated,
    Contested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Pending,
    Distilled,
    Verified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contradiction {
    pub claim_a_text: String,
    pub claim_b_text: String,
    pub severity: f64,
}

/// Asymmetric comparison record from the new entry ("A") to a neighbor ("B").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    pub against: EntryId,
    pub entropy: f64,
    pub friction: f64,
    pub contradictions: Vec<Contradiction>,
    pub timestamp: DateTime<Utc>,
    pub discount_factor: Option<f64>,
}

/// Derived integration-cost record attached at claim/embed time and surfaced verbatim
/// in read/browse/observe responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationCost {
    pub entries_revised: u32,
    pub references_broken: u32,
    pub catalog_shift: f64,
    pub orphan: bool,
}

/// Activity context returned alongside a freshly inserted entry's causal position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityContext {
    pub entries_since_last_by_author: u32,
    pub total_notebook_entries: u64,
    pub recent_entropy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalPosition {
    pub sequence: u64,
    pub activity_context: ActivityContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MimeKind {
    PlainText,
    Markdown,
    Html,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub notebook: NotebookId,
    pub author: PrincipalId,
    pub content: String,
    pub mime: MimeKind,
    pub topic: Option<String>,
    pub references: Vec<EntryId>,
    pub revision_of: Option<EntryId>,
    pub fragment_of: Option<EntryId>,
    pub fragment_index: Option<u32>,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub review_status: ReviewStatus,
    pub integration_status: IntegrationStatus,
    pub integration_cost: IntegrationCost,
    pub claims: Vec<Claim>,
    pub claim_status: ClaimStatus,
    pub embedding: Option<Vec<f64>>,
    pub comparisons: Vec<Comparison>,
    pub max_friction: f64,
    pub needs_review: bool,
}

impl Entry {
    pub fn recompute_derived(&mut self, min_comparisons: u32, friction_threshold: f64, review_threshold: f64) {
        self.max_friction = self
            .comparisons
            .iter()
            .map(|c| c.friction)
            .fold(0.0_f64, f64::max);

        self.integration_status = if (self.comparisons.len() as u32) < min_comparisons {
            IntegrationStatus::Probation
        } else if self.max_friction >= friction_threshold {
            IntegrationStatus::Contested
        } else {
            IntegrationStatus::Integrated
        };

        self.needs_review = self.max_friction >= review_threshold;
    }
}

/// A new entry as submitted by a caller, before sequence assignment.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub content: String,
    pub mime: MimeKind,
    pub topic: Option<String>,
    pub references: Vec<EntryId>,
    pub revision_of: Option<EntryId>,
    pub fragment_of: Option<EntryId>,
    pub fragment_index: Option<u32>,
    pub asserted_classification: Option<ClassificationLevel>,
}

impl NewEntry {
    pub fn new(content: impl Into<String>, mime: MimeKind) -> Self {
        Self {
            content: content.into(),
            mime,
            topic: None,
            references: Vec::new(),
            revision_of: None,
            fragment_of: None,
            fragment_index: None,
            asserted_classification: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub query: Option<String>,
    pub topic_prefix: Option<String>,
    pub claims_status: Option<ClaimStatus>,
    pub integration_status: Option<IntegrationStatus>,
    pub author: Option<PrincipalId>,
    pub sequence_min: Option<u64>,
    pub sequence_max: Option<u64>,
    pub fragment_of: Option<EntryId>,
    pub has_friction_above: Option<f64>,
    pub needs_review: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedChange {
    pub entry_id: EntryId,
    pub operation: ObserveOperation,
    pub author: PrincipalId,
    pub topic: Option<String>,
    pub integration_cost: IntegrationCost,
    pub causal_position: SequencedPosition,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserveOperation {
    Write,
    Revise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedPosition {
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveResponse {
    pub changes: Vec<ObservedChange>,
    pub notebook_entropy: f64,
    pub current_sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    DistillClaims,
    EmbedClaims,
    CompareClaims,
    ClassifyTopic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLease {
    pub worker_id: String,
    pub agent_id: Option<String>,
    pub claimed_at: DateTime<Utc>,
    pub timeout_secs: u64,
}

impl JobLease {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.claimed_at).num_seconds() >= self.timeout_secs as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub notebook: NotebookId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub lease: Option<JobLease>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub by_type: std::collections::BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipRole {
    Member,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
    pub owner: PrincipalId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub org: OrgId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEdge {
    pub org: OrgId,
    pub parent: GroupId,
    pub child: GroupId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMembership {
    pub org: OrgId,
    pub group: GroupId,
    pub principal: PrincipalId,
    pub role: MembershipRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGrant {
    pub notebook: NotebookId,
    pub principal: PrincipalId,
    pub tier: AccessTier,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalClearance {
    pub principal: PrincipalId,
    pub org: OrgId,
    pub label: SecurityLabel,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub org: OrgId,
    pub label: SecurityLabel,
    pub infrastructure: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionScope {
    Catalog,
    Claims,
    Entries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub subscriber_notebook: NotebookId,
    pub source_notebook: NotebookId,
    pub scope: SubscriptionScope,
    pub topic_filter: Option<String>,
    pub discount_factor: f64,
    pub poll_interval_secs: u64,
    pub base_poll_interval_secs: u64,
    pub watermark_sequence: u64,
    pub sync_status: SyncStatus,
    pub last_error: Option<String>,
    pub mirrored_count: u64,
    pub last_sync_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirroredEntry {
    pub id: EntryId,
    pub subscriber_notebook: NotebookId,
    pub subscription: SubscriptionId,
    pub source_notebook: NotebookId,
    pub source_entry: EntryId,
    pub topic: Option<String>,
    pub content: Option<String>,
    pub claims: Vec<Claim>,
    pub embedding: Option<Vec<f64>>,
    pub source_sequence: u64,
    pub discount_factor: f64,
    pub tombstoned: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryReview {
    pub entry: EntryId,
    pub notebook: NotebookId,
    pub submitted_by: PrincipalId,
    pub status: ReviewStatus,
    pub submitted_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<PrincipalId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: Option<PrincipalId>,
    pub action: String,
    pub resource: String,
    pub detail: serde_json::Value,
    pub ip: Option<String>,
    pub ua: Option<String>,
    pub notebook: Option<NotebookId>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: None,
            action: action.into(),
            resource: resource.into(),
            detail: serde_json::Value::Null,
            ip: None,
            ua: None,
            notebook: None,
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn notebook(mut self, notebook: NotebookId) -> Self {
        self.notebook = Some(notebook);
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<PrincipalId>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub notebook: Option<NotebookId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Worker-reported results for each job type; the orchestrator interprets these
/// per job type while the queue itself treats payloads as opaque JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobResult {
    DistillClaims { claims: Vec<Claim> },
    EmbedClaims { embedding: Vec<f64> },
    CompareClaims {
        compare_against_id: EntryId,
        entropy: f64,
        friction: f64,
        contradictions: Vec<Contradiction>,
    },
    ClassifyTopic { topic: String },
}
