use crate::error::KernelError;
use crate::types::*;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Storage backend selector, in the shape of the reference ledger's storage config:
/// the kernel runs entirely in-memory (tests, small deployments) or mirrors its three
/// transactionally-central tables (entries, jobs, audit_log) into PostgreSQL while
/// keeping the in-memory map authoritative for reads. See DESIGN.md for why the
/// remaining tables stay memory-only in this implementation.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Memory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl StorageConfig {
    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Optional mirror of entries/jobs/audit_log into PostgreSQL. `None` when the kernel
/// is configured for `StorageConfig::Memory`.
#[derive(Clone)]
pub struct PersistenceMirror {
    pool: Option<PgPool>,
}

impl PersistenceMirror {
    pub async fn bootstrap(config: &StorageConfig) -> Result<Self, KernelError> {
        match config {
            StorageConfig::Memory => Ok(Self { pool: None }),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let pool = PgPoolOptions::new()
                    .max_connections((*max_connections).max(1))
                    .connect(database_url)
                    .await
                    .map_err(|e| KernelError::internal(format!("postgres connect failed: {e}")))?;
                Self::ensure_schema(&pool).await?;
                Ok(Self { pool: Some(pool) })
            }
        }
    }

    async fn ensure_schema(pool: &PgPool) -> Result<(), KernelError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id UUID PRIMARY KEY,
                notebook UUID NOT NULL,
                author TEXT NOT NULL,
                sequence BIGINT NOT NULL,
                content TEXT NOT NULL,
                topic TEXT NULL,
                review_status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                UNIQUE (notebook, sequence)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| KernelError::internal(format!("schema create failed (entries): {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                notebook UUID NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| KernelError::internal(format!("schema create failed (jobs): {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id UUID PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                actor TEXT NULL,
                action TEXT NOT NULL,
                resource TEXT NOT NULL,
                notebook UUID NULL,
                detail JSONB NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| KernelError::internal(format!("schema create failed (audit_log): {e}")))?;

        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.pool.is_some()
    }

    pub async fn mirror_entry(&self, entry: &Entry) -> Result<(), KernelError> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let payload = serde_json::to_value(entry)
            .map_err(|e| KernelError::internal(format!("entry serialize failed: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO entries (id, notebook, author, sequence, content, topic, review_status, created_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload
            "#,
        )
        .bind(entry.id)
        .bind(entry.notebook)
        .bind(&entry.author)
        .bind(entry.sequence as i64)
        .bind(&entry.content)
        .bind(&entry.topic)
        .bind(format!("{:?}", entry.review_status))
        .bind(entry.created_at)
        .bind(payload)
        .execute(pool)
        .await
        .map_err(|e| KernelError::internal(format!("entry mirror failed: {e}")))?;
        Ok(())
    }

    pub async fn mirror_job(&self, job: &Job) -> Result<(), KernelError> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let payload = serde_json::to_value(job)
            .map_err(|e| KernelError::internal(format!("job serialize failed: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, notebook, job_type, status, created_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, payload = EXCLUDED.payload
            "#,
        )
        .bind(job.id)
        .bind(job.notebook)
        .bind(format!("{:?}", job.job_type))
        .bind(format!("{:?}", job.status))
        .bind(job.created_at)
        .bind(payload)
        .execute(pool)
        .await
        .map_err(|e| KernelError::internal(format!("job mirror failed: {e}")))?;
        Ok(())
    }

    pub async fn mirror_audit(&self, event: &AuditEvent) -> Result<(), KernelError> {
        let Some(pool) = &self.pool else { return Ok(()) };
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, timestamp, actor, action, resource, notebook, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.timestamp)
        .bind(&event.actor)
        .bind(&event.action)
        .bind(&event.resource)
        .bind(event.notebook)
        .bind(&event.detail)
        .execute(pool)
        .await
        .map_err(|e| KernelError::internal(format!("audit mirror failed: {e}")))?;
        Ok(())
    }
}

/// In-memory authoritative store for every table the kernel persists.
/// Every subsystem is handed an `Arc<KernelStore>` rather than reaching for ambient
/// global state, per the reference repo's `bootstrap()` wiring convention.
pub struct KernelStore {
    pub notebooks: RwLock<HashMap<NotebookId, Notebook>>,
    pub entries: RwLock<HashMap<EntryId, Entry>>,
    /// Per-notebook entry id ordered by sequence, maintained alongside `entries`.
    pub notebook_sequence_index: RwLock<HashMap<NotebookId, Vec<EntryId>>>,
    /// Exclusive per-notebook lock serializing sequence assignment, mirroring the
    /// reference Postgres backend's `SELECT ... FOR UPDATE` on the notebook row.
    pub notebook_locks: RwLock<HashMap<NotebookId, Arc<Mutex<()>>>>,
    pub jobs: RwLock<HashMap<JobId, Job>>,
    pub organizations: RwLock<HashMap<OrgId, Organization>>,
    pub groups: RwLock<HashMap<GroupId, Group>>,
    pub group_edges: RwLock<Vec<GroupEdge>>,
    pub group_memberships: RwLock<Vec<GroupMembership>>,
    pub access_grants: RwLock<HashMap<(NotebookId, PrincipalId), AccessGrant>>,
    pub clearances: RwLock<HashMap<(PrincipalId, OrgId), PrincipalClearance>>,
    pub agents: RwLock<HashMap<String, Agent>>,
    pub subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    pub mirrored_entries: RwLock<HashMap<EntryId, MirroredEntry>>,
    pub reviews: RwLock<HashMap<EntryId, EntryReview>>,
    /// Authoritative `audit_log` table in `StorageConfig::Memory` mode; always kept
    /// as the queryable tail even when a Postgres mirror is also active.
    pub audit_log: RwLock<Vec<AuditEvent>>,
    pub mirror: PersistenceMirror,
}

impl KernelStore {
    pub async fn bootstrap(config: &StorageConfig) -> Result<Arc<Self>, KernelError> {
        let mirror = PersistenceMirror::bootstrap(config).await?;
        Ok(Arc::new(Self {
            notebooks: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            notebook_sequence_index: RwLock::new(HashMap::new()),
            notebook_locks: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            organizations: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            group_edges: RwLock::new(Vec::new()),
            group_memberships: RwLock::new(Vec::new()),
            access_grants: RwLock::new(HashMap::new()),
            clearances: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            mirrored_entries: RwLock::new(HashMap::new()),
            reviews: RwLock::new(HashMap::new()),
            audit_log: RwLock::new(Vec::new()),
            mirror,
        }))
    }

    pub async fn notebook_lock(&self, notebook: NotebookId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.notebook_locks.read().await.get(&notebook) {
            return lock.clone();
        }
        let mut locks = self.notebook_locks.write().await;
        locks
            .entry(notebook)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
