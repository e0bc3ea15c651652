use crate::storage::KernelStore;
use crate::types::{AuditEvent, AuditFilter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

/// Durable, back-pressured audit event log. Writers that find the bounded
/// channel full block rather than drop events — no audit event is silently lost.
/// A single background consumer batch-inserts into the in-memory store (and the
/// optional PostgreSQL mirror); if that fails, events fall back to a local overflow
/// file that a recovery task replays on startup.
pub struct AuditSink {
    sender: mpsc::Sender<AuditEvent>,
    queue_depth: Arc<AtomicU64>,
    overflow_path: PathBuf,
}

impl AuditSink {
    pub async fn bootstrap(
        store: Arc<KernelStore>,
        capacity: usize,
        batch_size: usize,
        flush_interval_ms: u64,
        overflow_path: PathBuf,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queue_depth = Arc::new(AtomicU64::new(0));

        replay_overflow(&store, &overflow_path).await;

        tokio::spawn(consume(
            store,
            receiver,
            queue_depth.clone(),
            batch_size,
            flush_interval_ms,
            overflow_path.clone(),
        ));

        Self {
            sender,
            queue_depth,
            overflow_path,
        }
    }

    /// Blocks (applies back-pressure) if the channel is full, per the spec's contract.
    pub async fn record(&self, event: AuditEvent) {
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(event).await.is_err() {
            error!("audit sink consumer has shut down; event dropped");
        }
    }

    /// Queue-depth metric exposed per the spec; callers are expected to monitor it.
    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::SeqCst)
    }

    pub fn overflow_path(&self) -> &PathBuf {
        &self.overflow_path
    }
}

async fn consume(
    store: Arc<KernelStore>,
    mut receiver: mpsc::Receiver<AuditEvent>,
    queue_depth: Arc<AtomicU64>,
    batch_size: usize,
    flush_interval_ms: u64,
    overflow_path: PathBuf,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = interval(Duration::from_millis(flush_interval_ms.max(1)));

    loop {
        tokio::select! {
            maybe_event = receiver.recv() => {
                match maybe_event {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            flush(&store, &mut batch, &overflow_path).await;
                        }
                        queue_depth.fetch_sub(1, Ordering::SeqCst);
                    }
                    None => {
                        flush(&store, &mut batch, &overflow_path).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&store, &mut batch, &overflow_path).await;
                }
            }
        }
    }
}

/// Bound on the in-memory `audit_log` tail kept for `audit.query`; older events
/// remain durable in the Postgres mirror or overflow file but age out of this view.
const AUDIT_LOG_RETENTION: usize = 50_000;

async fn flush(store: &Arc<KernelStore>, batch: &mut Vec<AuditEvent>, overflow_path: &PathBuf) {
    if batch.is_empty() {
        return;
    }
    for event in batch.drain(..) {
        {
            let mut log = store.audit_log.write().await;
            log.push(event.clone());
            if log.len() > AUDIT_LOG_RETENTION {
                let overflow = log.len() - AUDIT_LOG_RETENTION;
                log.drain(0..overflow);
            }
        }
        if let Err(e) = store.mirror.mirror_audit(&event).await {
            warn!(error = %e, "audit store write failed; spilling to overflow file");
            if let Err(e) = append_overflow(overflow_path, &event).await {
                error!(error = %e, "audit overflow write failed; event may be lost");
            }
        }
    }
}

async fn append_overflow(path: &PathBuf, event: &AuditEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut line = serde_json::to_string(event).unwrap_or_default();
    line.push('\n');
    file.write_all(line.as_bytes()).await
}

async fn replay_overflow(store: &Arc<KernelStore>, path: &PathBuf) {
    let Ok(file) = File::open(path).await else {
        return;
    };
    info!(path = %path.display(), "replaying audit overflow file");
    let mut lines = BufReader::new(file).lines();
    let mut replayed = 0u64;
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => {
                store.audit_log.write().await.push(event.clone());
                if store.mirror.mirror_audit(&event).await.is_ok() {
                    replayed += 1;
                }
            }
            Err(e) => warn!(error = %e, "skipping malformed overflow line"),
        }
    }
    if replayed > 0 {
        info!(count = replayed, "audit overflow replay complete");
        let _ = tokio::fs::remove_file(path).await;
    }
}

/// Query the in-memory tail kept for the `audit.query` command. The durable
/// source of truth is the store/mirror; this view serves recent-history queries
/// without depending on an external audit log viewer.
pub fn apply_filter(events: &[AuditEvent], filter: &AuditFilter) -> Vec<AuditEvent> {
    let mut matched: Vec<AuditEvent> = events
        .iter()
        .filter(|e| {
            filter
                .actor
                .as_ref()
                .map(|a| e.actor.as_deref() == Some(a.as_str()))
                .unwrap_or(true)
                && filter
                    .action
                    .as_ref()
                    .map(|a| &e.action == a)
                    .unwrap_or(true)
                && filter
                    .resource
                    .as_ref()
                    .map(|r| &e.resource == r)
                    .unwrap_or(true)
                && filter
                    .notebook
                    .map(|n| e.notebook == Some(n))
                    .unwrap_or(true)
                && filter.since.map(|s| e.timestamp >= s).unwrap_or(true)
                && filter.until.map(|u| e.timestamp <= u).unwrap_or(true)
        })
        .cloned()
        .collect();

    matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let offset = filter.offset.unwrap_or(0);
    let limit = filter.limit.unwrap_or(matched.len());
    matched.into_iter().skip(offset).take(limit).collect()
}
