use crate::storage::StorageConfig;

/// Every kernel tunable collected in one place the way the reference
/// `*PolicyConfig`/`*EngineConfig` structs do, with a `Default` reproducing the
/// documented defaults verbatim.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Job lease timeout, seconds.
    pub job_lease_timeout_secs: u64,
    /// Max retries before a job is marked `failed`.
    pub job_max_retries: u32,
    /// Clearance cache sliding expiration, seconds.
    pub clearance_cache_ttl_secs: u64,
    /// Neighbor scan top-K for claim comparison.
    pub embed_neighbor_k: usize,
    /// Cosine similarity threshold for neighbor candidacy.
    pub embed_similarity_threshold: f64,
    /// Minimum comparisons before an entry leaves `probation`.
    pub min_comparisons_for_integration: u32,
    /// `max_friction` threshold for `contested`.
    pub friction_threshold: f64,
    /// `max_friction` threshold for `needs_review`.
    pub review_threshold: f64,
    /// Content-normalization fragmentation threshold, characters.
    pub fragment_char_threshold: usize,
    /// `observe` page bound.
    pub observe_page_limit: usize,
    /// Sync loop poll interval, seconds.
    pub subscription_poll_interval_secs: u64,
    /// Bounded worker pool size for the sync loop.
    pub subscription_concurrency_cap: usize,
    /// Per-iteration sync timeout, seconds.
    pub subscription_sync_timeout_secs: u64,
    /// Backoff cap on repeated sync failure, seconds.
    pub subscription_backoff_cap_secs: u64,
    /// Audit channel capacity.
    pub audit_channel_capacity: usize,
    /// Audit batch insert size.
    pub audit_batch_size: usize,
    /// Audit flush interval, milliseconds.
    pub audit_flush_interval_ms: u64,
    /// Traversal depth bound for cyclic reference/catalog walks.
    pub traversal_depth_bound: usize,
    /// Bound on entries returned per batch-write/claims-batch-fetch request.
    pub batch_request_limit: usize,
    /// Claim-set bound per entry.
    pub max_claims_per_entry: usize,
    pub storage: StorageConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            job_lease_timeout_secs: 300,
            job_max_retries: 3,
            clearance_cache_ttl_secs: 30,
            embed_neighbor_k: 5,
            embed_similarity_threshold: 0.3,
            min_comparisons_for_integration: 1,
            friction_threshold: 0.2,
            review_threshold: 0.2,
            fragment_char_threshold: 16_000,
            observe_page_limit: 1000,
            subscription_poll_interval_secs: 5,
            subscription_concurrency_cap: 10,
            subscription_sync_timeout_secs: 60,
            subscription_backoff_cap_secs: 3600,
            audit_channel_capacity: 10_000,
            audit_batch_size: 100,
            audit_flush_interval_ms: 1_000,
            traversal_depth_bound: 64,
            batch_request_limit: 100,
            max_claims_per_entry: 20,
            storage: StorageConfig::default(),
        }
    }
}
