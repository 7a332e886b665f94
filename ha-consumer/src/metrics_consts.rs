// ==== Poll loop metrics ====
/// Counter for records handed to the record handler
pub const RECORDS_DISPATCHED: &str = "ha_consumer_records_dispatched_total";

/// Counter for records dropped because the replica was not running or did not own the partition
pub const RECORDS_SKIPPED: &str = "ha_consumer_records_skipped_total";

/// Counter for records whose handler returned an error (the record is skipped)
pub const RECORDS_FAILED: &str = "ha_consumer_records_failed_total";

/// Histogram for records returned per poll
pub const POLL_BATCH_SIZE: &str = "ha_consumer_poll_batch_size";

/// Counter for broker errors surfaced by poll, labelled by severity
pub const POLL_ERRORS: &str = "ha_consumer_poll_errors_total";

// ==== Commit / checkpoint metrics ====
/// Counter for commit attempts, labelled by mode and outcome
pub const OFFSET_COMMITS: &str = "ha_consumer_offset_commits_total";

/// Counter for offset store writes, labelled by outcome
pub const OFFSET_STORE_WRITES: &str = "ha_consumer_offset_store_writes_total";

/// Gauge for the last offset persisted per partition
pub const PARTITION_LAST_PERSISTED_OFFSET: &str = "ha_consumer_partition_last_persisted_offset";

// ==== Rebalance metrics ====
/// Counter for partitions restored from the offset store on assignment
pub const PARTITIONS_RESTORED: &str = "ha_consumer_partitions_restored_total";

/// Counter for seeks that failed and fell back to the broker default position
pub const SEEK_FALLBACKS: &str = "ha_consumer_seek_fallbacks_total";

/// Counter for partitions revoked from this replica
pub const PARTITIONS_REVOKED: &str = "ha_consumer_partitions_revoked_total";

// ==== Leadership metrics ====
/// Counter for topic switches caused by leadership transitions
pub const TOPIC_SWITCHES: &str = "ha_consumer_topic_switches_total";

/// Gauge, 1 while this replica is leader
pub const IS_LEADER: &str = "ha_consumer_is_leader";

// ==== Snapshot metrics ====
/// Counter for snapshots, labelled by outcome
pub const SNAPSHOTS: &str = "ha_consumer_snapshots_total";

// ==== HTTP metrics ====
/// Counter for HTTP requests, labelled by route and status
pub const HTTP_REQUESTS: &str = "ha_consumer_http_requests_total";

/// Histogram for HTTP request latency in seconds, labelled by route and status
pub const HTTP_REQUEST_DURATION: &str = "ha_consumer_http_request_duration_seconds";
