// ==== Primary reader metrics ====
/// Counter for messages handed to the caller by `poll`
pub const MESSAGES_DELIVERED: &str = "synchronized_consumer_messages_delivered_total";

/// Counter for messages fetched past the watermark and rewound instead of delivered
pub const LATE_FETCH_REWINDS: &str = "synchronized_consumer_late_fetch_rewinds_total";

/// Gauge for assigned partitions currently paused at the broker
pub const PAUSED_PARTITIONS: &str = "synchronized_consumer_paused_partitions";

/// Gauge for assigned partitions currently resumed at the broker
pub const RESUMED_PARTITIONS: &str = "synchronized_consumer_resumed_partitions";

/// Counter for pause/resume calls issued against the broker client (label: action)
pub const PARTITION_FLOW_CONTROL: &str = "synchronized_consumer_flow_control_total";

// ==== Rebalance metrics ====
/// Counter for rebalance events drained by `poll` (label: event_type)
pub const REBALANCE_EVENTS: &str = "synchronized_consumer_rebalance_events_total";

/// Counter for empty revoke rebalances that were skipped
pub const REBALANCE_EMPTY_SKIPPED: &str = "synchronized_consumer_rebalance_empty_skipped_total";

/// Counter for rebalance callbacks that returned an error (label: event_type)
pub const REBALANCE_CALLBACK_ERRORS: &str = "synchronized_consumer_rebalance_callback_errors_total";

// ==== Kafka errors ====
/// Counter for Kafka errors (labels: component, level, error)
pub const KAFKA_ERRORS: &str = "synchronized_consumer_kafka_errors_total";

// ==== Watermark tracker metrics ====
/// Counter for commit-log records consumed (label: outcome)
pub const COMMIT_LOG_RECORDS: &str = "synchronized_consumer_commit_log_records_total";

/// Counter for partitions that became eligible after a watermark update
pub const WATERMARK_ADVANCES: &str = "synchronized_consumer_watermark_advances_total";
