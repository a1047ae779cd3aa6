use rdkafka::ClientConfig;

/// Kafka client configuration builder for the two consumers a
/// `SynchronizedConsumer` runs.
///
/// - `for_primary_consumer`: member of the caller-visible group. Offsets are
///   only committed when the caller asks, and partitions without a committed
///   offset start from the configured reset policy.
/// - `for_commit_log_consumer`: private group reading the commit-log topic.
///   It never commits, every instance reads the whole topic.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn for_primary_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000");

        Self { config }
    }

    pub fn for_commit_log_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Where to start reading a partition that has no committed offset
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Set session timeout: how long broker waits for heartbeats before declaring consumer dead.
    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        // keep ~1/3 of the session timeout so a couple of heartbeats can be missed
        self.config
            .set("heartbeat.interval.ms", (ms / 3).max(1).to_string());
        self
    }

    /// Name reported to the brokers, shows up in their logs and quotas
    pub fn with_client_id(mut self, client_id: Option<&str>) -> Self {
        if let Some(client_id) = client_id.filter(|id| !id.is_empty()) {
            self.config.set("client.id", client_id);
        }
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_consumer_never_auto_commits() {
        let config = ConsumerConfigBuilder::for_primary_consumer("kafka:9092", "ingest").build();

        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(config.get("group.id"), Some("ingest"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_commit_log_consumer_does_not_store_offsets() {
        let config =
            ConsumerConfigBuilder::for_commit_log_consumer("kafka:9092", "ingest:sync:1").build();

        assert_eq!(config.get("group.id"), Some("ingest:sync:1"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("session.timeout.ms"), None);
    }

    #[test]
    fn test_overrides() {
        let config = ConsumerConfigBuilder::for_primary_consumer("kafka:9092", "ingest")
            .with_tls(true)
            .with_offset_reset("latest")
            .with_session_timeout_ms(30000)
            .with_client_id(Some("ingest-0"))
            .build();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("session.timeout.ms"), Some("30000"));
        assert_eq!(config.get("heartbeat.interval.ms"), Some("10000"));
        assert_eq!(config.get("client.id"), Some("ingest-0"));
    }

    #[test]
    fn test_empty_client_id_is_not_set() {
        let config = ConsumerConfigBuilder::for_primary_consumer("kafka:9092", "ingest")
            .with_client_id(Some(""))
            .build();

        assert_eq!(config.get("client.id"), None);
    }
}
