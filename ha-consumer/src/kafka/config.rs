use rdkafka::ClientConfig;

/// Kafka consumer configuration builder for the replica's consumer.
///
/// Offsets are never auto-stored: the poll loop decides what has been applied.
/// Auto-commit is opt-in. The assignment strategy is left eager (`range`) so every
/// assignment replaces the previous one instead of adding to it incrementally.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set("partition.assignment.strategy", "range")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

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

    /// Starting position for partitions without a usable checkpoint
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Let the broker client commit consumed positions on its own
    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        self.config
            .set("enable.auto.commit", if enabled { "true" } else { "false" });
        // Auto-commit commits the *stored* position, so storing has to follow.
        self.config
            .set("enable.auto.offset.store", if enabled { "true" } else { "false" });
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "ha-group").build();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("ha-group"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("partition.assignment.strategy"), Some("range"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_overrides() {
        let config = ConsumerConfigBuilder::new("broker:9092", "g")
            .with_tls(true)
            .with_offset_reset("earliest")
            .with_auto_commit(true)
            .with_client_id("replica-1")
            .build();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("true"));
        assert_eq!(config.get("client.id"), Some("replica-1"));
    }
}
