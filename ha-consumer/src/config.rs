use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;

use crate::coordinator::SubscriptionMode;
use crate::error::ConfigError;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::snapshot::SnapshotPolicy;
use crate::types::{CommitMode, ConsumerIdentity, LeadershipState, RunDuration, TopicPair};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "ha-consumer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "ha-consumer-0")]
    pub consumer_id: String,

    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_consumer_auto_commit: bool,

    // Topics
    #[envconfig(default = "users-input")]
    pub leader_topic: String,

    #[envconfig(default = "master")]
    pub follower_topic: String,

    // Poll loop
    #[envconfig(default = "sync")]
    pub commit_mode: String,

    // true: join the consumer group, false: assign every partition directly
    #[envconfig(default = "true")]
    pub subscribe_mode: bool,

    #[envconfig(default = "500")]
    pub poll_batch_size: usize,

    #[envconfig(default = "1000")]
    pub poll_timeout: u64,

    #[envconfig(default = "millis")]
    pub poll_timeout_unit: String,

    #[envconfig(default = "-1")] // unbounded
    pub run_duration_ms: i64,

    #[envconfig(default = "30000")]
    pub drain_timeout_ms: u64,

    // Offset store, in memory when unset
    pub offset_store_path: Option<String>,

    // Snapshots
    #[envconfig(default = "./snapshots")]
    pub snapshot_dir: String,

    #[envconfig(default = "1000")]
    pub snapshot_every_records: u64,

    #[envconfig(default = "0")]
    pub snapshot_interval: u64,

    #[envconfig(default = "secs")]
    pub snapshot_interval_unit: String,

    #[envconfig(default = "true")]
    pub snapshot_on_leadership_change: bool,

    #[envconfig(default = "5")]
    pub max_snapshots: usize,

    // Leadership signal fired once at startup, `leader` or `follower`
    pub initial_leadership: Option<String>,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, ConfigError> {
        let config = Config::init_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that would otherwise fail after the consumer started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poll_timeout()?;
        self.snapshot_policy()?;
        self.commit_mode()?;
        self.initial_leadership()?;
        self.topics()?;

        if self.poll_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "POLL_BATCH_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_snapshots == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MAX_SNAPSHOTS",
                reason: "must be at least 1".to_string(),
            });
        }
        match self.kafka_consumer_offset_reset.as_str() {
            "earliest" | "latest" | "error" => Ok(()),
            other => Err(ConfigError::InvalidValue {
                field: "KAFKA_CONSUMER_OFFSET_RESET",
                reason: format!("'{other}' is not one of earliest, latest, error"),
            }),
        }
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("POLL_TIMEOUT_UNIT", self.poll_timeout, &self.poll_timeout_unit)
    }

    pub fn run_duration(&self) -> RunDuration {
        RunDuration::from_millis(self.run_duration_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn commit_mode(&self) -> Result<CommitMode, ConfigError> {
        self.commit_mode
            .parse::<CommitMode>()
            .map_err(|reason| ConfigError::InvalidValue {
                field: "COMMIT_MODE",
                reason,
            })
    }

    pub fn subscription_mode(&self) -> SubscriptionMode {
        if self.subscribe_mode {
            SubscriptionMode::Subscribe
        } else {
            SubscriptionMode::Assign
        }
    }

    pub fn initial_leadership(&self) -> Result<Option<LeadershipState>, ConfigError> {
        match self.initial_leadership.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => value
                .parse::<LeadershipState>()
                .map(Some)
                .map_err(|reason| ConfigError::InvalidValue {
                    field: "INITIAL_LEADERSHIP",
                    reason,
                }),
        }
    }

    pub fn topics(&self) -> Result<TopicPair, ConfigError> {
        let leader = self.leader_topic.trim();
        let follower = self.follower_topic.trim();

        if leader.is_empty() || follower.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: if leader.is_empty() {
                    "LEADER_TOPIC"
                } else {
                    "FOLLOWER_TOPIC"
                },
                reason: "must not be empty".to_string(),
            });
        }
        if leader == follower {
            return Err(ConfigError::SameTopics(leader.to_string()));
        }
        Ok(TopicPair::new(leader, follower))
    }

    pub fn identity(&self) -> ConsumerIdentity {
        ConsumerIdentity::new(&self.consumer_id, &self.kafka_consumer_group)
    }

    pub fn offset_store_path(&self) -> Option<PathBuf> {
        self.offset_store_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        PathBuf::from(&self.snapshot_dir)
    }

    pub fn snapshot_policy(&self) -> Result<SnapshotPolicy, ConfigError> {
        let interval = parse_duration(
            "SNAPSHOT_INTERVAL_UNIT",
            self.snapshot_interval,
            &self.snapshot_interval_unit,
        )?;
        Ok(SnapshotPolicy {
            every_records: self.snapshot_every_records,
            interval: (!interval.is_zero()).then_some(interval),
            on_leadership_change: self.snapshot_on_leadership_change,
        })
    }

    pub fn to_consumer_config(&self) -> rdkafka::ClientConfig {
        ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_auto_commit(self.kafka_consumer_auto_commit)
            .with_client_id(&self.consumer_id)
            .build()
    }
}

/// Turn an amount plus a unit name into a `Duration`.
pub fn parse_duration(
    field: &'static str,
    amount: u64,
    unit: &str,
) -> Result<Duration, ConfigError> {
    match unit.trim().to_ascii_lowercase().as_str() {
        "ms" | "millis" | "milliseconds" => Ok(Duration::from_millis(amount)),
        "s" | "secs" | "seconds" => Ok(Duration::from_secs(amount)),
        "m" | "mins" | "minutes" => Ok(Duration::from_secs(amount.saturating_mul(60))),
        _ => Err(ConfigError::InvalidTimeUnit {
            field,
            value: unit.to_string(),
        }),
    }
}
