use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A partition paired with the next offset to read from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// One record read from the log, detached from the broker client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp_ms: Option<i64>,
}

impl Record {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            value,
            timestamp_ms: None,
        }
    }

    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            partition: Partition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            value: msg.payload().map(<[u8]>::to_vec),
            timestamp_ms: msg.timestamp().to_millis(),
        }
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    /// The offset to resume from once this record has been applied.
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}

/// Leadership as decided by the external election mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadershipState {
    Leader,
    NotLeader,
}

impl LeadershipState {
    pub fn is_leader(self) -> bool {
        matches!(self, LeadershipState::Leader)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LeadershipState::Leader => "leader",
            LeadershipState::NotLeader => "not_leader",
        }
    }
}

impl fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadershipState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leader" => Ok(LeadershipState::Leader),
            "follower" | "not_leader" | "not-leader" => Ok(LeadershipState::NotLeader),
            other => Err(format!("unknown leadership state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActiveTopic {
    LeaderTopic,
    FollowerTopic,
}

impl ActiveTopic {
    pub fn for_leadership(state: LeadershipState) -> Self {
        match state {
            LeadershipState::Leader => ActiveTopic::LeaderTopic,
            LeadershipState::NotLeader => ActiveTopic::FollowerTopic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActiveTopic::LeaderTopic => "leader_topic",
            ActiveTopic::FollowerTopic => "follower_topic",
        }
    }
}

/// The two logical topics a replica alternates between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPair {
    pub leader: String,
    pub follower: String,
}

impl TopicPair {
    pub fn new(leader: impl Into<String>, follower: impl Into<String>) -> Self {
        Self {
            leader: leader.into(),
            follower: follower.into(),
        }
    }

    pub fn name_of(&self, topic: ActiveTopic) -> &str {
        match topic {
            ActiveTopic::LeaderTopic => &self.leader,
            ActiveTopic::FollowerTopic => &self.follower,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Stopped => "stopped",
            RunState::Starting => "starting",
            RunState::Running => "running",
        }
    }
}

/// Diagnostic identity of this replica. Never used for correctness decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerIdentity {
    id: String,
    group_id: String,
}

impl ConsumerIdentity {
    pub fn new(id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group_id: group_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Sync,
    Async,
}

impl CommitMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitMode::Sync => "sync",
            CommitMode::Async => "async",
        }
    }
}

impl FromStr for CommitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(CommitMode::Sync),
            "async" => Ok(CommitMode::Async),
            other => Err(format!("unknown commit mode '{other}'")),
        }
    }
}

impl From<CommitMode> for rdkafka::consumer::CommitMode {
    fn from(mode: CommitMode) -> Self {
        match mode {
            CommitMode::Sync => rdkafka::consumer::CommitMode::Sync,
            CommitMode::Async => rdkafka::consumer::CommitMode::Async,
        }
    }
}

/// How long the poll loop runs before exiting on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDuration {
    Unbounded,
    Bounded(Duration),
}

impl RunDuration {
    /// `-1` (or any negative value) means unbounded.
    pub fn from_millis(millis: i64) -> Self {
        match u64::try_from(millis) {
            Ok(ms) => RunDuration::Bounded(Duration::from_millis(ms)),
            Err(_) => RunDuration::Unbounded,
        }
    }

    pub fn deadline_from(self, start: Instant) -> Option<Instant> {
        match self {
            RunDuration::Unbounded => None,
            RunDuration::Bounded(d) => Some(start + d),
        }
    }
}

/// Read-only view of the coordinator, published for readiness checks and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStatus {
    pub run_state: RunState,
    pub active_topic: Option<ActiveTopic>,
    pub leadership: Option<LeadershipState>,
    pub topic_switches: u64,
}

impl Default for ConsumerStatus {
    fn default() -> Self {
        Self {
            run_state: RunState::Stopped,
            active_topic: None,
            leadership: None,
            topic_switches: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_topic_follows_leadership() {
        assert_eq!(
            ActiveTopic::for_leadership(LeadershipState::Leader),
            ActiveTopic::LeaderTopic
        );
        assert_eq!(
            ActiveTopic::for_leadership(LeadershipState::NotLeader),
            ActiveTopic::FollowerTopic
        );
    }

    #[test]
    fn test_leadership_parsing() {
        assert_eq!(
            "LEADER".parse::<LeadershipState>(),
            Ok(LeadershipState::Leader)
        );
        assert_eq!(
            "follower".parse::<LeadershipState>(),
            Ok(LeadershipState::NotLeader)
        );
        assert_eq!(
            "not_leader".parse::<LeadershipState>(),
            Ok(LeadershipState::NotLeader)
        );
        assert!("candidate".parse::<LeadershipState>().is_err());
    }

    #[test]
    fn test_run_duration_from_millis() {
        assert_eq!(RunDuration::from_millis(-1), RunDuration::Unbounded);
        assert_eq!(
            RunDuration::from_millis(250),
            RunDuration::Bounded(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_record_next_offset() {
        let record = Record::new(Partition::new("t", 0), 41, None, None);
        assert_eq!(record.next_offset(), 42);
    }

    #[test]
    fn test_topic_pair_names() {
        let topics = TopicPair::new("users-input", "master");
        assert_eq!(topics.name_of(ActiveTopic::LeaderTopic), "users-input");
        assert_eq!(topics.name_of(ActiveTopic::FollowerTopic), "master");
    }
}
