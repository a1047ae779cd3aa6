//! Commit-log records.
//!
//! The commit log is a topic on which another consumer group publishes its
//! committed offsets. Each record is keyed by `"{topic}:{partition}:{group}"`
//! and carries the group's next offset to read as a decimal string. Topic
//! names cannot contain `:`, group names can, so the key is split on the
//! first two separators only.

use std::str;

use rdkafka::Message;
use thiserror::Error;

use crate::kafka::types::PartitionKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitLogError {
    #[error("commit log record has no key")]
    MissingKey,

    #[error("commit log record has no value")]
    MissingValue,

    #[error("commit log record {field} is not valid UTF-8")]
    InvalidEncoding { field: &'static str },

    #[error("malformed commit log key {0:?}, expected \"topic:partition:group\"")]
    MalformedKey(String),

    #[error("invalid partition {0:?} in commit log key")]
    InvalidPartition(String),

    #[error("invalid offset {0:?} in commit log value")]
    InvalidOffset(String),
}

impl CommitLogError {
    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            CommitLogError::MissingKey => "missing_key",
            CommitLogError::MissingValue => "missing_value",
            CommitLogError::InvalidEncoding { .. } => "invalid_encoding",
            CommitLogError::MalformedKey(_) => "malformed_key",
            CommitLogError::InvalidPartition(_) => "invalid_partition",
            CommitLogError::InvalidOffset(_) => "invalid_offset",
        }
    }
}

/// A consumer group's committed offset for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLogRecord {
    partition: PartitionKey,
    group: String,
    offset: i64,
}

impl CommitLogRecord {
    pub fn new(partition: PartitionKey, group: impl Into<String>, offset: i64) -> Self {
        Self {
            partition,
            group: group.into(),
            offset,
        }
    }

    pub fn parse(key: Option<&[u8]>, value: Option<&[u8]>) -> Result<Self, CommitLogError> {
        let key = key.ok_or(CommitLogError::MissingKey)?;
        let key = str::from_utf8(key).map_err(|_| CommitLogError::InvalidEncoding { field: "key" })?;

        let mut parts = key.splitn(3, ':');
        let (Some(topic), Some(partition), Some(group)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CommitLogError::MalformedKey(key.to_string()));
        };
        if topic.is_empty() || group.is_empty() {
            return Err(CommitLogError::MalformedKey(key.to_string()));
        }

        let partition_number = partition
            .parse::<i32>()
            .ok()
            .filter(|p| *p >= 0)
            .ok_or_else(|| CommitLogError::InvalidPartition(partition.to_string()))?;

        let value = value.ok_or(CommitLogError::MissingValue)?;
        let value =
            str::from_utf8(value).map_err(|_| CommitLogError::InvalidEncoding { field: "value" })?;
        let offset = value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|o| *o >= 0)
            .ok_or_else(|| CommitLogError::InvalidOffset(value.to_string()))?;

        Ok(Self::new(
            PartitionKey::new(topic, partition_number),
            group,
            offset,
        ))
    }

    pub fn from_message<M: Message>(message: &M) -> Result<Self, CommitLogError> {
        Self::parse(message.key(), message.payload())
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Key this record is published under.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.partition.topic(),
            self.partition.partition_number(),
            self.group
        )
    }

    /// Value this record is published with.
    pub fn value(&self) -> String {
        self.offset.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_valid_record() {
        let record = CommitLogRecord::parse(Some(b"events:3:snuba"), Some(b"1042")).unwrap();

        assert_eq!(record.partition(), &PartitionKey::new("events", 3));
        assert_eq!(record.group(), "snuba");
        assert_eq!(record.offset(), 1042);
    }

    #[test]
    fn test_group_may_contain_separator() {
        let record = CommitLogRecord::parse(Some(b"events:0:snuba:sync:1"), Some(b"7")).unwrap();

        assert_eq!(record.group(), "snuba:sync:1");
        assert_eq!(record.key(), "events:0:snuba:sync:1");
    }

    #[test]
    fn test_published_form_parses_back() {
        let record = CommitLogRecord::new(PartitionKey::new("events", 1), "snuba", 99);

        let parsed =
            CommitLogRecord::parse(Some(record.key().as_bytes()), Some(record.value().as_bytes()))
                .unwrap();
        assert_eq!(parsed, record);
    }

    #[rstest]
    #[case(None, Some(&b"1"[..]), "missing_key")]
    #[case(Some(&b"events:0:snuba"[..]), None, "missing_value")]
    #[case(Some(&b"\xff\xfe"[..]), Some(&b"1"[..]), "invalid_encoding")]
    #[case(Some(&b"events:0:snuba"[..]), Some(&b"\xff"[..]), "invalid_encoding")]
    #[case(Some(&b"events:0"[..]), Some(&b"1"[..]), "malformed_key")]
    #[case(Some(&b":0:snuba"[..]), Some(&b"1"[..]), "malformed_key")]
    #[case(Some(&b"events:0:"[..]), Some(&b"1"[..]), "malformed_key")]
    #[case(Some(&b"events:zero:snuba"[..]), Some(&b"1"[..]), "invalid_partition")]
    #[case(Some(&b"events:-1:snuba"[..]), Some(&b"1"[..]), "invalid_partition")]
    #[case(Some(&b"events:0:snuba"[..]), Some(&b"ten"[..]), "invalid_offset")]
    #[case(Some(&b"events:0:snuba"[..]), Some(&b"-5"[..]), "invalid_offset")]
    #[case(Some(&b"events:0:snuba"[..]), Some(&b""[..]), "invalid_offset")]
    fn test_malformed_records_are_rejected(
        #[case] key: Option<&[u8]>,
        #[case] value: Option<&[u8]>,
        #[case] expected: &str,
    ) {
        let err = CommitLogRecord::parse(key, value).unwrap_err();
        assert_eq!(err.error_type(), expected);
    }
}
