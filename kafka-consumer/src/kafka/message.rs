use std::time::SystemTime;

use crate::kafka::types::{Record, RecordHeader, TopicPartition};

/// The record shape handed to a [`crate::processor::Processor`].
///
/// Kept separate from [`Record`] so processors never depend on the host
/// client's representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: SystemTime,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<RecordHeader>,
}

impl Message {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// First header with the given name, if any.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_slice())
    }

    pub fn key_as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.key)
    }

    pub fn value_as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.value)
    }
}

impl From<&Record> for Message {
    fn from(record: &Record) -> Self {
        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            timestamp: record.timestamp,
            key: record.key.clone(),
            value: record.value.clone(),
            headers: record.headers.clone(),
        }
    }
}

impl From<Record> for Message {
    fn from(record: Record) -> Self {
        Self {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            timestamp: record.timestamp,
            key: record.key,
            value: record.value,
            headers: record.headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_from_record() {
        let record = Record {
            topic: "events".to_string(),
            partition: 2,
            offset: 41,
            timestamp: SystemTime::UNIX_EPOCH,
            key: b"user-1".to_vec(),
            value: b"{\"event\":\"$pageview\"}".to_vec(),
            headers: vec![
                RecordHeader::new("traceparent", "00-abc-def-01"),
                RecordHeader::new("token", "phc_1"),
                RecordHeader::new("token", "phc_2"),
            ],
        };

        let message = Message::from(&record);
        assert_eq!(message.topic_partition(), TopicPartition::new("events", 2));
        assert_eq!(message.offset, 41);
        assert_eq!(message.key_as_str().unwrap(), "user-1");
        assert_eq!(message.value_as_str().unwrap(), "{\"event\":\"$pageview\"}");
        // first match wins
        assert_eq!(message.header("token"), Some(&b"phc_1"[..]));
        assert_eq!(message.header("missing"), None);

        assert_eq!(Message::from(record.clone()), message);
    }
}
