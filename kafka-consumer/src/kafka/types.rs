use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::TopicPartitionList;

/// Identity of a partition within a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

impl From<TopicPartitionListElem<'_>> for TopicPartition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub name: String,
    pub value: Vec<u8>,
}

impl RecordHeader {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A record as returned by the host client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: SystemTime,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<RecordHeader>,
}

impl Record {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A single-partition batch of records, in strictly increasing offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetch {
    pub topic: String,
    pub partition: i32,
    pub records: Vec<Record>,
}

impl Fetch {
    pub fn new(topic: impl Into<String>, partition: i32, records: Vec<Record>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            records,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(|r| r.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(|r| r.offset)
    }
}

/// Partitions grouped by topic, the shape rebalance callbacks report.
pub type PartitionAssignments = BTreeMap<String, Vec<i32>>;

pub fn assignments_from_list(list: &TopicPartitionList) -> PartitionAssignments {
    let mut out = PartitionAssignments::new();
    for elem in list.elements() {
        out.entry(elem.topic().to_string())
            .or_default()
            .push(elem.partition());
    }
    out
}

pub fn flatten_assignments(assignments: &PartitionAssignments) -> Vec<TopicPartition> {
    assignments
        .iter()
        .flat_map(|(topic, partitions)| {
            partitions
                .iter()
                .map(move |p| TopicPartition::new(topic.clone(), *p))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;

    #[test]
    fn test_assignments_from_list_groups_by_topic() {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset("orders", 0, Offset::Beginning)
            .unwrap();
        list.add_partition_offset("orders", 2, Offset::Beginning)
            .unwrap();
        list.add_partition_offset("payments", 1, Offset::Beginning)
            .unwrap();

        let assignments = assignments_from_list(&list);
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments["orders"], vec![0, 2]);
        assert_eq!(assignments["payments"], vec![1]);

        let flat = flatten_assignments(&assignments);
        assert_eq!(
            flat,
            vec![
                TopicPartition::new("orders", 0),
                TopicPartition::new("orders", 2),
                TopicPartition::new("payments", 1),
            ]
        );
    }

    #[test]
    fn test_topic_partition_display() {
        assert_eq!(TopicPartition::new("events", 7).to_string(), "events:7");
    }
}
