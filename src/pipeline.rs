use tokio::sync::mpsc;

/// A single log line or datagram plus its provenance.
///
/// Records are created by exactly one reader task and consumed exactly once
/// by a publisher worker; they are never shared or mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub origin: String,
    pub raw: Vec<u8>,
}

impl Record {
    pub fn new(topic: impl Into<String>, origin: impl Into<String>, raw: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            origin: origin.into(),
            raw,
        }
    }
}

/// An ordered, size-bounded group of record payloads for one topic,
/// published to the broker as a single multi-record call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub topic: String,
    pub records: Vec<Vec<u8>>,
}

impl Batch {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Element of the shared publish queue. File tailers hand over whole
/// pre-assembled batches; network and watch sources send records one at a
/// time and let the publisher workers do the batching.
#[derive(Debug, Clone)]
pub enum Item {
    Record(Record),
    Batch(Batch),
}

pub type Sender = mpsc::Sender<Item>;
pub type Receiver = mpsc::Receiver<Item>;

/// Create the bounded publish queue shared by all sources and workers.
pub fn publish_queue(capacity: usize) -> (Sender, Receiver) {
    mpsc::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_starts_empty() {
        let batch = Batch::new("app");
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.topic, "app");
    }

    #[test]
    fn record_carries_provenance() {
        let rec = Record::new("app", "10.0.0.1:514", b"hello".to_vec());
        assert_eq!(rec.origin, "10.0.0.1:514");
        assert_eq!(rec.raw, b"hello");
    }
}
