//! Routing entities to partitions.

use std::hash::Hasher;

use seahash::SeaHasher;
use serde::{Deserialize, Serialize};

/// IDs a specific partition.
///
/// The inner value will be up to [`PartitionCount`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionIndex(pub usize);

/// Total number of partitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCount(pub usize);

impl PartitionCount {
    /// Return an iter of all partitions.
    pub fn iter(&self) -> impl Iterator<Item = PartitionIndex> {
        (0..self.0).map(PartitionIndex)
    }
}

/// Assigns each entity id to exactly one partition.
///
/// Uses SeaHash with fixed keys so the assignment is the same in
/// every process and across restarts, which recovery relies on to
/// route restored state.
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    count: PartitionCount,
}

impl Partitioner {
    pub fn new(count: PartitionCount) -> Self {
        assert!(count.0 > 0, "partition count must be positive");
        Self { count }
    }

    pub fn count(&self) -> PartitionCount {
        self.count
    }

    pub fn partition(&self, entity_id: &str) -> PartitionIndex {
        let mut hasher = SeaHasher::new();
        hasher.write(entity_id.as_bytes());
        PartitionIndex((hasher.finish() % self.count.0 as u64) as usize)
    }
}

#[test]
fn partition_is_stable() {
    let partitioner = Partitioner::new(PartitionCount(8));
    let first = partitioner.partition("u1");
    for _ in 0..100 {
        assert_eq!(partitioner.partition("u1"), first);
    }
    // A second instance with the same count agrees.
    assert_eq!(Partitioner::new(PartitionCount(8)).partition("u1"), first);
}

#[test]
fn partition_within_count() {
    let partitioner = Partitioner::new(PartitionCount(3));
    for i in 0..1000 {
        let PartitionIndex(index) = partitioner.partition(&format!("user-{i}"));
        assert!(index < 3);
    }
}

#[test]
fn partition_spreads_keys() {
    let count = PartitionCount(4);
    let partitioner = Partitioner::new(count);
    let mut seen = vec![0; count.0];
    for i in 0..1000 {
        seen[partitioner.partition(&format!("user-{i}")).0] += 1;
    }
    assert!(seen.iter().all(|hits| *hits > 100), "skewed: {seen:?}");
}

#[test]
fn partition_count_iter() {
    let found: Vec<_> = PartitionCount(3).iter().collect();
    assert_eq!(
        found,
        vec![PartitionIndex(0), PartitionIndex(1), PartitionIndex(2)]
    );
}

#[test]
fn partition_index_serde_shape() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(
        &PartitionIndex(3),
        &[
            Token::NewtypeStruct {
                name: "PartitionIndex",
            },
            Token::U64(3),
        ],
    );
}
