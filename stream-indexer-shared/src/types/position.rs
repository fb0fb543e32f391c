//! Stream position types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a record within a partitioned stream.
///
/// Offsets are monotonic within a partition. Positions from different
/// partitions are not comparable in any meaningful way, so `Ord` is only
/// useful for grouping and stable sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamPosition {
    /// The partition the record was read from.
    pub partition: i32,
    /// The record's offset within the partition.
    pub offset: i64,
}

impl StreamPosition {
    /// Create a new stream position.
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }

    /// The position directly before this one in the same partition.
    pub fn previous(&self) -> Self {
        Self {
            partition: self.partition,
            offset: self.offset - 1,
        }
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(StreamPosition::new(3, 42).to_string(), "3@42");
    }

    #[test]
    fn test_previous_stays_in_partition() {
        let pos = StreamPosition::new(1, 10);
        assert_eq!(pos.previous(), StreamPosition::new(1, 9));
    }
}
