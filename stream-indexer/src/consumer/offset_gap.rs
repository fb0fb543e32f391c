//! Detection of offset jumps within a partition.
//!
//! A jump means the records in between expired or were compacted away before
//! they could be read. Seeding a partition with the group's committed
//! position also catches the jump made when a consumer resumes and that
//! position is no longer retained.

use std::collections::HashMap;

/// A range of offsets that was never delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetGap {
    pub partition: i32,
    /// First missing offset.
    pub from: i64,
    /// Last missing offset (inclusive).
    pub to: i64,
}

impl OffsetGap {
    /// Number of records that were skipped.
    pub fn len(&self) -> i64 {
        self.to - self.from + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }
}

/// Remembers the last offset seen per partition.
#[derive(Debug, Default)]
pub struct OffsetGapTracker {
    last_seen: HashMap<i32, i64>,
}

impl OffsetGapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything is known about `partition` yet.
    pub fn is_known(&self, partition: i32) -> bool {
        self.last_seen.contains_key(&partition)
    }

    /// Expect `next_offset` to be the next offset of `partition`.
    ///
    /// Ignored once the partition has been observed.
    pub fn seed(&mut self, partition: i32, next_offset: i64) {
        self.last_seen.entry(partition).or_insert(next_offset - 1);
    }

    /// Record an offset and report the skipped range, if any.
    ///
    /// The first offset seen for an unseeded partition never reports a gap.
    /// A rewind (re-delivery after a rebalance) resets the expectation
    /// silently.
    pub fn observe(&mut self, partition: i32, offset: i64) -> Option<OffsetGap> {
        let previous = self.last_seen.insert(partition, offset)?;
        if offset > previous + 1 {
            Some(OffsetGap {
                partition,
                from: previous + 1,
                to: offset - 1,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_offsets_have_no_gap() {
        let mut tracker = OffsetGapTracker::new();
        assert_eq!(tracker.observe(0, 5), None);
        assert_eq!(tracker.observe(0, 6), None);
        assert_eq!(tracker.observe(0, 7), None);
    }

    #[test]
    fn test_jump_reports_missing_range() {
        let mut tracker = OffsetGapTracker::new();
        tracker.observe(1, 10);
        let gap = tracker.observe(1, 15).unwrap();
        assert_eq!(gap, OffsetGap { partition: 1, from: 11, to: 14 });
        assert_eq!(gap.len(), 4);
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut tracker = OffsetGapTracker::new();
        tracker.observe(0, 100);
        assert_eq!(tracker.observe(1, 3), None);
        assert_eq!(tracker.observe(0, 101), None);
    }

    #[test]
    fn test_resume_past_committed_position_reports_gap() {
        let mut tracker = OffsetGapTracker::new();
        assert!(!tracker.is_known(2));
        tracker.seed(2, 100);
        assert!(tracker.is_known(2));

        let gap = tracker.observe(2, 250).unwrap();
        assert_eq!(gap, OffsetGap { partition: 2, from: 100, to: 249 });
        assert_eq!(gap.len(), 150);
    }

    #[test]
    fn test_resume_at_committed_position_is_not_a_gap() {
        let mut tracker = OffsetGapTracker::new();
        tracker.seed(0, 100);
        assert_eq!(tracker.observe(0, 100), None);
        assert_eq!(tracker.observe(0, 101), None);
    }

    #[test]
    fn test_seed_after_observe_is_ignored() {
        let mut tracker = OffsetGapTracker::new();
        tracker.observe(0, 10);
        tracker.seed(0, 3);
        assert_eq!(tracker.observe(0, 11), None);
    }

    #[test]
    fn test_rewind_is_not_a_gap() {
        let mut tracker = OffsetGapTracker::new();
        tracker.observe(0, 50);
        assert_eq!(tracker.observe(0, 40), None);
        assert_eq!(tracker.observe(0, 41), None);
    }
}
