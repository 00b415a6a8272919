//! Range-set algebra over logical clocks
//!
//! Sets of closed, non-overlapping, ascending `u64` intervals. Used to
//! describe which logical clocks of a process are wanted, held, or still
//! outstanding when requesting events from a server.

use crate::wire::WireRange;

/// A closed interval of logical clocks: `low..=high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub low: u64,
    pub high: u64,
}

impl Range {
    pub fn new(low: u64, high: u64) -> Self {
        debug_assert!(low <= high);
        Self { low, high }
    }
}

/// An ordered set of disjoint closed intervals.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeSet(Vec<Range>);

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ranges(&self) -> &[Range] {
        &self.0
    }

    /// Number of individual values covered.
    pub fn value_count(&self) -> u64 {
        self.0.iter().map(|r| r.high - r.low + 1).sum()
    }

    /// Insert a single value, merging with adjacent intervals.
    pub fn insert(&mut self, value: u64) {
        let pos = self.0.partition_point(|r| r.high < value);

        if pos < self.0.len() && self.0[pos].low <= value {
            // Already contained
            return;
        }

        let joins_left = pos > 0 && self.0[pos - 1].high + 1 == value;
        let joins_right = pos < self.0.len() && value + 1 == self.0[pos].low;

        match (joins_left, joins_right) {
            (true, true) => {
                self.0[pos - 1].high = self.0[pos].high;
                self.0.remove(pos);
            }
            (true, false) => self.0[pos - 1].high = value,
            (false, true) => self.0[pos].low = value,
            (false, false) => self.0.insert(pos, Range::new(value, value)),
        }
    }

    /// Does the set contain `value`?
    pub fn contains(&self, value: u64) -> bool {
        let pos = self.0.partition_point(|r| r.high < value);
        pos < self.0.len() && self.0[pos].low <= value
    }

    /// Set difference: the values in `self` not covered by `have`.
    pub fn subtract(&self, have: &RangeSet) -> RangeSet {
        let mut need = Vec::new();
        let mut held = have.0.iter().peekable();

        for want in &self.0 {
            let mut low = want.low;
            loop {
                // Skip held intervals entirely below the remaining window
                while let Some(h) = held.peek() {
                    if h.high < low {
                        held.next();
                    } else {
                        break;
                    }
                }
                match held.peek() {
                    Some(h) if h.low <= want.high => {
                        if h.low > low {
                            need.push(Range::new(low, h.low - 1));
                        }
                        if h.high >= want.high {
                            break;
                        }
                        low = h.high + 1;
                    }
                    _ => {
                        need.push(Range::new(low, want.high));
                        break;
                    }
                }
            }
        }

        RangeSet(need)
    }

    /// Keep only the first `limit` values (lowest clocks first).
    pub fn take_max_items(&self, limit: u64) -> RangeSet {
        let mut out = Vec::new();
        let mut remaining = limit;
        for r in &self.0 {
            if remaining == 0 {
                break;
            }
            let span = r.high - r.low + 1;
            if span <= remaining {
                out.push(*r);
                remaining -= span;
            } else {
                out.push(Range::new(r.low, r.low + remaining - 1));
                remaining = 0;
            }
        }
        RangeSet(out)
    }

    /// Iterate over every value covered, ascending.
    pub fn values(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().flat_map(|r| r.low..=r.high)
    }

    pub fn to_wire(&self) -> Vec<WireRange> {
        self.0
            .iter()
            .map(|r| WireRange {
                low: r.low,
                high: r.high,
            })
            .collect()
    }

    pub fn from_wire(ranges: &[WireRange]) -> Self {
        let mut set = RangeSet::new();
        for r in ranges {
            for v in r.low..=r.high {
                set.insert(v);
            }
        }
        set
    }
}

impl FromIterator<u64> for RangeSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for v in iter {
            set.insert(v);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[u64]) -> RangeSet {
        values.iter().copied().collect()
    }

    #[test]
    fn test_insert_merges_adjacent() {
        let s = set(&[1, 3, 2]);
        assert_eq!(s.ranges(), &[Range::new(1, 3)]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let s = set(&[5, 5, 5]);
        assert_eq!(s.ranges(), &[Range::new(5, 5)]);
        assert_eq!(s.value_count(), 1);
    }

    #[test]
    fn test_insert_keeps_gaps() {
        let s = set(&[1, 2, 10, 11, 5]);
        assert_eq!(
            s.ranges(),
            &[Range::new(1, 2), Range::new(5, 5), Range::new(10, 11)]
        );
    }

    #[test]
    fn test_contains() {
        let s = set(&[1, 2, 3, 7]);
        assert!(s.contains(2));
        assert!(s.contains(7));
        assert!(!s.contains(5));
        assert!(!s.contains(0));
    }

    #[test]
    fn test_subtract_splits_intervals() {
        let want = set(&[1, 2, 3, 4, 5, 6]);
        let have = set(&[3, 4]);
        assert_eq!(
            want.subtract(&have).ranges(),
            &[Range::new(1, 2), Range::new(5, 6)]
        );
    }

    #[test]
    fn test_subtract_disjoint_keeps_all() {
        let want = set(&[1, 2]);
        let have = set(&[10, 11]);
        assert_eq!(want.subtract(&have), want);
    }

    #[test]
    fn test_subtract_everything() {
        let want = set(&[1, 2, 3]);
        assert!(want.subtract(&want).is_empty());
    }

    #[test]
    fn test_take_max_items_truncates() {
        let s = set(&[1, 2, 3, 10, 11, 12]);
        let taken = s.take_max_items(4);
        assert_eq!(taken.ranges(), &[Range::new(1, 3), Range::new(10, 10)]);
        assert_eq!(taken.value_count(), 4);
    }

    #[test]
    fn test_values_iterates_ascending() {
        let s = set(&[4, 1, 2, 9]);
        assert_eq!(s.values().collect::<Vec<_>>(), vec![1, 2, 4, 9]);
    }
}
