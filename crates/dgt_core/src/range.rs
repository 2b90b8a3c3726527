//! Half-open key ranges and the server key partition.

use serde::{Deserialize, Serialize};

use crate::types::Key;

/// A half-open key range `[begin, end)`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Range {
    pub begin: Key,
    pub end: Key,
}

impl Range {
    pub const fn new(begin: Key, end: Key) -> Self {
        Self { begin, end }
    }

    /// Number of keys covered by the range.
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.begin <= key && key < self.end
    }
}

/// Index span of the keys falling inside `[begin, end)`.
///
/// `keys` must be sorted; the result is empty when no key matches.
pub fn find_range(keys: &[Key], begin: Key, end: Key) -> std::ops::Range<usize> {
    let lo = keys.partition_point(|&k| k < begin);
    let hi = keys.partition_point(|&k| k < end);
    lo..hi.max(lo)
}

/// Check that a server partition is sorted, contiguous and non-overlapping:
/// `ranges[i].end == ranges[i + 1].begin` for every adjacent pair.
pub fn validate_partition(ranges: &[Range]) -> anyhow::Result<()> {
    for (i, r) in ranges.iter().enumerate() {
        anyhow::ensure!(
            r.begin <= r.end,
            "server range {} is inverted: [{}, {})",
            i,
            r.begin,
            r.end
        );
        if i > 0 {
            anyhow::ensure!(
                ranges[i - 1].end == r.begin,
                "server ranges {} and {} are not contiguous: [.., {}) then [{}, ..)",
                i - 1,
                i,
                ranges[i - 1].end,
                r.begin
            );
        }
    }
    Ok(())
}
