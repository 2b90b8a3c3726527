//! Fragment ordering and priority-channel assignment.
//!
//! Ranked fragments are mapped onto one reliable channel (0) plus `C` lossy
//! channels. The reliability fraction `k` sets how many of the top-ranked
//! fragments are pinned to channel 0; the rest are spread evenly across the
//! lossy channels. The terminator fragment is always forced onto channel 0
//! by the caller, whatever its rank.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::types::Message;

/// How the fragment vector is ordered before channel assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderMode {
    /// Strictly descending by contribution score.
    Ranked,
    /// Uniform shuffle, for ablation runs.
    Shuffled,
}

/// Order a fragment vector in place.
///
/// The terminator must be the last element on entry (the fragment planner
/// emits it that way); it is detached first and reattached last so neither
/// the sort nor the shuffle can move it.
pub fn order_fragments<R: Rng>(frags: &mut Vec<Message>, mode: OrderMode, rng: &mut R) {
    if frags.len() <= 1 {
        return;
    }
    let terminator = match frags.pop() {
        Some(t) => t,
        None => return,
    };
    debug_assert_eq!(terminator.meta.seq, terminator.meta.seq_end);
    match mode {
        OrderMode::Ranked => {
            frags.sort_by(|a, b| b.contri.total_cmp(&a.contri));
        }
        OrderMode::Shuffled => frags.shuffle(rng),
    }
    frags.push(terminator);
}

/// Map one rank to a channel index.
///
/// `rank` is the fragment's position in the ordered vector, `max_index` the
/// last position (`n - 1`). The top `round(k * n)` ranks go to the reliable
/// channel 0. The remaining span `[min_index, max_index)` is divided into
/// `channels` equal segments mapped to channels `1..=channels`; a collapsed
/// span maps straight to channel 1. Ranks that fall outside every segment
/// draw a uniform lossy channel from `rng`.
pub fn assign_channel<R: Rng>(
    rank: usize,
    max_index: usize,
    channels: u32,
    k: f32,
    rng: &mut R,
) -> u32 {
    let min_index = (k * (max_index as f32 + 1.0)).round() as usize;
    if rank < min_index {
        return 0;
    }
    if channels == 0 {
        // No lossy channels configured: everything stays reliable.
        return 0;
    }
    let span = max_index.saturating_sub(min_index);
    for ch in 0..channels {
        if span == 0 {
            return 1;
        }
        let lo = min_index as f32 + ch as f32 * span as f32 / channels as f32;
        let hi = min_index as f32 + (ch as f32 + 1.0) * span as f32 / channels as f32;
        if (rank as f32) >= lo && (rank as f32) < hi {
            return ch + 1;
        }
    }
    rng.gen_range(1..=channels)
}
