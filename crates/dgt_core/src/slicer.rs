//! Key-range slicing of a KV list into per-server sub-lists.
//!
//! The slicer is an injection point on the worker: callers with a custom key
//! layout can swap in their own implementation, the default below is the
//! binary-search contract used by everything else.

use crate::range::{validate_partition, Range};
use crate::types::KvPairs;

/// Per-server slices. The flag marks slices that actually carry keys; empty
/// slices stay disabled so the sender can pre-credit their responses.
pub type SlicedKvs = Vec<(bool, KvPairs)>;

/// Partition a KV list according to the server key ranges.
///
/// `sliced[i]` must only contain keys in `ranges[i]` and the according
/// values.
pub trait Slicer: Send + Sync {
    fn slice(
        &self,
        send: &KvPairs,
        ranges: &[Range],
        val_width: usize,
    ) -> anyhow::Result<SlicedKvs>;
}

/// Default slicer: binary-search range boundaries into the key list, then
/// carve the value payload with either uniform stride or per-key lengths.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSlicer;

impl Slicer for DefaultSlicer {
    fn slice(
        &self,
        send: &KvPairs,
        ranges: &[Range],
        val_width: usize,
    ) -> anyhow::Result<SlicedKvs> {
        validate_partition(ranges)?;
        let n = ranges.len();
        let mut sliced: SlicedKvs = vec![(false, KvPairs::default()); n];

        // Find the boundary positions of every range in the key list.
        let mut pos = vec![0usize; n + 1];
        for (i, range) in ranges.iter().enumerate() {
            if i == 0 {
                pos[0] = send.keys.partition_point(|&k| k < range.begin);
            }
            pos[i + 1] = send.keys.partition_point(|&k| k < range.end);
        }
        anyhow::ensure!(
            pos[n] == send.keys.len(),
            "{} keys fall beyond the server partition",
            send.keys.len() - pos[n]
        );
        if send.keys.is_empty() {
            return Ok(sliced);
        }

        // Per-key byte offsets: uniform stride for empty lens, prefix sums
        // otherwise.
        let byte_offset: Vec<usize> = if send.lens.is_empty() {
            anyhow::ensure!(
                send.vals.len() % val_width == 0,
                "value payload is not a whole number of elements"
            );
            let elems = send.vals.len() / val_width;
            anyhow::ensure!(
                elems % send.keys.len() == 0,
                "{} value elements cannot be evenly divided over {} keys",
                elems,
                send.keys.len()
            );
            let stride = (elems / send.keys.len()) * val_width;
            (0..=send.keys.len()).map(|i| i * stride).collect()
        } else {
            anyhow::ensure!(
                send.lens.len() == send.keys.len(),
                "lens size {} does not match keys size {}",
                send.lens.len(),
                send.keys.len()
            );
            let mut prefix = Vec::with_capacity(send.keys.len() + 1);
            let mut acc = 0usize;
            prefix.push(acc);
            for &l in &send.lens {
                acc += l as usize * val_width;
                prefix.push(acc);
            }
            anyhow::ensure!(
                acc == send.vals.len(),
                "lens cover {acc} bytes but the value payload has {}",
                send.vals.len()
            );
            prefix
        };

        for i in 0..n {
            if pos[i + 1] == pos[i] {
                continue;
            }
            let entry = &mut sliced[i];
            entry.0 = true;
            let kv = &mut entry.1;
            kv.keys = send.keys[pos[i]..pos[i + 1]].to_vec();
            kv.priority = send.priority;
            if !send.lens.is_empty() {
                kv.lens = send.lens[pos[i]..pos[i + 1]].to_vec();
            }
            kv.vals = send.vals.slice(byte_offset[pos[i]]..byte_offset[pos[i + 1]]);
        }
        Ok(sliced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::f32_bytes;

    fn ranges3() -> Vec<Range> {
        vec![
            Range::new(0, 4),
            Range::new(4, 8),
            Range::new(8, u64::MAX),
        ]
    }

    #[test]
    fn uniform_layout_slices_by_stride() {
        let send = KvPairs {
            keys: vec![1, 5, 9],
            vals: f32_bytes(&[1.0, 1.5, 5.0, 5.5, 9.0, 9.5]),
            lens: vec![],
            priority: 3,
        };
        let sliced = DefaultSlicer.slice(&send, &ranges3(), 4).unwrap();
        assert_eq!(sliced.len(), 3);
        for (enabled, kv) in &sliced {
            assert!(*enabled);
            assert_eq!(kv.keys.len(), 1);
            assert_eq!(kv.vals.len(), 8);
            assert_eq!(kv.priority, 3);
        }
        assert_eq!(sliced[1].1.keys, vec![5]);
        assert_eq!(sliced[1].1.vals, f32_bytes(&[5.0, 5.5]));
    }

    #[test]
    fn per_key_lens_slice_by_prefix_sum() {
        let send = KvPairs {
            keys: vec![1, 5, 9],
            vals: f32_bytes(&[1.0, 5.0, 5.5, 5.75, 9.0, 9.5]),
            lens: vec![1, 3, 2],
            priority: 0,
        };
        let sliced = DefaultSlicer.slice(&send, &ranges3(), 4).unwrap();
        assert_eq!(sliced[0].1.vals, f32_bytes(&[1.0]));
        assert_eq!(sliced[1].1.vals, f32_bytes(&[5.0, 5.5, 5.75]));
        assert_eq!(sliced[1].1.lens, vec![3]);
        assert_eq!(sliced[2].1.vals, f32_bytes(&[9.0, 9.5]));
    }

    #[test]
    fn empty_ranges_are_disabled() {
        let send = KvPairs {
            keys: vec![9, 11],
            vals: f32_bytes(&[9.0, 11.0]),
            lens: vec![],
            priority: 0,
        };
        let sliced = DefaultSlicer.slice(&send, &ranges3(), 4).unwrap();
        assert!(!sliced[0].0);
        assert!(!sliced[1].0);
        assert!(sliced[2].0);
        assert_eq!(sliced[2].1.keys, vec![9, 11]);
    }

    #[test]
    fn empty_input_disables_everything() {
        let sliced = DefaultSlicer
            .slice(&KvPairs::default(), &ranges3(), 4)
            .unwrap();
        assert!(sliced.iter().all(|(enabled, _)| !enabled));
    }

    #[test]
    fn broken_partition_is_rejected() {
        let send = KvPairs {
            keys: vec![1],
            vals: f32_bytes(&[1.0]),
            lens: vec![],
            priority: 0,
        };
        let gap = [Range::new(0, 4), Range::new(6, u64::MAX)];
        assert!(DefaultSlicer.slice(&send, &gap, 4).is_err());
    }
}
