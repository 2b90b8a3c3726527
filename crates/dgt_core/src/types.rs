//! Shared types for the DGT push/pull pipeline.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the send pipeline and the transport/server layers. Value
//! payloads are raw bytes (`bytes::Bytes`) so that slicing and block
//! fragmentation are zero-copy and the pipeline stays agnostic to the value
//! element type; only the contribution scorer interprets bytes as `f32`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Parameter key. Unique and totally ordered.
pub type Key = u64;
/// Logical node identifier assigned by the cluster bootstrap.
pub type NodeId = u64;
/// Per-customer request timestamp (sequence number).
pub type Timestamp = i32;

/// Byte width of one serialized key.
pub const KEY_BYTES: usize = std::mem::size_of::<Key>();
/// Byte width of one serialized length entry.
pub const LEN_BYTES: usize = std::mem::size_of::<u32>();

/// A list of key-value pairs.
///
/// Keys must be unique and sorted in increasing order. The length of a value
/// can be more than one element. If `lens` is empty, every value holds
/// `vals_elems / keys.len()` elements; otherwise `lens[i]` is the element
/// count of the `i`-th value. The element width is supplied by the caller
/// (pipelines are parameterized by byte width, four for `f32` gradients).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KvPairs {
    /// The list of keys, strictly increasing.
    pub keys: Vec<Key>,
    /// The value payload, concatenated in key order.
    pub vals: Bytes,
    /// Per-key value lengths in elements (may be empty for uniform layout).
    pub lens: Vec<u32>,
    /// Scheduling priority forwarded to the transport.
    pub priority: i32,
}

impl KvPairs {
    /// Check the structural invariants for a given element byte width.
    ///
    /// Violations are invalid-argument errors surfaced to the caller before
    /// anything is sent.
    pub fn validate(&self, val_width: usize) -> anyhow::Result<()> {
        anyhow::ensure!(val_width > 0, "value element width must be non-zero");
        anyhow::ensure!(
            self.keys.windows(2).all(|w| w[0] < w[1]),
            "keys must be unique and sorted in increasing order"
        );
        if self.lens.is_empty() {
            if self.keys.is_empty() {
                anyhow::ensure!(
                    self.vals.is_empty(),
                    "values present without any key"
                );
                return Ok(());
            }
            anyhow::ensure!(
                self.vals.len() % val_width == 0,
                "value payload of {} bytes is not a whole number of {}-byte elements",
                self.vals.len(),
                val_width
            );
            let elems = self.vals.len() / val_width;
            anyhow::ensure!(
                elems % self.keys.len() == 0,
                "{} value elements cannot be evenly divided over {} keys",
                elems,
                self.keys.len()
            );
        } else {
            anyhow::ensure!(
                self.lens.len() == self.keys.len(),
                "lens size {} does not match keys size {}",
                self.lens.len(),
                self.keys.len()
            );
            let total: usize = self.lens.iter().map(|&l| l as usize).sum();
            anyhow::ensure!(
                total * val_width == self.vals.len(),
                "lens cover {} bytes but the value payload has {}",
                total * val_width,
                self.vals.len()
            );
        }
        Ok(())
    }
}

/// Kind of a request message on the wire.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum MsgType {
    /// Responses and control traffic carry no DGT framing.
    #[default]
    Plain,
    /// Whole-slice push opening a training round; bypasses scoring.
    FirstPush,
    /// One ranked block of a sliced push payload.
    PushFragment,
    /// Pull request (no value payload).
    Pull,
}

/// Metadata attached to every message handed to the transport.
///
/// The `keys_len`/`vals_len`/`lens_len` fields mirror the byte sizes of the
/// attached arrays so a framing layer can pre-allocate without inspecting the
/// payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub app_id: i32,
    pub customer_id: i32,
    /// True for requests, false for responses.
    pub request: bool,
    pub push: bool,
    pub pull: bool,
    /// Application command forwarded to the server handle.
    pub cmd: i32,
    pub timestamp: Timestamp,
    pub sender: NodeId,
    pub recver: NodeId,
    pub priority: i32,
    pub msg_type: MsgType,
    /// First key of the originating slice; identifies the scored parameter.
    pub first_key: Key,
    /// Fragment sequence number within the slice.
    pub seq: u32,
    pub seq_begin: u32,
    /// Sequence number of the terminator fragment.
    pub seq_end: u32,
    /// Byte offset of this fragment's values inside the slice payload.
    pub val_bytes: usize,
    /// Total byte size of the slice payload.
    pub total_bytes: usize,
    /// Round counter; bumped by each push whose first key is zero.
    pub push_op_num: u64,
    /// Transport channel chosen by the ranker (0 = reliable).
    pub channel: u32,
    pub keys_len: usize,
    pub vals_len: usize,
    pub lens_len: usize,
    /// Optional fine-grained response target (key count) for the tracker.
    pub tracker_num: usize,
}

/// One transport message: metadata plus the attached KV arrays.
#[derive(Clone, Debug, Default)]
pub struct Message {
    pub meta: RequestMeta,
    pub keys: Vec<Key>,
    pub vals: Bytes,
    pub lens: Vec<u32>,
    /// Contribution score attached by the estimator (fragments only).
    pub contri: f32,
}

impl Message {
    /// Attach KV arrays and record their byte sizes in the metadata.
    pub fn attach(&mut self, keys: Vec<Key>, vals: Bytes, lens: Vec<u32>) {
        self.meta.keys_len = keys.len() * KEY_BYTES;
        self.meta.vals_len = vals.len();
        self.meta.lens_len = lens.len() * LEN_BYTES;
        self.keys = keys;
        self.vals = vals;
        self.lens = lens;
    }

    /// Total payload bytes carried by the attached arrays.
    pub fn payload_bytes(&self) -> usize {
        self.meta.keys_len + self.meta.vals_len + self.meta.lens_len
    }
}

/// Serialize an `f32` slice into a little-endian byte payload.
pub fn f32_bytes(vals: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(vals.len() * 4);
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
    Bytes::from(out)
}

/// Decode a little-endian byte payload back into `f32` values.
///
/// Trailing bytes that do not fill a whole element are ignored.
pub fn f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
