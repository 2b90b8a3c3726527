//! Differential-transmission engine for a key-value parameter server.
//!
//! This crate provides the transport-independent half of the DGT push/pull
//! pipeline: KV list and range types, the key-range slicer, block
//! fragmentation, per-fragment contribution scoring, priority-channel
//! assignment, and the loss-driven reliability controller. The API surface is
//! intentionally small: a node crate supplies a transport and a request
//! registry, then drives these pieces from its worker and server loops.

pub mod adaptive;
pub mod channel;
pub mod contribution;
pub mod fragment;
pub mod range;
pub mod slicer;
pub mod types;

pub use adaptive::{AdaptiveK, LossFile};
pub use channel::{assign_channel, order_fragments, OrderMode};
pub use contribution::ContributionTracker;
pub use range::{find_range, validate_partition, Range};
pub use slicer::{DefaultSlicer, SlicedKvs, Slicer};
pub use types::{Key, KvPairs, Message, MsgType, NodeId, RequestMeta, Timestamp};
