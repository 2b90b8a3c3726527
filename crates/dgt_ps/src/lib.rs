//! Worker and server halves of the DGT parameter-server protocol.
//!
//! `dgt_core` supplies the transport-independent pipeline pieces; this crate
//! wires them into the request lifecycle: a [`KvWorker`] that slices,
//! fragments, scores and dispatches pushes (and assembles pulls), a
//! [`KvServer`] that decodes requests for a pluggable handle, the
//! [`Customer`] request registry, and the [`Van`] transport boundary with an
//! in-process implementation for tests and single-machine runs.

pub mod cluster;
pub mod config;
pub mod customer;
pub mod server;
pub mod van;
pub mod worker;

pub use cluster::{ServerMap, ServerSlot};
pub use config::{ChannelConfig, DgtConfig};
pub use customer::Customer;
pub use server::{DefaultStoreHandle, KvMeta, KvServer, ReqHandle};
pub use van::{MemHub, MemVan, MessageHandler, Van};
pub use worker::{Callback, KvWorker, PullBuffer, WorkerDebugStats, WorkerOptions};
