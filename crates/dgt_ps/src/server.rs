//! Server half of the push/pull protocol.
//!
//! The server decodes inbound requests, hands them to a pluggable
//! [`ReqHandle`], and frames responses back to the requesting worker. The
//! application owns all storage semantics; [`DefaultStoreHandle`] is the
//! reference handle accumulating `f32` gradients per key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error};

use dgt_core::types::{f32_bytes, f32_vec, Key, KvPairs, Message, NodeId, Timestamp};

use crate::customer::Customer;
use crate::van::{MessageHandler, Van};

/// Meta information about one decoded KV request.
#[derive(Clone, Copy, Debug, Default)]
pub struct KvMeta {
    pub cmd: i32,
    pub push: bool,
    pub pull: bool,
    pub sender: NodeId,
    pub timestamp: Timestamp,
    pub customer_id: i32,
}

/// Application handle processing one decoded request.
pub trait ReqHandle: Send + Sync {
    fn handle(&self, meta: &KvMeta, data: &KvPairs, server: &KvServer);
}

/// A server node maintaining key-value pairs for its key range.
pub struct KvServer {
    customer: Customer,
    van: Arc<dyn Van>,
    handle: RwLock<Option<Arc<dyn ReqHandle>>>,
}

impl KvServer {
    pub fn new(app_id: i32, van: Arc<dyn Van>) -> Self {
        Self {
            customer: Customer::new(app_id, app_id),
            van,
            handle: RwLock::new(None),
        }
    }

    /// Install (or swap) the request handle.
    pub fn set_request_handle(&self, handle: Arc<dyn ReqHandle>) {
        *self.handle.write().unwrap() = Some(handle);
    }

    pub fn app_id(&self) -> i32 {
        self.customer.app_id()
    }

    /// Send `res` back to the worker identified by `req`.
    ///
    /// Echoes `{cmd, push, pull, timestamp}`, flips the request flag, and
    /// attaches the KV arrays when the response carries keys.
    pub fn response(&self, req: &KvMeta, res: KvPairs) -> anyhow::Result<usize> {
        let mut msg = Message::default();
        msg.meta.app_id = self.customer.app_id();
        msg.meta.customer_id = req.customer_id;
        msg.meta.request = false;
        msg.meta.push = req.push;
        msg.meta.pull = req.pull;
        msg.meta.cmd = req.cmd;
        msg.meta.timestamp = req.timestamp;
        msg.meta.recver = req.sender;
        if !res.keys.is_empty() {
            msg.attach(res.keys, res.vals, res.lens);
        }
        self.van.send(msg)
    }

    /// Decode an inbound message into `(KvMeta, KvPairs)`.
    ///
    /// A request either carries no data (control) or at least keys and
    /// values; lengths are optional but must line up with the keys.
    fn decode(msg: &Message) -> anyhow::Result<(KvMeta, KvPairs)> {
        let meta = KvMeta {
            cmd: msg.meta.cmd,
            push: msg.meta.push,
            pull: msg.meta.pull,
            sender: msg.meta.sender,
            timestamp: msg.meta.timestamp,
            customer_id: msg.meta.customer_id,
        };
        let mut data = KvPairs::default();
        if !msg.keys.is_empty() || !msg.vals.is_empty() || !msg.lens.is_empty() {
            anyhow::ensure!(
                !msg.keys.is_empty(),
                "request data carries values without keys"
            );
            data.keys = msg.keys.clone();
            data.vals = msg.vals.clone();
            if !msg.lens.is_empty() {
                anyhow::ensure!(
                    msg.lens.len() == msg.keys.len(),
                    "lens size {} does not match keys size {}",
                    msg.lens.len(),
                    msg.keys.len()
                );
                data.lens = msg.lens.clone();
            }
        }
        Ok((meta, data))
    }
}

impl MessageHandler for KvServer {
    fn process(&self, msg: Message) {
        if !msg.meta.request {
            // Servers only issue responses, never requests, so there is
            // nothing to count here.
            debug!(sender = msg.meta.sender, "ignoring non-request message");
            return;
        }
        let (meta, data) = match Self::decode(&msg) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(error = %err, sender = msg.meta.sender, "malformed kv request");
                panic!("malformed kv request: {err:#}");
            }
        };
        debug!(
            sender = meta.sender,
            timestamp = meta.timestamp,
            push = meta.push,
            pull = meta.pull,
            keys = data.keys.len(),
            "kv request"
        );
        let handle = self.handle.read().unwrap().clone();
        match handle {
            Some(handle) => handle.handle(&meta, &data, self),
            None => {
                error!("kv request arrived before a request handle was set");
                panic!("request handle not set");
            }
        }
    }
}

/// Reference handle: accumulate pushed `f32` values per key, answer pulls
/// from the accumulated state.
///
/// Assumes whole-value messages (a reassembling transport, or block
/// fragmentation left off). Fragments whose payload does not line up with
/// the key list are acknowledged but not stored.
#[derive(Default)]
pub struct DefaultStoreHandle {
    store: Mutex<HashMap<Key, Vec<f32>>>,
}

impl DefaultStoreHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a key's accumulated value (test and inspection hook).
    pub fn get(&self, key: Key) -> Option<Vec<f32>> {
        self.store.lock().unwrap().get(&key).cloned()
    }

    fn segments(data: &KvPairs) -> Option<Vec<(Key, std::ops::Range<usize>)>> {
        let vals = f32_vec(&data.vals);
        let mut out = Vec::with_capacity(data.keys.len());
        if data.lens.is_empty() {
            if data.keys.is_empty() || vals.len() % data.keys.len() != 0 {
                return None;
            }
            let k = vals.len() / data.keys.len();
            for (i, &key) in data.keys.iter().enumerate() {
                out.push((key, i * k..(i + 1) * k));
            }
        } else {
            let mut offset = 0usize;
            for (&key, &len) in data.keys.iter().zip(&data.lens) {
                out.push((key, offset..offset + len as usize));
                offset += len as usize;
            }
            if offset != vals.len() {
                return None;
            }
        }
        Some(out)
    }
}

impl ReqHandle for DefaultStoreHandle {
    fn handle(&self, meta: &KvMeta, data: &KvPairs, server: &KvServer) {
        let mut res = KvPairs::default();
        let segments = Self::segments(data);

        if meta.push {
            match &segments {
                Some(segments) => {
                    let vals = f32_vec(&data.vals);
                    let mut store = self.store.lock().unwrap();
                    for (key, span) in segments {
                        let slot = store.entry(*key).or_insert_with(|| vec![0.0; span.len()]);
                        for (acc, v) in slot.iter_mut().zip(&vals[span.clone()]) {
                            *acc += *v;
                        }
                    }
                }
                None => debug!(
                    keys = data.keys.len(),
                    vals = data.vals.len(),
                    "partial push payload, acknowledged without storing"
                ),
            }
        }
        if meta.pull {
            let store = self.store.lock().unwrap();
            let mut vals = Vec::new();
            let mut lens = Vec::with_capacity(data.keys.len());
            for &key in &data.keys {
                let stored = store.get(&key).cloned().unwrap_or_default();
                lens.push(stored.len() as u32);
                vals.extend_from_slice(&stored);
            }
            res.keys = data.keys.clone();
            res.vals = f32_bytes(&vals);
            res.lens = lens;
        }

        if let Err(err) = server.response(meta, res) {
            error!(error = %err, sender = meta.sender, "kv response failed");
        }
    }
}
