//! Transport boundary.
//!
//! The real heterogeneous transport (reliable TCP plus lossy UDP channels,
//! framing, ACK/resend) lives outside this crate. Workers and servers only
//! depend on the [`Van`] trait for sending and hand the transport a
//! [`MessageHandler`] capability for inbound delivery.
//!
//! [`MemHub`]/[`MemVan`] are the in-process implementation used by tests,
//! the workload driver, and single-machine runs: a registry of node queues
//! with one delivery thread per node, lossless, channels treated as hints.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::Context;
use tracing::{debug, warn};

use dgt_core::types::{Message, NodeId};

/// Inbound delivery capability registered with the transport.
pub trait MessageHandler: Send + Sync {
    fn process(&self, msg: Message);
}

/// Point-to-point and channel-classified sends.
///
/// All methods report the payload bytes handed to the transport.
pub trait Van: Send + Sync {
    /// Send on the default (reliable) path.
    fn send(&self, msg: Message) -> anyhow::Result<usize>;

    /// Send with an explicit channel and flag word.
    fn send_on(&self, msg: Message, channel: u32, flags: u32) -> anyhow::Result<usize>;

    /// Route-by-channel hint used by the differential-transmission path.
    fn classify(&self, msg: Message, channel: u32, flags: u32) -> anyhow::Result<usize>;
}

/// Process-local message hub: node id -> delivery queue.
pub struct MemHub {
    routes: Mutex<HashMap<NodeId, mpsc::Sender<Message>>>,
}

impl MemHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// Register a node and spawn its delivery thread.
    ///
    /// Messages enqueue from any sender and drain in order on the node's own
    /// thread, which is where worker callbacks and server handles run. The
    /// hub keeps only a weak reference to the handler, so dropping the
    /// worker/server stops its delivery; the thread also exits when the hub
    /// (and with it the queue sender) goes away.
    pub fn register(
        &self,
        node: NodeId,
        handler: Arc<dyn MessageHandler>,
    ) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel::<Message>();
        {
            let mut routes = self.routes.lock().unwrap();
            anyhow::ensure!(
                !routes.contains_key(&node),
                "node {node} registered twice"
            );
            routes.insert(node, tx);
        }
        let handler = Arc::downgrade(&handler);
        thread::Builder::new()
            .name(format!("dgt-recv-{node}"))
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match handler.upgrade() {
                        Some(handler) => handler.process(msg),
                        None => break,
                    }
                }
                debug!(node, "delivery thread stopped");
            })
            .context("spawn delivery thread")?;
        Ok(())
    }

    /// Drop a node's route; queued messages still drain.
    pub fn unregister(&self, node: NodeId) {
        self.routes.lock().unwrap().remove(&node);
    }

    /// Obtain the sending half for one node.
    pub fn van_for(self: &Arc<Self>, node: NodeId) -> MemVan {
        MemVan {
            hub: Arc::clone(self),
            node,
        }
    }

    fn route(&self, msg: Message) -> anyhow::Result<usize> {
        let size = msg.payload_bytes();
        let tx = self
            .routes
            .lock()
            .unwrap()
            .get(&msg.meta.recver)
            .cloned()
            .with_context(|| format!("no route to node {}", msg.meta.recver))?;
        tx.send(msg)
            .map_err(|_| anyhow::anyhow!("delivery queue closed"))?;
        Ok(size)
    }
}

/// Sending half of the in-process hub for one node.
#[derive(Clone)]
pub struct MemVan {
    hub: Arc<MemHub>,
    node: NodeId,
}

impl MemVan {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl Van for MemVan {
    fn send(&self, mut msg: Message) -> anyhow::Result<usize> {
        msg.meta.sender = self.node;
        self.hub.route(msg)
    }

    fn send_on(&self, msg: Message, _channel: u32, _flags: u32) -> anyhow::Result<usize> {
        self.send(msg)
    }

    fn classify(&self, msg: Message, channel: u32, _flags: u32) -> anyhow::Result<usize> {
        // Loopback delivery is lossless; the channel only shows up in logs.
        if channel > 0 {
            debug!(
                channel,
                seq = msg.meta.seq,
                first_key = msg.meta.first_key,
                "classified fragment onto lossy channel"
            );
        }
        self.send(msg)
    }
}

impl Drop for MemHub {
    fn drop(&mut self) {
        if let Ok(mut routes) = self.routes.lock() {
            if !routes.is_empty() {
                warn!(nodes = routes.len(), "hub dropped with registered nodes");
            }
            routes.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Sender;
    use std::time::Duration;

    use super::*;

    struct Probe(Mutex<Sender<Message>>);

    impl MessageHandler for Probe {
        fn process(&self, msg: Message) {
            let _ = self.0.lock().unwrap().send(msg);
        }
    }

    #[test]
    fn routes_between_registered_nodes() {
        let hub = MemHub::new();
        let (tx, rx) = mpsc::channel();
        let probe = Arc::new(Probe(Mutex::new(tx)));
        hub.register(2, Arc::clone(&probe) as Arc<dyn MessageHandler>)
            .unwrap();

        let van = hub.van_for(1);
        let mut msg = Message::default();
        msg.meta.recver = 2;
        msg.attach(vec![5], bytes::Bytes::from_static(&[0; 8]), vec![]);
        let sent = van.send(msg).unwrap();
        assert_eq!(sent, 16);

        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.meta.sender, 1);
        assert_eq!(got.keys, vec![5]);
    }

    #[test]
    fn unknown_recipient_is_an_error() {
        let hub = MemHub::new();
        let van = hub.van_for(1);
        let mut msg = Message::default();
        msg.meta.recver = 99;
        assert!(van.send(msg).is_err());
    }

    #[test]
    fn delivery_stops_once_the_handler_is_dropped() {
        let hub = MemHub::new();
        let (tx, rx) = mpsc::channel();
        let probe = Arc::new(Probe(Mutex::new(tx)));
        hub.register(4, Arc::clone(&probe) as Arc<dyn MessageHandler>)
            .unwrap();
        drop(probe);

        let van = hub.van_for(1);
        let mut msg = Message::default();
        msg.meta.recver = 4;
        // The queue still accepts the message, nothing processes it.
        van.send(msg).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let hub = MemHub::new();
        let (tx, _rx) = mpsc::channel();
        let probe: Arc<dyn MessageHandler> = Arc::new(Probe(Mutex::new(tx)));
        hub.register(3, Arc::clone(&probe)).unwrap();
        assert!(hub.register(3, probe).is_err());
    }
}
