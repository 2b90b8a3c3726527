//! Shared helpers for dgt_ps integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use dgt_core::types::Message;
use dgt_ps::{
    ChannelConfig, DefaultStoreHandle, DgtConfig, KvServer, KvWorker, MemHub, MessageHandler,
    ReqHandle, ServerMap, Van, WorkerOptions,
};

/// Node id used for the worker in test clusters.
pub const WORKER_NODE: u64 = 1;
/// First server node id; servers are numbered consecutively from here.
pub const SERVER_NODE_BASE: u64 = 8;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// An in-process worker plus server group wired over a [`MemHub`].
pub struct TestCluster {
    pub hub: Arc<MemHub>,
    pub worker: Arc<KvWorker>,
    pub stores: Vec<Arc<DefaultStoreHandle>>,
    pub servers: Vec<Arc<KvServer>>,
    pub tmp: TempDir,
}

/// Channel knobs used unless a test overrides them.
pub fn default_channels() -> ChannelConfig {
    ChannelConfig {
        k_init: 0.5,
        k_min: 0.1,
        adaptive_k: false,
        udp_channels: 3,
    }
}

/// Spin up `num_servers` stores plus one worker with injected configuration
/// (tests never touch process environment).
pub fn cluster(num_servers: usize, dgt: DgtConfig, channels: ChannelConfig) -> TestCluster {
    init_tracing();
    let hub = MemHub::new();
    let tmp = tempfile::tempdir().expect("tempdir");

    let mut stores = Vec::with_capacity(num_servers);
    let mut servers = Vec::with_capacity(num_servers);
    let mut server_nodes = Vec::with_capacity(num_servers);
    for i in 0..num_servers {
        let node = SERVER_NODE_BASE + i as u64;
        let server = Arc::new(KvServer::new(0, Arc::new(hub.van_for(node))));
        let store = Arc::new(DefaultStoreHandle::new());
        server.set_request_handle(Arc::clone(&store) as Arc<dyn ReqHandle>);
        hub.register(node, Arc::clone(&server) as Arc<dyn MessageHandler>)
            .expect("register server");
        stores.push(store);
        servers.push(server);
        server_nodes.push(node);
    }

    let map = ServerMap::even(WORKER_NODE, &server_nodes).expect("server map");
    let worker = KvWorker::with_options(
        0,
        0,
        Arc::new(hub.van_for(WORKER_NODE)),
        map,
        WorkerOptions {
            loss_path: Some(tmp.path().join("loss.csv")),
            dgt: Some(dgt),
            channels: Some(channels),
            seed: Some(7),
            ..WorkerOptions::default()
        },
    );
    hub.register(WORKER_NODE, Arc::clone(&worker) as Arc<dyn MessageHandler>)
        .expect("register worker");

    TestCluster {
        hub,
        worker,
        stores,
        servers,
        tmp,
    }
}

/// A [`Van`] that records every outgoing message instead of delivering it.
/// Used for send-pipeline tests that assert on fragment streams.
#[derive(Default)]
pub struct CaptureVan {
    sent: Mutex<Vec<SentMessage>>,
}

pub struct SentMessage {
    pub msg: Message,
    pub classified: bool,
}

impl CaptureVan {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain everything captured so far.
    pub fn take(&self) -> Vec<SentMessage> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl Van for CaptureVan {
    fn send(&self, msg: Message) -> anyhow::Result<usize> {
        let size = msg.payload_bytes();
        self.sent.lock().unwrap().push(SentMessage {
            msg,
            classified: false,
        });
        Ok(size)
    }

    fn send_on(&self, msg: Message, _channel: u32, _flags: u32) -> anyhow::Result<usize> {
        self.send(msg)
    }

    fn classify(&self, msg: Message, _channel: u32, _flags: u32) -> anyhow::Result<usize> {
        let size = msg.payload_bytes();
        self.sent.lock().unwrap().push(SentMessage {
            msg,
            classified: true,
        });
        Ok(size)
    }
}

/// Worker wired to a [`CaptureVan`] over a single full-range server.
pub fn capture_worker(
    dgt: DgtConfig,
    channels: ChannelConfig,
) -> (Arc<KvWorker>, Arc<CaptureVan>, TempDir) {
    init_tracing();
    let van = CaptureVan::new();
    let tmp = tempfile::tempdir().expect("tempdir");
    let map = ServerMap::even(WORKER_NODE, &[SERVER_NODE_BASE]).expect("server map");
    let worker = KvWorker::with_options(
        0,
        0,
        Arc::clone(&van) as Arc<dyn Van>,
        map,
        WorkerOptions {
            loss_path: Some(tmp.path().join("loss.csv")),
            dgt: Some(dgt),
            channels: Some(channels),
            seed: Some(7),
            ..WorkerOptions::default()
        },
    );
    (worker, van, tmp)
}
