//! Worker half of the push/pull protocol.
//!
//! A [`KvWorker`] slices every outgoing KV list over the server key
//! partition, then either ships each slice whole (round-opening pushes and
//! pulls) or runs it through the differential-transmission pipeline:
//! fragment by block, score each fragment's contribution, rank, and spread
//! the ranked fragments across the transport's priority channels. Inbound
//! responses are counted per timestamp; pull responses accumulate until the
//! last one triggers assembly into the caller's buffer.
//!
//! All mutable worker state (callbacks, receive accumulator, contribution
//! counters, round counter, RNG) sits behind one mutex. Completion callbacks
//! always run outside it, on the delivery thread.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use dgt_core::adaptive::{AdaptiveK, LossFile};
use dgt_core::channel::{assign_channel, order_fragments, OrderMode};
use dgt_core::contribution::{block_mse_f32, ContributionTracker};
use dgt_core::fragment::{first_push_message, plan_push_fragments, pull_message};
use dgt_core::range::find_range;
use dgt_core::slicer::{DefaultSlicer, Slicer};
use dgt_core::types::{f32_vec, Key, KvPairs, Message, RequestMeta, Timestamp};

use crate::cluster::ServerMap;
use crate::config::{ChannelConfig, DgtConfig};
use crate::customer::Customer;
use crate::van::{MessageHandler, Van};

/// Completion callback for a push or pull, run on the delivery thread.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Destination for pulled values, shared between the caller and the
/// delivery thread.
///
/// Contents are valid once `wait(ts)` returns or the request callback has
/// run. A non-empty value buffer pins the expected payload size; assembly
/// fails if the pulled bytes do not match.
pub struct PullBuffer {
    vals: Mutex<Vec<u8>>,
    lens: Option<Mutex<Vec<u32>>>,
}

impl PullBuffer {
    /// Buffer receiving values only.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            vals: Mutex::new(Vec::new()),
            lens: None,
        })
    }

    /// Buffer receiving values plus per-key lengths.
    pub fn with_lens() -> Arc<Self> {
        Arc::new(Self {
            vals: Mutex::new(Vec::new()),
            lens: Some(Mutex::new(Vec::new())),
        })
    }

    fn wants_lens(&self) -> bool {
        self.lens.is_some()
    }

    /// Pre-size the value buffer, pinning the expected payload size.
    pub fn presize(&self, bytes: usize) {
        self.vals.lock().unwrap().resize(bytes, 0);
    }

    /// Copy of the assembled value bytes.
    pub fn vals(&self) -> Vec<u8> {
        self.vals.lock().unwrap().clone()
    }

    /// Assembled values decoded as little-endian `f32`.
    pub fn vals_f32(&self) -> Vec<f32> {
        f32_vec(&self.vals.lock().unwrap())
    }

    /// Copy of the assembled per-key lengths, when requested.
    pub fn lens(&self) -> Option<Vec<u32>> {
        self.lens.as_ref().map(|l| l.lock().unwrap().clone())
    }
}

/// Construction-time knobs that tests and embedders override; everything
/// defaults to the environment-driven production path.
pub struct WorkerOptions {
    /// Byte width of one value element.
    pub val_width: usize,
    /// Loss side-channel location; defaults to `/tmp/loss<node>.csv`.
    pub loss_path: Option<PathBuf>,
    /// Pipeline knobs; defaults to [`DgtConfig::from_env`].
    pub dgt: Option<DgtConfig>,
    /// Channel knobs; defaults to [`ChannelConfig::from_env`] at first push.
    pub channels: Option<ChannelConfig>,
    /// RNG seed; defaults to entropy.
    pub seed: Option<u64>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            val_width: 4,
            loss_path: None,
            dgt: None,
            channels: None,
            seed: None,
        }
    }
}

/// Snapshot of round and controller internals for debugging and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerDebugStats {
    pub push_op_num: u64,
    /// Current reliability fraction (0.0 until the first round opens).
    pub k: f32,
    pub k_init: f32,
    pub k_min: f32,
    pub first_loss: f32,
    pub rt_loss: f32,
    pub delta_loss: f32,
    pub udp_channels: u32,
}

/// Channel machinery brought up lazily by the first push.
struct DgtLink {
    adaptive: AdaptiveK,
    loss: LossFile,
    udp_channels: u32,
}

struct WorkerState {
    callbacks: HashMap<Timestamp, Callback>,
    recv_kvs: HashMap<Timestamp, Vec<KvPairs>>,
    contri: ContributionTracker,
    push_op_num: u64,
    link: Option<DgtLink>,
    rng: SmallRng,
}

/// A worker node that pushes and pulls key-value lists to the server group.
pub struct KvWorker {
    customer: Customer,
    van: Arc<dyn Van>,
    servers: ServerMap,
    cfg: DgtConfig,
    val_width: usize,
    loss_path: PathBuf,
    channel_cfg: Option<ChannelConfig>,
    slicer: RwLock<Arc<dyn Slicer>>,
    state: Arc<Mutex<WorkerState>>,
}

impl KvWorker {
    pub fn new(
        app_id: i32,
        customer_id: i32,
        van: Arc<dyn Van>,
        servers: ServerMap,
    ) -> Arc<Self> {
        Self::with_options(app_id, customer_id, van, servers, WorkerOptions::default())
    }

    pub fn with_options(
        app_id: i32,
        customer_id: i32,
        van: Arc<dyn Van>,
        servers: ServerMap,
        opts: WorkerOptions,
    ) -> Arc<Self> {
        let cfg = opts.dgt.unwrap_or_else(DgtConfig::from_env);
        let loss_path = opts
            .loss_path
            .unwrap_or_else(|| PathBuf::from(format!("/tmp/loss{}.csv", servers.my_node())));
        let rng = match opts.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Arc::new(Self {
            customer: Customer::new(app_id, customer_id),
            van,
            servers,
            cfg,
            val_width: opts.val_width.max(1),
            loss_path,
            channel_cfg: opts.channels,
            slicer: RwLock::new(Arc::new(DefaultSlicer)),
            state: Arc::new(Mutex::new(WorkerState {
                callbacks: HashMap::new(),
                recv_kvs: HashMap::new(),
                contri: ContributionTracker::new(cfg.contri_alpha),
                push_op_num: 0,
                link: None,
                rng,
            })),
        })
    }

    /// Swap in a user-defined slicer.
    pub fn set_slicer(&self, slicer: Arc<dyn Slicer>) {
        *self.slicer.write().unwrap() = slicer;
    }

    /// Push a list of key-value pairs to the server group. Non-blocking;
    /// completion is observable via [`wait`](Self::wait) or `cb`.
    pub fn push(
        &self,
        keys: &[Key],
        vals: &[u8],
        lens: &[u32],
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> anyhow::Result<Timestamp> {
        self.zpush(
            KvPairs {
                keys: keys.to_vec(),
                vals: Bytes::copy_from_slice(vals),
                lens: lens.to_vec(),
                priority,
            },
            cmd,
            cb,
        )
    }

    /// Zero-copy push: the payload is observed, never copied or mutated,
    /// until the request completes.
    pub fn zpush(
        &self,
        kvs: KvPairs,
        cmd: i32,
        cb: Option<Callback>,
    ) -> anyhow::Result<Timestamp> {
        kvs.validate(self.val_width)?;
        let ts = self
            .customer
            .new_request(self.servers.num_servers(), Some(kvs.keys.len()));
        if let Some(cb) = cb {
            self.state.lock().unwrap().callbacks.insert(ts, cb);
        }
        self.send_sliced(ts, true, false, cmd, &kvs)?;
        Ok(ts)
    }

    /// Pull the values for `keys` into `dst`. Non-blocking.
    pub fn pull(
        &self,
        keys: &[Key],
        dst: &Arc<PullBuffer>,
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> anyhow::Result<Timestamp> {
        self.zpull(keys.to_vec(), Arc::clone(dst), cmd, cb, priority)
    }

    /// Zero-copy pull.
    pub fn zpull(
        &self,
        keys: Vec<Key>,
        dst: Arc<PullBuffer>,
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> anyhow::Result<Timestamp> {
        let kvs = KvPairs {
            keys: keys.clone(),
            vals: Bytes::new(),
            lens: vec![],
            priority,
        };
        kvs.validate(self.val_width)?;
        let ts = self.add_pull_cb(keys, dst, cb);
        self.send_sliced(ts, false, true, cmd, &kvs)?;
        Ok(ts)
    }

    /// Push `vals` and pull the updated values back into `dst`.
    pub fn push_pull(
        &self,
        keys: &[Key],
        vals: &[u8],
        lens: &[u32],
        dst: &Arc<PullBuffer>,
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> anyhow::Result<Timestamp> {
        self.zpush_pull(
            KvPairs {
                keys: keys.to_vec(),
                vals: Bytes::copy_from_slice(vals),
                lens: lens.to_vec(),
                priority,
            },
            Arc::clone(dst),
            cmd,
            cb,
        )
    }

    /// Zero-copy push-pull.
    pub fn zpush_pull(
        &self,
        kvs: KvPairs,
        dst: Arc<PullBuffer>,
        cmd: i32,
        cb: Option<Callback>,
    ) -> anyhow::Result<Timestamp> {
        kvs.validate(self.val_width)?;
        {
            let out = dst.vals.lock().unwrap();
            anyhow::ensure!(
                out.is_empty() || out.len() == kvs.vals.len(),
                "output buffer holds {} bytes but the pushed payload has {}",
                out.len(),
                kvs.vals.len()
            );
        }
        let ts = self.add_pull_cb(kvs.keys.clone(), dst, cb);
        self.send_sliced(ts, true, true, cmd, &kvs)?;
        Ok(ts)
    }

    /// Block until the push or pull behind `ts` has finished.
    pub fn wait(&self, ts: Timestamp) {
        self.customer.wait(ts);
    }

    /// Register the assembly callback for a pull-style request.
    fn add_pull_cb(
        &self,
        keys: Vec<Key>,
        dst: Arc<PullBuffer>,
        cb: Option<Callback>,
    ) -> Timestamp {
        let ts = self
            .customer
            .new_request(self.servers.num_servers(), Some(keys.len()));
        let state = Arc::clone(&self.state);
        let assemble: Callback = Box::new(move || {
            let pending = state
                .lock()
                .unwrap()
                .recv_kvs
                .remove(&ts)
                .unwrap_or_default();
            if let Err(err) = assemble_pull(&keys, pending, &dst) {
                error!(timestamp = ts, error = %err, "pull assembly failed");
                panic!("pull assembly failed for timestamp {ts}: {err:#}");
            }
            if let Some(cb) = cb {
                cb();
            }
        });
        self.state.lock().unwrap().callbacks.insert(ts, assemble);
        ts
    }

    /// Slice a request over the server partition and dispatch every
    /// non-empty slice. Empty slices are pre-credited so the response count
    /// still converges.
    fn send_sliced(
        &self,
        ts: Timestamp,
        push: bool,
        pull: bool,
        cmd: i32,
        kvs: &KvPairs,
    ) -> anyhow::Result<()> {
        let slicer = Arc::clone(&*self.slicer.read().unwrap());
        let sliced = slicer.slice(kvs, self.servers.key_ranges(), self.val_width)?;
        let skipped = sliced.iter().filter(|(enabled, _)| !enabled).count();
        if skipped > 0 {
            self.customer.add_response(ts, skipped);
        }
        if skipped == sliced.len() {
            self.run_callback(ts);
            return Ok(());
        }

        for (rank, (enabled, slice)) in sliced.into_iter().enumerate() {
            if !enabled {
                continue;
            }
            let recver = self.servers.node_of(rank);
            if push {
                self.send_push_slice(ts, pull, cmd, kvs.priority, recver, slice)?;
            } else {
                let base = self.base_meta(ts, push, pull, cmd, recver, kvs.priority, 0);
                self.van.send(pull_message(&slice, &base))?;
            }
        }
        Ok(())
    }

    /// Dispatch one per-server push slice.
    ///
    /// A slice whose first key is zero marks a new training round: the round
    /// counter advances and the loss file is re-read to refresh `k`. The
    /// opening round ships every slice whole; later rounds go through
    /// fragment/score/rank/assign.
    fn send_push_slice(
        &self,
        ts: Timestamp,
        pull: bool,
        cmd: i32,
        priority: i32,
        recver: u64,
        slice: KvPairs,
    ) -> anyhow::Result<()> {
        let mut st = self.state.lock().unwrap();
        if slice.keys.first() == Some(&0) {
            st.push_op_num += 1;
            let round = st.push_op_num;
            if round == 1 {
                st.link = Some(self.init_link()?);
            } else if let Some(link) = st.link.as_mut() {
                let cur_loss = link.loss.read_current();
                link.adaptive.observe(cur_loss);
                let k = link.adaptive.k();
                if self.cfg.dgt_info {
                    info!(
                        round,
                        loss = cur_loss,
                        delta = link.adaptive.delta(),
                        k,
                        "round update"
                    );
                } else {
                    debug!(round, loss = cur_loss, k, "round update");
                }
            }
        }

        let push_op_num = st.push_op_num;
        let link_params = st
            .link
            .as_ref()
            .map(|link| (link.udp_channels, link.adaptive.k()));
        let (udp_channels, k) = match link_params {
            Some(params) if push_op_num > 1 => params,
            _ => {
                // Round-opening push (or a worker that never marks rounds):
                // one whole-slice message on the reliable path.
                let base = self.base_meta(ts, true, pull, cmd, recver, priority, push_op_num);
                let msg = first_push_message(&slice, &base);
                drop(st);
                self.van.send(msg)?;
                return Ok(());
            }
        };

        let base = self.base_meta(ts, true, pull, cmd, recver, priority, push_op_num);
        let mut frags =
            plan_push_fragments(&slice, self.cfg.enable_block, self.cfg.block_size, &base);
        for frag in &mut frags {
            frag.contri =
                st.contri
                    .score(frag.meta.first_key, frag.meta.seq, frag.meta.seq_end, &frag.vals);
        }
        if self.cfg.dgt_info {
            debug!(
                key = slice.keys[0],
                fragments = frags.len(),
                mse = block_mse_f32(&slice.vals, self.cfg.block_size),
                "slice scored"
            );
        }
        if self.cfg.clear_zero {
            // Zero-score fragments are suppressed; the terminator always goes.
            frags.retain(|f| f.contri != 0.0 || f.meta.seq == f.meta.seq_end);
        }
        let mode = if self.cfg.set_random {
            OrderMode::Shuffled
        } else {
            OrderMode::Ranked
        };
        order_fragments(&mut frags, mode, &mut st.rng);

        let max_index = frags.len().saturating_sub(1);
        for (rank, frag) in frags.iter_mut().enumerate() {
            frag.meta.channel = assign_channel(rank, max_index, udp_channels, k, &mut st.rng);
            if frag.meta.seq == frag.meta.seq_end {
                frag.meta.channel = 0;
            }
        }
        drop(st);

        for frag in frags {
            let channel = frag.meta.channel;
            if self.cfg.enable_dgt {
                self.van.classify(frag, channel, 0)?;
            } else {
                self.van.send_on(frag, 0, 0)?;
            }
        }
        Ok(())
    }

    /// Bring up the channel machinery: loss file plus mandatory channel
    /// configuration.
    fn init_link(&self) -> anyhow::Result<DgtLink> {
        let cfg = match self.channel_cfg {
            Some(cfg) => cfg,
            None => ChannelConfig::from_env()?,
        };
        let loss = LossFile::open(&self.loss_path)?;
        info!(
            k_init = cfg.k_init,
            k_min = cfg.k_min,
            adaptive = cfg.adaptive_k,
            udp_channels = cfg.udp_channels,
            loss_file = %self.loss_path.display(),
            "channel machinery initialized"
        );
        Ok(DgtLink {
            adaptive: AdaptiveK::new(cfg.k_init, cfg.k_min, cfg.adaptive_k),
            loss,
            udp_channels: cfg.udp_channels,
        })
    }

    fn base_meta(
        &self,
        ts: Timestamp,
        push: bool,
        pull: bool,
        cmd: i32,
        recver: u64,
        priority: i32,
        push_op_num: u64,
    ) -> RequestMeta {
        RequestMeta {
            app_id: self.customer.app_id(),
            customer_id: self.customer.customer_id(),
            request: true,
            push,
            pull,
            cmd,
            timestamp: ts,
            sender: self.servers.my_node(),
            recver,
            priority,
            push_op_num,
            tracker_num: self.customer.tracker_num(ts),
            ..RequestMeta::default()
        }
    }

    /// Snapshot round/controller internals.
    pub fn debug_stats(&self) -> WorkerDebugStats {
        let st = self.state.lock().unwrap();
        let mut stats = WorkerDebugStats {
            push_op_num: st.push_op_num,
            ..WorkerDebugStats::default()
        };
        if let Some(link) = &st.link {
            stats.k = link.adaptive.k();
            stats.k_init = link.adaptive.k_init();
            stats.k_min = link.adaptive.k_min();
            stats.first_loss = link.adaptive.first_loss();
            stats.rt_loss = link.adaptive.rt_loss();
            stats.delta_loss = link.adaptive.delta();
            stats.udp_channels = link.udp_channels;
        }
        stats
    }

    /// Pop and run the completion callback for `ts`, outside the lock.
    fn run_callback(&self, ts: Timestamp) {
        let cb = self.state.lock().unwrap().callbacks.remove(&ts);
        if let Some(cb) = cb {
            cb();
        }
    }
}

impl MessageHandler for KvWorker {
    /// Count one inbound response and, for pulls, stash its KV payload.
    /// The response that completes the request triggers the callback.
    fn process(&self, msg: Message) {
        if msg.meta.request {
            debug!(sender = msg.meta.sender, "ignoring request addressed to a worker");
            return;
        }
        let ts = msg.meta.timestamp;
        if !self.customer.has_request(ts) {
            warn!(timestamp = ts, sender = msg.meta.sender, "response for unknown request");
            return;
        }
        if msg.meta.pull && !msg.keys.is_empty() {
            let kvs = KvPairs {
                keys: msg.keys,
                vals: msg.vals,
                lens: msg.lens,
                priority: 0,
            };
            self.state
                .lock()
                .unwrap()
                .recv_kvs
                .entry(ts)
                .or_default()
                .push(kvs);
        }
        let expected = if msg.meta.tracker_num > 0 {
            msg.meta.tracker_num
        } else {
            self.servers.num_servers()
        };
        if self.customer.add_response(ts, 1) == expected {
            self.run_callback(ts);
        }
    }
}

/// Assemble accumulated pull responses into the caller's buffer.
///
/// Each server's sub-list must cover a hole-free span of the requested
/// keys, and together they must cover every requested key; anything else is
/// a protocol error (a server's reply went missing or overlapped).
fn assemble_pull(
    keys: &[Key],
    mut pending: Vec<KvPairs>,
    dst: &PullBuffer,
) -> anyhow::Result<()> {
    let mut total_key = 0usize;
    let mut total_val = 0usize;
    for sub in &pending {
        let front = sub
            .keys
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("server returned an empty key list"))?;
        let back = sub.keys.last().copied().unwrap_or(front);
        let span = find_range(keys, front, back.saturating_add(1));
        anyhow::ensure!(
            span.len() == sub.keys.len(),
            "unmatched keys from one server: {} keys over a span of {}",
            sub.keys.len(),
            span.len()
        );
        if dst.wants_lens() {
            anyhow::ensure!(
                sub.lens.len() == sub.keys.len(),
                "response lens size {} does not match its keys size {}",
                sub.lens.len(),
                sub.keys.len()
            );
        }
        total_key += sub.keys.len();
        total_val += sub.vals.len();
    }
    anyhow::ensure!(
        total_key == keys.len(),
        "assembled {total_key} of {} requested keys; lost some servers?",
        keys.len()
    );

    pending.sort_by_key(|sub| sub.keys.first().copied().unwrap_or(0));

    {
        let mut vals = dst.vals.lock().unwrap();
        anyhow::ensure!(
            vals.is_empty() || vals.len() == total_val,
            "output buffer holds {} bytes but the pulled payload has {total_val}",
            vals.len()
        );
        vals.clear();
        vals.reserve(total_val);
        for sub in &pending {
            vals.extend_from_slice(&sub.vals);
        }
    }
    if let Some(lens) = &dst.lens {
        let mut lens = lens.lock().unwrap();
        lens.clear();
        for sub in &pending {
            lens.extend_from_slice(&sub.lens);
        }
    }
    Ok(())
}
