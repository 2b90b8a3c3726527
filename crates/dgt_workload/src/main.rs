//! Workload generator for the DGT parameter-server pipeline.
//!
//! This binary stands up an in-process worker plus server group, then runs
//! push/pull training rounds with synthetic gradients while emulating a
//! trainer that publishes a decaying loss. It is the quickest way to watch
//! the reliability fraction descend and the fragment ranking at work
//! (`RUST_LOG=debug` + `--dgt-info`).

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

use dgt_core::types::{f32_bytes, Key};
use dgt_ps::{
    ChannelConfig, DefaultStoreHandle, DgtConfig, KvServer, KvWorker, MemHub, MessageHandler,
    PullBuffer, ReqHandle, ServerMap, WorkerOptions,
};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "dgt-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of in-process servers.
    #[arg(long, default_value_t = 2)]
    servers: usize,

    /// Number of parameter keys (key 0 marks each round).
    #[arg(long, default_value_t = 16)]
    keys: usize,

    /// Value elements per key.
    #[arg(long, default_value_t = 256)]
    value_elems: usize,

    /// Training rounds to run.
    #[arg(long, default_value_t = 20)]
    rounds: usize,

    /// Fragment block size in bytes (0 disables blocking).
    #[arg(long, default_value_t = 1024)]
    block_size: usize,

    /// Lossy channel count.
    #[arg(long, default_value_t = 3)]
    udp_channels: u32,

    /// Initial reliability fraction.
    #[arg(long, default_value_t = 0.5)]
    k_init: f32,

    /// Reliability floor.
    #[arg(long, default_value_t = 0.1)]
    k_min: f32,

    /// Drive k from the emulated loss.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    adaptive: bool,

    /// Route fragments through the channel classifier.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    dgt: bool,

    /// Raise pipeline diagnostics to info level.
    #[arg(long, default_value_t = false)]
    dgt_info: bool,

    /// RNG seed for synthetic gradients.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Loss file location (defaults to a fresh temp path).
    #[arg(long)]
    loss_file: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RoundStats {
    round: usize,
    loss: f32,
    k: f32,
    push_ms: f64,
    pull_ms: f64,
}

#[derive(Debug, Serialize)]
struct Summary {
    rounds: usize,
    keys: usize,
    payload_bytes: usize,
    callbacks_fired: usize,
    final_k: f32,
    total_ms: f64,
}

/// Parse CLI args, initialize logging, and run the requested subcommand.
fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args),
    }
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.servers > 0, "need at least one server");
    anyhow::ensure!(args.keys > 0, "need at least one key");

    let hub = MemHub::new();
    let mut server_nodes = Vec::with_capacity(args.servers);
    let mut servers = Vec::with_capacity(args.servers);
    for i in 0..args.servers {
        let node = 8 + i as u64;
        let server = Arc::new(KvServer::new(0, Arc::new(hub.van_for(node))));
        server.set_request_handle(Arc::new(DefaultStoreHandle::new()) as Arc<dyn ReqHandle>);
        hub.register(node, Arc::clone(&server) as Arc<dyn MessageHandler>)?;
        // The hub only holds weak handler references; keep the servers alive
        // for the length of the run.
        servers.push(server);
        server_nodes.push(node);
    }

    let loss_file = match &args.loss_file {
        Some(path) => path.clone(),
        None => std::env::temp_dir().join(format!("dgt-workload-loss-{}.csv", std::process::id())),
    };
    let worker = KvWorker::with_options(
        0,
        0,
        Arc::new(hub.van_for(1)),
        ServerMap::even(1, &server_nodes)?,
        WorkerOptions {
            loss_path: Some(loss_file.clone()),
            dgt: Some(DgtConfig {
                enable_block: args.block_size > 0,
                block_size: args.block_size,
                enable_dgt: args.dgt,
                dgt_info: args.dgt_info,
                ..DgtConfig::default()
            }),
            channels: Some(ChannelConfig {
                k_init: args.k_init,
                k_min: args.k_min,
                adaptive_k: args.adaptive,
                udp_channels: args.udp_channels,
            }),
            seed: Some(args.seed),
            ..WorkerOptions::default()
        },
    );
    hub.register(1, Arc::clone(&worker) as Arc<dyn MessageHandler>)?;

    // Spread keys across the keyspace so every server owns a share; key 0
    // stays first to mark the rounds.
    let stride = u64::MAX / args.keys as u64;
    let keys: Vec<Key> = (0..args.keys as u64).map(|i| i * stride).collect();
    let payload_bytes = args.keys * args.value_elems * 4;
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let callbacks = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    info!(
        servers = args.servers,
        keys = args.keys,
        payload_bytes,
        rounds = args.rounds,
        "workload starting"
    );

    for round in 0..args.rounds {
        // Emulate the trainer: loss decays geometrically with noise.
        let loss = 8.0 * 0.8f32.powi(round as i32) * rng.gen_range(0.9..1.1);
        std::fs::write(&loss_file, format!("{loss}\n"))
            .with_context(|| format!("write loss file {}", loss_file.display()))?;

        let grads: Vec<f32> = (0..args.keys * args.value_elems)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();

        let push_started = Instant::now();
        let cb: dgt_ps::Callback = {
            let callbacks = Arc::clone(&callbacks);
            Box::new(move || {
                callbacks.fetch_add(1, Ordering::Relaxed);
            })
        };
        let ts = worker.push(&keys, &f32_bytes(&grads), &[], 0, Some(cb), 0)?;
        worker.wait(ts);
        let push_ms = push_started.elapsed().as_secs_f64() * 1e3;

        let pull_started = Instant::now();
        let dst = PullBuffer::new();
        let ts = worker.pull(&keys, &dst, 0, None, 0)?;
        worker.wait(ts);
        let pull_ms = pull_started.elapsed().as_secs_f64() * 1e3;
        anyhow::ensure!(
            dst.vals().len() == payload_bytes,
            "pulled {} bytes, expected {payload_bytes}",
            dst.vals().len()
        );

        let stats = worker.debug_stats();
        let line = RoundStats {
            round,
            loss,
            k: stats.k,
            push_ms,
            pull_ms,
        };
        info!(
            round = line.round,
            loss = line.loss,
            k = line.k,
            push_ms = line.push_ms,
            pull_ms = line.pull_ms,
            "round finished"
        );
    }

    let summary = Summary {
        rounds: args.rounds,
        keys: args.keys,
        payload_bytes,
        callbacks_fired: callbacks.load(Ordering::Relaxed),
        final_k: worker.debug_stats().k,
        total_ms: started.elapsed().as_secs_f64() * 1e3,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    let _ = std::fs::remove_file(&loss_file);
    Ok(())
}
