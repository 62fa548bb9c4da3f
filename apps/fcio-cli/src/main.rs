use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fcio_buffers::Generation;
use fcio_core::{
    AdapterSnapshot, Cdb, CompletionSink, DataDirection, DispatchErrorKind, Engine, EngineConfig,
    IoTicket, MemoryRegion, ScsiRequest, TargetParams,
};
use fcio_proto::PortId;
use fcio_sim::{SimConfig, SimRing, SimSnapshot};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

const PORT_BASE: u32 = 0x01_0000;
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Parser)]
#[command(name = "fcio", version)]
#[command(about = "Run a SCSI workload through the exchange engine on a simulated adapter", long_about = None)]
struct Args {
    /// Engine configuration (JSON). Defaults apply when unset.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Simulator configuration (JSON).
    #[arg(long, value_name = "PATH")]
    sim_config: Option<PathBuf>,
    /// Override the adapter generation from the config file.
    #[arg(long, value_enum)]
    generation: Option<GenerationArg>,
    /// Remote ports to log in.
    #[arg(long, default_value_t = 2)]
    targets: u32,
    /// LUNs per remote port.
    #[arg(long, default_value_t = 2)]
    luns: u64,
    /// Requests issued per LUN.
    #[arg(long, default_value_t = 10_000)]
    requests: u64,
    /// Transfer size per request in bytes.
    #[arg(long, default_value_t = 4096)]
    io_size: u32,
    /// Issue a LUN reset after this many completions on a LUN (0 disables).
    #[arg(long, default_value_t = 0)]
    reset_every: u64,
    /// Override the simulator's queue-full rate.
    #[arg(long)]
    queue_full_rate: Option<f64>,
    /// Override the simulator's dropped-exchange rate.
    #[arg(long)]
    dropped_rate: Option<f64>,
    /// Override the simulator's exchange-busy rate.
    #[arg(long)]
    exchange_busy_rate: Option<f64>,
    /// Per-request timeout in milliseconds before the watchdog aborts it.
    #[arg(long, default_value_t = 2_000)]
    timeout_ms: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GenerationArg {
    Legacy,
    Modern,
}

impl From<GenerationArg> for Generation {
    fn from(value: GenerationArg) -> Self {
        match value {
            GenerationArg::Legacy => Self::Legacy,
            GenerationArg::Modern => Self::Modern,
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct Tally {
    completed: u64,
    failed: u64,
    rejected: u64,
    resets: u64,
    by_host_status: BTreeMap<&'static str, u64>,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.rejected += other.rejected;
        self.resets += other.resets;
        for (status, count) in other.by_host_status {
            *self.by_host_status.entry(status).or_default() += count;
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    elapsed_ms: u128,
    workload: Tally,
    engine: AdapterSnapshot,
    sim: SimSnapshot,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut config = match args.config.as_ref() {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(generation) = args.generation {
        config.generation = generation.into();
    }
    let mut sim_config = match args.sim_config.as_ref() {
        Some(path) => {
            let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_slice::<SimConfig>(&data)
                .with_context(|| format!("decode {}", path.display()))?
        }
        None => SimConfig::default(),
    };
    if let Some(rate) = args.queue_full_rate {
        sim_config.faults.queue_full = rate;
    }
    if let Some(rate) = args.dropped_rate {
        sim_config.faults.dropped = rate;
    }
    if let Some(rate) = args.exchange_busy_rate {
        sim_config.faults.exchange_busy = rate;
    }

    let ring = Arc::new(SimRing::new(sim_config).context("init simulated ring")?);
    let engine = Arc::new(Engine::new(config, ring.clone()).context("init exchange engine")?);
    let sink: Weak<dyn CompletionSink> = Arc::<Engine>::downgrade(&engine);
    ring.attach(sink);
    let sim_workers = ring.start().context("start simulated ring")?;
    let deferred = engine.start_worker().context("start deferred worker")?;

    let mut luns = Vec::new();
    for index in 0..args.targets {
        let port = PortId::new(PORT_BASE + index).context("port id")?;
        engine.add_target(
            port,
            TargetParams {
                context: u16::try_from(index).unwrap_or(u16::MAX),
                ..TargetParams::default()
            },
        );
        for lun in 0..args.luns {
            let added = engine
                .add_lun(port, lun)
                .with_context(|| format!("add lun {port}:{lun}"))?;
            debug!(target = %port, lun, added, "lun provisioned");
            luns.push((port, lun));
        }
    }
    info!(
        targets = args.targets,
        luns = luns.len(),
        requests = args.requests,
        generation = %engine.config().generation,
        "starting workload"
    );

    let watchdog = tokio::spawn(watchdog(engine.clone()));
    let started = Instant::now();
    let mut workloads = JoinSet::new();
    for (port, lun) in luns {
        workloads.spawn(lun_workload(
            engine.clone(),
            port,
            lun,
            args.requests,
            args.io_size,
            args.reset_every,
            Duration::from_millis(args.timeout_ms),
        ));
    }

    let mut tally = Tally::default();
    loop {
        tokio::select! {
            joined = workloads.join_next() => {
                match joined {
                    Some(Ok(result)) => tally.merge(result),
                    Some(Err(err)) => warn!(error = %err, "workload task failed"),
                    None => break,
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutdown requested");
                workloads.abort_all();
                break;
            }
        }
    }
    watchdog.abort();

    let elapsed = started.elapsed();
    deferred.shutdown();
    engine.drain_deferred();
    let report = Report {
        elapsed_ms: elapsed.as_millis(),
        workload: tally,
        engine: engine.snapshot(),
        sim: ring.snapshot(),
    };
    drop(sim_workers);
    let stranded = engine.teardown();
    if stranded > 0 {
        warn!(stranded, "exchanges still outstanding at teardown");
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("encode report")?
    );
    Ok(())
}

/// Drive one LUN: keep as many requests in flight as the engine accepts,
/// resetting the LUN periodically when asked.
async fn lun_workload(
    engine: Arc<Engine>,
    port: PortId,
    lun: u64,
    requests: u64,
    io_size: u32,
    reset_every: u64,
    timeout: Duration,
) -> Tally {
    let mut tally = Tally::default();
    let mut in_flight: VecDeque<IoTicket> = VecDeque::new();
    let mut issued = 0u64;
    let mut since_reset = 0u64;

    while issued < requests || !in_flight.is_empty() {
        while issued < requests {
            let mut request = match request_for(port, lun, issued, io_size) {
                Ok(request) => request,
                Err(err) => {
                    warn!(target = %port, lun, error = %err, "cannot build request");
                    return tally;
                }
            };
            request.timeout = timeout;
            match engine.dispatch(request) {
                Ok(ticket) => {
                    issued += 1;
                    in_flight.push_back(ticket);
                }
                Err(err) if err.kind() == DispatchErrorKind::NotReady => {
                    warn!(target = %port, lun, "target not ready; stopping");
                    issued = requests;
                }
                Err(_) => {
                    tally.rejected += 1;
                    break;
                }
            }
        }

        let Some(ticket) = in_flight.pop_front() else {
            tokio::time::sleep(RETRY_DELAY).await;
            continue;
        };
        match ticket.completion.await {
            Ok(completion) => {
                tally.completed += 1;
                if !completion.is_success() {
                    tally.failed += 1;
                }
                *tally
                    .by_host_status
                    .entry(completion.host_status.as_str())
                    .or_default() += 1;
            }
            Err(_) => tally.failed += 1,
        }

        since_reset += 1;
        if reset_every > 0 && since_reset >= reset_every {
            since_reset = 0;
            tally.resets += 1;
            let engine = engine.clone();
            let reset = tokio::task::spawn_blocking(move || engine.reset_lun(port, lun)).await;
            match reset {
                Ok(Ok(())) => debug!(target = %port, lun, "lun reset"),
                Ok(Err(err)) => warn!(target = %port, lun, error = %err, "lun reset failed"),
                Err(err) => warn!(target = %port, lun, error = %err, "lun reset task failed"),
            }
        }
    }
    tally
}

fn request_for(port: PortId, lun: u64, seq: u64, io_size: u32) -> Result<ScsiRequest> {
    let blocks = u16::try_from(io_size / 512).unwrap_or(u16::MAX).max(1);
    let lba = (seq as u32).to_be_bytes();
    let len = blocks.to_be_bytes();
    let write = seq % 4 == 3;
    let opcode = if write { 0x2a } else { 0x28 };
    let cdb = Cdb::new(&[opcode, 0, lba[0], lba[1], lba[2], lba[3], 0, len[0], len[1], 0])
        .context("build cdb")?;
    let direction = if write {
        DataDirection::ToDevice
    } else {
        DataDirection::FromDevice
    };
    let addr = 0x1000_0000 + (seq % 1024) * u64::from(io_size);
    ScsiRequest::with_data(
        port,
        lun,
        cdb,
        direction,
        vec![MemoryRegion::new(addr, io_size)],
    )
    .context("transfer length")
}

/// Abort requests that outlive their timeout.
async fn watchdog(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
    loop {
        interval.tick().await;
        for handle in engine.overdue(Instant::now()) {
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || match engine.abort(handle) {
                Ok(outcome) => debug!(id = %handle.id, ?outcome, "overdue request aborted"),
                Err(err) => warn!(id = %handle.id, error = %err, "abort failed"),
            });
        }
    }
}
