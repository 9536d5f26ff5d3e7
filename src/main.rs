//! smtpair daemon entry point.
//!
//! Wires the subsystems together: the sched_switch feed drives attribution,
//! the watchdog ticks at 1 Hz, the control/ACK endpoints run on their own
//! threads, and the main thread is the single-threaded cooperative loop that
//! listens for profiling requests, loads profiles, acknowledges them, and
//! re-runs the scheduling cycle on every admission.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::channel::RecvTimeoutError;
use log::{info, warn};

use smtpair::attribution::AttributionTable;
use smtpair::endpoint::{self, NotifyEndpoint, NotifySender};
use smtpair::perf::PerfCounters;
use smtpair::profile::{self, InjectorBaselines, ProfileError};
use smtpair::resources::Catalog;
use smtpair::sched::{schedule_cycle, StpEvaluator};
use smtpair::score::{ScoreEngine, ScoreModel};
use smtpair::snapshot::SharedRegion;
use smtpair::store::{JsonStore, ProfileStore};
use smtpair::topology::Topology;
use smtpair::tracefs::SwitchFeed;
use smtpair::watchdog::{KillProbe, Watchdog};

/// smtpair: interference-aware SMT pair scheduler.
///
/// Attributes per-process-group IPC via hardware counters, scores workload
/// pairs with a trained interference model, and commits the empirically best
/// sibling-thread assignment through CPU affinity.
#[derive(Debug, Parser)]
#[command(name = "smtpair", version)]
struct Opts {
    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Long-running detection threshold in seconds.
    #[arg(long, default_value_t = 3600)]
    threshold_secs: u64,

    /// Settling interval for empirical candidate validation, in seconds.
    #[arg(long, default_value_t = 20)]
    settle_secs: u64,

    /// Directory holding the measurement and model documents.
    #[arg(long, default_value = "/var/lib/smtpair")]
    store: PathBuf,

    /// Explicit trained-model path (default: newest prediction_model_*.json
    /// in the store directory).
    #[arg(long)]
    model: Option<PathBuf>,

    /// Node name the measurement documents are keyed by.
    #[arg(long, default_value = "intel-gen11")]
    node: String,

    /// Directory for the control, notify and ACK sockets.
    #[arg(long, default_value = "/run/smtpair")]
    run_dir: PathBuf,

    #[command(subcommand)]
    command: Option<SubCmd>,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Print the normalized symbiotic scoreboard for every profiled job.
    Scoreboard,
}

fn init_log(verbose: u8) {
    let level = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut cfg = simplelog::ConfigBuilder::new();
    cfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        level,
        cfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .unwrap();
}

fn build_store(opts: &Opts) -> JsonStore {
    let store = JsonStore::new(opts.store.clone(), opts.node.clone());
    match &opts.model {
        Some(path) => store.with_model_path(path.clone()),
        None => store,
    }
}

fn build_engine(store: &JsonStore, catalog: &Catalog) -> Result<ScoreEngine> {
    let doc = store
        .model()
        .map_err(|e| anyhow!("loading trained model: {e}"))?;
    let model = ScoreModel::from_document(&doc, catalog)?;
    Ok(ScoreEngine::new(catalog.clone(), model))
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_log(opts.verbose);

    match &opts.command {
        Some(SubCmd::Scoreboard) => run_scoreboard(&opts),
        None => run_daemon(&opts),
    }
}

fn run_scoreboard(opts: &Opts) -> Result<()> {
    let catalog = Catalog::intel_gen11();
    let store = build_store(opts);
    let baselines = InjectorBaselines::load(&store, &catalog)?;
    let mut engine = build_engine(&store, &catalog)?;

    for job_id in store.job_ids().map_err(|e| anyhow!("{e}"))? {
        match profile::load_profile(&store, &baselines, &catalog, job_id) {
            Ok(profile) => engine.add_workload(job_id, profile),
            Err(e) => warn!("scoreboard: skipping job {job_id}: {e}"),
        }
    }

    engine.print_scoreboard();
    Ok(())
}

/// Poll the snapshot region until the watchdog's registration of `pgid`
/// becomes visible, so the first scheduling cycle after an ACK already sees
/// the new group.
fn wait_for_registration(region: &SharedRegion, pgid: i32, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if region.iter_views().any(|(_, v)| v.pgid == pgid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    warn!("daemon: pgid {pgid} not yet attributed; it joins the next cycle");
}

fn run_daemon(opts: &Opts) -> Result<()> {
    info!("smtpair v{}", env!("CARGO_PKG_VERSION"));

    let topo = Topology::detect().context("detecting SMT topology")?;
    topo.log_summary();

    let catalog = Catalog::intel_gen11();
    let store = build_store(opts);
    let baselines =
        InjectorBaselines::load(&store, &catalog).context("loading injector baselines")?;
    let mut engine = build_engine(&store, &catalog)?;

    // Boot-time fatal per the error taxonomy: without counters there is
    // nothing to attribute.
    let counters = PerfCounters::open(topo.nr_logical()).context("opening perf counters")?;
    let table = Arc::new(AttributionTable::new(topo.nr_logical(), Box::new(counters)));
    let region = table.region();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        })?;
    }

    let watchdog = Arc::new(Watchdog::new(Box::new(KillProbe)));
    watchdog.set_threshold(opts.threshold_secs)?;

    let notify = Arc::new(NotifySender::new(&opts.run_dir)?);
    // This process hosts the loader loop; external loaders can take over via
    // set_notify_endpoint.
    let self_pid = std::process::id() as i32;
    notify.set_loader_pid(self_pid);

    let feed = SwitchFeed::open().context("opening sched_switch feed")?;
    {
        let table = Arc::clone(&table);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("switch-feed".into())
            .spawn(move || feed.run(table, shutdown))?;
    }

    {
        let run_dir = opts.run_dir.clone();
        let watchdog = Arc::clone(&watchdog);
        let table = Arc::clone(&table);
        let notify = Arc::clone(&notify);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("control".into())
            .spawn(move || {
                if let Err(e) =
                    endpoint::run_control_server(&run_dir, watchdog, table, notify, shutdown)
                {
                    warn!("daemon: control server failed: {e:#}");
                }
            })?;
    }

    {
        let run_dir = opts.run_dir.clone();
        let watchdog = Arc::clone(&watchdog);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new().name("ack".into()).spawn(move || {
            if let Err(e) = endpoint::run_ack_listener(&run_dir, watchdog, shutdown) {
                warn!("daemon: ACK listener failed: {e:#}");
            }
        })?;
    }

    {
        let watchdog = Arc::clone(&watchdog);
        let table = Arc::clone(&table);
        let notify = Arc::clone(&notify);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new().name("tick".into()).spawn(move || {
            let ticker = crossbeam::channel::tick(Duration::from_secs(1));
            while !shutdown.load(Ordering::Relaxed) {
                match ticker.recv_timeout(Duration::from_millis(500)) {
                    Ok(_) => watchdog.tick(&table, &*notify),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
    }

    // The cooperative loader + scheduler loop.
    let listener = NotifyEndpoint::bind(&opts.run_dir, self_pid)?;
    listener.set_timeout(Some(Duration::from_millis(500)))?;
    let settle = Duration::from_secs(opts.settle_secs);

    info!("smtpair is active (ctrl-c to exit)");
    while !shutdown.load(Ordering::Relaxed) {
        let Some(request) = listener.recv()? else {
            continue;
        };
        info!(
            "daemon: profiling request for pgid={} job={} ({}s elapsed)",
            request.pgid, request.job_id, request.elapsed_secs
        );

        if !engine.is_known(request.job_id) {
            match profile::load_profile(&store, &baselines, &catalog, request.job_id) {
                Ok(profile) => engine.add_workload(request.job_id, profile),
                Err(ProfileError::NotFound(what)) => {
                    // No ACK: the group stays unregistered and co-runs on
                    // whatever siblings the OS picks.
                    warn!(
                        "daemon: job {} has no profile ({what}); excluded from pairing",
                        request.job_id
                    );
                    continue;
                }
                Err(ProfileError::Unavailable(e)) => {
                    warn!(
                        "daemon: profile store unavailable for job {}: {e:#}",
                        request.job_id
                    );
                    continue;
                }
            }
        }

        if let Err(e) = endpoint::send_ack(&opts.run_dir, request.pgid) {
            warn!("daemon: ACK for pgid {} failed: {e:#}", request.pgid);
            continue;
        }
        wait_for_registration(&region, request.pgid, Duration::from_secs(5));

        let mut evaluator = StpEvaluator {
            table: &table,
            engine: &engine,
            region: Arc::clone(&region),
            settle,
        };
        match schedule_cycle(&engine, &topo, &region, &mut evaluator) {
            Ok(outcome) => {
                if let Some(winner) = &outcome.winner {
                    info!(
                        "daemon: committed assignment for {} groups (STP {:.4})",
                        winner.masks.len(),
                        outcome.stp
                    );
                }
            }
            Err(e) => warn!("daemon: scheduling cycle failed: {e:#}"),
        }
    }

    info!("smtpair shutting down");
    Ok(())
}
