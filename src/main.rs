use std::path::PathBuf;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use kindling::config::TOKEN_ENV;
use kindling::thread_state::ProcTaskLister;
use kindling::{
    Config, HttpSink, MemorySink, ReplaySource, SampleKind, SessionBuilder, StatCollector,
    TelemetrySink,
};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Command {
    /// Verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides it.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// JSON config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Recorded stacks to replay every window
    #[arg(short, long)]
    replay: PathBuf,
    /// Collector base URL
    #[arg(long)]
    url: Option<String>,
    #[arg(long, env = "KINDLING_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Seconds to profile for, 0 runs until Ctrl-C
    #[arg(short, long, default_value = "0")]
    duration: u64,
    #[arg(short, long)]
    kind: Option<SampleKind>,
    /// Sampling interval in milliseconds
    #[arg(short, long)]
    interval: Option<u64>,
    #[arg(long)]
    profile_memory: bool,
    /// Track the threads of this process instead of our own
    #[arg(short, long)]
    pid: Option<u32>,
    /// Do not report system CPU and memory
    #[arg(long)]
    no_stats: bool,
    /// Keep everything in memory instead of uploading
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(opts: &Command) -> Result<Config> {
    let mut config = match &opts.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.verbosity = opts.verbose;
    if let Some(kind) = opts.kind {
        config.kind = kind;
    }
    if let Some(interval) = opts.interval {
        config.interval_ms = interval;
    }
    if opts.profile_memory {
        config.profile_memory = true;
    }
    if let Some(url) = &opts.url {
        config.endpoint.url = url.clone();
    }
    if let Some(token) = &opts.token {
        config.endpoint.token = token.clone();
    }
    config
        .versions
        .entry("kindling".to_string())
        .or_insert_with(|| env!("CARGO_PKG_VERSION").to_string());
    Ok(config)
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(opts.verbose);
    let config = load_config(&opts)?;

    let memory = Arc::new(MemorySink::new());
    let sink: Arc<dyn TelemetrySink> = if opts.dry_run {
        memory.clone()
    } else {
        if config.endpoint.url.is_empty() {
            bail!("No collector URL given, pass --url or use --dry-run");
        }
        if config.endpoint.token.is_empty() {
            bail!("No collector token given, pass --token or set {TOKEN_ENV}");
        }
        Arc::new(HttpSink::new(&config.endpoint.url, &config.endpoint.token)?)
    };

    let source = ReplaySource::from_file(&opts.replay)?;
    let lister = match opts.pid {
        Some(pid) => ProcTaskLister::for_pid(pid),
        None => ProcTaskLister::current(),
    };
    let mut builder = SessionBuilder::new(config, Box::new(source), sink)
        .thread_lister(Box::new(lister))
        .runtime(format!("kindling {}", env!("CARGO_PKG_VERSION")));
    if !opts.no_stats {
        builder = builder.collector(Arc::new(StatCollector::new()));
    }
    let mut session = builder.build();

    let warnings = session.start().map_err(|err| {
        eprintln!("{}", err.user_message());
        err
    })?;
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    if let Some(url) = session.url() {
        println!("Profiling: {url}");
    }

    let (tx, rx) = channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Error setting Ctrl-C handler")?;
    let deadline = (opts.duration > 0).then(|| Instant::now() + Duration::from_secs(opts.duration));
    if deadline.is_none() {
        println!("Press Ctrl-C to stop");
    }
    while session.is_running() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    println!("Stopping...");
    let halted = !session.is_running();
    session.stop()?;
    if opts.dry_run {
        println!(
            "Recorded {} snapshots and {} timelines in {:.1}s",
            memory.snapshots().len(),
            memory.timelines().len(),
            session.current_duration().as_secs_f64()
        );
    }
    if halted {
        bail!("Profiling stopped early, see the log for details");
    }
    Ok(())
}
