//! rilproxy binary: relay one socket family until signalled.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;

use rilproxy::relay::supervisor;
use rilproxy::{Config, DedupPolicy, Reactor, Relay, UpstreamMode};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "rilproxy")]
#[command(version = VERSION)]
#[command(about = "Relay between the modem control socket and one or two SIM clients")]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Socket family selector (0 = rild/rilproxy, N = rildN/rilproxyN)
    #[arg(long)]
    selector: Option<u32>,

    /// Serve both client sockets (dual-SIM fan-out)
    #[arg(long)]
    fission: bool,

    /// Directory holding the named sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Arbitrate the data-call activation request between both clients
    #[arg(long)]
    dedup: bool,
}

fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(selector) = cli.selector {
        config.selector = selector;
    }
    if let Some(dir) = cli.socket_dir {
        config.socket_dir = dir;
    }
    config.fission |= cli.fission;
    config.dedup_enabled |= cli.dedup;
    config.validate()?;

    log::info!(
        "rilproxy v{VERSION} starting: {}",
        serde_json::to_string(&config).context("serialize config")?
    );

    if let Err(e) = run(config) {
        log::error!("rilproxy exiting: {e:#}");
        eprintln!("rilproxy: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

/// Log to stderr, or to `RILPROXY_LOG_FILE` when set.
fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Ok(path) = std::env::var("RILPROXY_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("create log file {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn run(config: Config) -> Result<()> {
    let reactor = Reactor::new(config.max_watches).context("create reactor")?;
    let dedup = Arc::new(DedupPolicy::new(
        config.dedup_enabled,
        config.dedup_trigger,
        config.dedup_release.clone(),
    ));
    let upstream_path = config.socket_path(&config.family().upstream);
    let retry = config.retry_delay();
    let mode = config.upstream_mode;

    let relay = Relay::new(config, Arc::clone(&reactor), dedup);
    relay.start().context("bind relay sockets")?;

    // Signals set the flag and write a byte to the reactor's wake pipe so a
    // blocked poll() returns and sees it.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::{flag, low_level};
        for sig in [SIGINT, SIGTERM, SIGHUP] {
            flag::register(sig, Arc::clone(&shutdown))?;
            low_level::pipe::register_raw(sig, reactor.wake_fd())?;
        }
    }

    if mode == UpstreamMode::Connect {
        supervisor::spawn(Arc::clone(&relay), upstream_path, retry)
            .context("spawn supervisor thread")?;
    }

    let reactor_relay = Arc::clone(&relay);
    let reactor_shutdown = Arc::clone(&shutdown);
    let handle = thread::Builder::new()
        .name("rilproxy-reactor".to_owned())
        .spawn(move || -> rilproxy::Result<()> {
            while !reactor.is_shutdown() {
                if reactor_shutdown.load(Ordering::Relaxed) {
                    log::info!("shutdown signal received");
                    reactor_relay.shutdown();
                    break;
                }
                reactor.turn()?;
            }
            Ok(())
        })
        .context("spawn reactor thread")?;

    let outcome = match handle.join() {
        Ok(result) => result.context("reactor stopped"),
        Err(_) => Err(anyhow::anyhow!("reactor thread panicked")),
    };

    log::info!(
        "final counters: {}",
        serde_json::to_string(&relay.snapshot()).unwrap_or_default()
    );
    relay.shutdown();
    outcome
}
