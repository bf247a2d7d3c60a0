use anyhow::{Context, Result};
use clap::Parser;
use iokernel::cipher::ChaChaCiphers;
use iokernel::nic::LoopbackPort;
use iokernel::{Dataplane, IokernelConfig, control_channel};
use nix::sys::signal::{SigSet, Signal};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// iokernel dataplane
#[derive(Parser, Debug)]
#[command(name = "iokernel", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Packets pulled from runtimes per TX iteration
    #[arg(long)]
    tx_burst_size: Option<usize>,

    /// Commands pulled from runtimes per iteration
    #[arg(long)]
    cmd_burst_size: Option<usize>,

    /// Overflowed completions retried per iteration
    #[arg(long)]
    overflow_batch_drain: Option<usize>,

    /// Statistics logging period in milliseconds (0 disables)
    #[arg(long)]
    stats_interval_ms: Option<u64>,

    /// Descriptors the loopback port holds in flight
    #[arg(long, default_value = "512")]
    loopback_ring: usize,
}

impl Args {
    fn load_config(&self) -> Result<IokernelConfig> {
        let mut config = match &self.config {
            Some(path) => IokernelConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => IokernelConfig::default(),
        };
        if let Some(v) = self.tx_burst_size {
            config.tx_burst_size = v;
        }
        if let Some(v) = self.cmd_burst_size {
            config.cmd_burst_size = v;
        }
        if let Some(v) = self.overflow_batch_drain {
            config.overflow_batch_drain = v;
        }
        if let Some(v) = self.stats_interval_ms {
            config.stats_interval_ms = v;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iokernel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.load_config()?;
    info!(?config, "starting iokernel");

    // Block the shutdown signals before spawning so only this thread
    // receives them.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().context("blocking signals")?;

    let (handle, command_rx) = control_channel();
    let ring = args.loopback_ring;
    let dataplane = std::thread::Builder::new()
        .name("dataplane".into())
        .spawn(move || {
            Dataplane::new(
                config,
                LoopbackPort::new(ring),
                Box::new(ChaChaCiphers::new()),
                command_rx,
            )
            .run();
        })
        .context("spawning dataplane thread")?;

    let signal = signals.wait().context("waiting for signals")?;
    info!(?signal, "shutting down");
    handle.shutdown();

    dataplane
        .join()
        .map_err(|_| anyhow::anyhow!("dataplane thread panicked"))?;
    info!("iokernel stopped");
    Ok(())
}
