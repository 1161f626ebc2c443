//! time-to-k8s - local Kubernetes startup benchmark
//!
//! Main entry point for the benchmark binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::{bail, WrapErr};
use time_to_k8s::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use time_to_k8s::{BenchConfig, Benchmark, DEFAULT_ITERATIONS};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "time-to-k8s",
    about = "Benchmark how long local Kubernetes clusters take to become usable",
    version
)]
struct Cli {
    /// Test suite YAML (see local-kubernetes.yaml)
    #[arg(long, env = "TTK_CONFIG")]
    config: Option<PathBuf>,

    /// Recorded iterations (a dry run always runs first)
    #[arg(long, env = "TTK_ITERATIONS", default_value_t = DEFAULT_ITERATIONS)]
    iterations: u32,

    /// Maximum seconds a single test case may take
    #[arg(long, env = "TTK_TIMEOUT_SEC", default_value_t = 360)]
    timeout_sec: u64,

    /// CSV output path (default: a temp file named after the config)
    #[arg(long, env = "TTK_OUTPUT")]
    output: Option<PathBuf>,

    /// kubectl binary
    #[arg(long, env = "TTK_KUBECTL", default_value = "kubectl")]
    kubectl: String,

    /// Workload manifest (default: embedded netcat deployment)
    #[arg(long, env = "TTK_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Milliseconds between attempts of a retried command
    #[arg(long, default_value_t = 10)]
    poll_interval_ms: u64,

    /// Attempt ceiling for retried commands
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Milliseconds between CPU samples (0 disables sampling)
    #[arg(long, default_value_t = 1000)]
    cpu_sample_interval_ms: u64,
}

impl Cli {
    fn into_config(self) -> eyre::Result<BenchConfig> {
        let Some(config_path) = self.config else {
            bail!("--config is a required flag. See ./local-kubernetes.yaml, for example");
        };

        let mut config = BenchConfig::new(config_path);
        config.iterations = self.iterations;
        config.timeout = Duration::from_secs(self.timeout_sec);
        config.output = self.output;
        config.kubectl = self.kubectl;
        config.manifest = self.manifest;
        config.retry = RetryPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_attempts,
        };
        config.cpu_sample_interval = (self.cpu_sample_interval_ms > 0)
            .then(|| Duration::from_millis(self.cpu_sample_interval_ms));
        Ok(config)
    }
}

async fn run(config: BenchConfig) -> eyre::Result<()> {
    let benchmark = Benchmark::new(config).wrap_err("unable to load config")?;
    info!(test_cases = benchmark.suite().len(), "loaded test suite");

    let report = benchmark.run().await.wrap_err("benchmark aborted")?;
    info!(
        recorded = report.summary.recorded,
        failed = report.summary.failed,
        "results written to {}",
        report.output.display()
    );
    Ok(())
}

/// Await a signal listener. A listener that failed to install never resolves.
async fn listen(signal: &'static str, listener: impl Future<Output = std::io::Result<()>>) {
    if let Err(err) = listener.await {
        warn!(signal, error = %err, "failed to listen for signal");
        std::future::pending::<()>().await;
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                return tokio::select! {
                    () = listen("SIGINT", tokio::signal::ctrl_c()) => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                };
            }
            Err(err) => warn!(error = %err, "failed to listen for SIGTERM"),
        }
    }
    listen("SIGINT", tokio::signal::ctrl_c()).await;
    "SIGINT"
}

fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(2);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let result = runtime.block_on(async {
        // Dropping the run future kills any in-flight process.
        tokio::select! {
            result = run(config) => result,
            signal = shutdown_signal() => {
                info!("received {signal}, aborting benchmark");
                Err(eyre::eyre!("interrupted by {signal}"))
            }
        }
    });

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}
