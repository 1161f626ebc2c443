//! time-to-k8s - local Kubernetes startup benchmark
//!
//! Library components for the benchmark binary: process execution, retries,
//! the per-test-case phase sequence and the iteration loop.

pub mod controller;
pub mod exec;
pub mod retry;
pub mod sampler;
pub mod sequencer;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use controller::{ControllerError, IterationController, RunSummary};
use retry::RetryPolicy;
use sampler::DEFAULT_SAMPLE_INTERVAL;
use sequencer::{PhaseSequencer, SequencerConfig, DEFAULT_KUBECTL, DEFAULT_TIMEOUT};
use thiserror::Error;
use tracing::info;
use ttk_core::config::ConfigError;
use ttk_core::{ReportWriter, TestSuite};

/// Minimal netcat Deployment and Service used by the workload steps.
pub const NETCAT_MANIFEST: &str = include_str!("../manifests/netcat-svc.yaml");

/// Default number of recorded iterations.
pub const DEFAULT_ITERATIONS: u32 = 5;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("output file {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write workload manifest: {0}")]
    Manifest(#[source] std::io::Error),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Benchmark configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Test suite YAML.
    pub config_path: PathBuf,
    /// Recorded iterations; a dry run always precedes them.
    pub iterations: u32,
    /// Per-run timeout.
    pub timeout: Duration,
    /// CSV destination (default: a temp file named after the config).
    pub output: Option<PathBuf>,
    pub kubectl: String,
    /// Workload manifest (default: the embedded netcat manifest).
    pub manifest: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub cpu_sample_interval: Option<Duration>,
    pub platform: String,
}

impl BenchConfig {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            iterations: DEFAULT_ITERATIONS,
            timeout: DEFAULT_TIMEOUT,
            output: None,
            kubectl: DEFAULT_KUBECTL.to_string(),
            manifest: None,
            retry: RetryPolicy::default(),
            cpu_sample_interval: Some(DEFAULT_SAMPLE_INTERVAL),
            platform: std::env::consts::OS.to_string(),
        }
    }

    fn sequencer_config(&self, manifest: PathBuf) -> SequencerConfig {
        SequencerConfig {
            kubectl: self.kubectl.clone(),
            manifest,
            timeout: self.timeout,
            retry: self.retry,
            platform: self.platform.clone(),
            cpu_sample_interval: self.cpu_sample_interval,
        }
    }
}

/// Outcome of a completed benchmark.
#[derive(Debug, Clone)]
pub struct BenchReport {
    pub output: PathBuf,
    pub summary: RunSummary,
}

/// A loaded benchmark, ready to run.
#[derive(Debug)]
pub struct Benchmark {
    config: BenchConfig,
    suite: TestSuite,
}

impl Benchmark {
    /// Load the test suite named by `config`.
    pub fn new(config: BenchConfig) -> Result<Self, BenchError> {
        let suite = TestSuite::from_file(&config.config_path)?;
        Ok(Self::with_suite(config, suite))
    }

    pub fn with_suite(config: BenchConfig, suite: TestSuite) -> Self {
        Self { config, suite }
    }

    pub fn suite(&self) -> &TestSuite {
        &self.suite
    }

    /// Open the report: the configured path (truncated), or a kept temp file
    /// named `<config basename>.<random>.csv`.
    pub fn open_output(&self) -> Result<(ReportWriter<BufWriter<File>>, PathBuf), BenchError> {
        let (file, path) = match &self.config.output {
            Some(path) => {
                let file = File::create(path).map_err(|source| BenchError::Output {
                    path: path.clone(),
                    source,
                })?;
                (file, path.clone())
            }
            None => {
                let prefix = format!("{}.", config_basename(&self.config.config_path));
                tempfile::Builder::new()
                    .prefix(&prefix)
                    .suffix(".csv")
                    .tempfile()
                    .and_then(|f| f.keep().map_err(std::io::Error::from))
                    .map_err(|source| BenchError::Output {
                        path: std::env::temp_dir().join(format!("{prefix}*.csv")),
                        source,
                    })?
            }
        };
        let writer = ReportWriter::new(BufWriter::new(file)).map_err(|source| BenchError::Output {
            path: path.clone(),
            source,
        })?;
        Ok((writer, path))
    }

    /// Run the sweep, dry run and recorded iterations.
    pub async fn run(&self) -> Result<BenchReport, BenchError> {
        let (mut writer, output) = self.open_output()?;
        info!(output = %output.display(), "writing results");

        // Held until the run ends so the embedded manifest stays on disk.
        let mut embedded = None;
        let manifest = match &self.config.manifest {
            Some(path) => path.clone(),
            None => {
                let file = write_embedded_manifest().map_err(BenchError::Manifest)?;
                let path = file.path().to_path_buf();
                embedded = Some(file);
                path
            }
        };

        let sequencer = PhaseSequencer::new(self.config.sequencer_config(manifest));
        let controller = IterationController::new(&sequencer, &self.suite, self.config.iterations);
        let summary = controller.run(&mut writer).await?;
        drop(embedded);

        info!(
            recorded = summary.recorded,
            failed = summary.failed,
            output = %output.display(),
            "benchmark complete"
        );
        Ok(BenchReport { output, summary })
    }
}

fn config_basename(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("time-to-k8s")
        .to_string()
}

fn write_embedded_manifest() -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("netcat-svc.")
        .suffix(".yaml")
        .tempfile()?;
    file.write_all(NETCAT_MANIFEST.as_bytes())?;
    file.flush()?;
    Ok(file)
}
