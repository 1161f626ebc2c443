//! Phase sequencer.
//!
//! Drives the fixed step order for one test case against its provisioning
//! binary and kubectl, accumulating phase durations into an
//! [`ExperimentResult`]. The first failing step aborts the sequence.
//!
//! Step order:
//! 1. version probe (one-shot)
//! 2. startup (one-shot, setup command line)
//! 3. API server answering (retrying)
//! 4. `kubernetes` and `kube-dns` services exist (retrying, one phase each)
//! 5. workload applied (retrying)
//! 6. workload reachable over TCP (retrying, same phase as 5)
//! 7. workload name resolves (retrying)
//! 8. teardown (retrying, own deadline)

use crate::exec::{run_command, ExecError, RunContext};
use crate::retry::{run_until_success, RetryPolicy};
use crate::sampler::{CpuSampler, DEFAULT_SAMPLE_INTERVAL};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use ttk_core::{CommandLine, ExperimentResult, Phase, TestCase};

/// Default per-run timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6 * 60);

/// Default kubectl binary.
pub const DEFAULT_KUBECTL: &str = "kubectl";

/// Steps of one sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    VersionProbe,
    Startup,
    ApiReady,
    KubernetesService,
    DnsService,
    DeployWorkload,
    WorkloadReachable,
    DnsResolves,
    Teardown,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VersionProbe => "version probe",
            Self::Startup => "startup",
            Self::ApiReady => "api server",
            Self::KubernetesService => "kubernetes service",
            Self::DnsService => "dns service",
            Self::DeployWorkload => "deploy workload",
            Self::WorkloadReachable => "workload reachable",
            Self::DnsResolves => "dns resolves",
            Self::Teardown => "teardown",
        }
    }

    /// Phase this step's duration accumulates into.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::VersionProbe | Self::Teardown => None,
            Self::Startup => Some(Phase::Startup),
            Self::ApiReady => Some(Phase::ApiReady),
            Self::KubernetesService => Some(Phase::KubernetesService),
            Self::DnsService => Some(Phase::DnsService),
            Self::DeployWorkload | Self::WorkloadReachable => Some(Phase::AppRunning),
            Self::DnsResolves => Some(Phase::DnsResolved),
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed sequence: the step, the wrapped command error and the partial result.
#[derive(Debug, Error)]
#[error("{test_case}: {step} failed: {source}")]
pub struct SequenceError {
    pub test_case: String,
    pub step: Step,
    #[source]
    pub source: ExecError,
    /// Result with phases collected so far and `error` populated.
    pub result: Box<ExperimentResult>,
}

impl SequenceError {
    pub fn into_result(self) -> ExperimentResult {
        *self.result
    }
}

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// kubectl binary used for every cluster query.
    pub kubectl: String,
    /// Workload manifest applied in the deploy step.
    pub manifest: PathBuf,
    /// Bound on steps 1 to 7 together, and separately on teardown.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Host platform recorded in every result.
    pub platform: String,
    /// CPU sampling interval; `None` disables sampling.
    pub cpu_sample_interval: Option<Duration>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            kubectl: DEFAULT_KUBECTL.to_string(),
            manifest: PathBuf::from("manifests/netcat-svc.yaml"),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            platform: std::env::consts::OS.to_string(),
            cpu_sample_interval: Some(DEFAULT_SAMPLE_INTERVAL),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseSequencer {
    config: SequencerConfig,
}

impl PhaseSequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    fn kubectl<'a>(
        &self,
        test_case: &TestCase,
        args: impl IntoIterator<Item = &'a str>,
    ) -> CommandLine {
        CommandLine::new(&self.config.kubectl)
            .args(test_case.context_args())
            .args(args)
    }

    /// Retrying cluster checks (steps 3 to 7) for a test case.
    pub fn plan(&self, test_case: &TestCase) -> Vec<(Step, CommandLine)> {
        let manifest = self.config.manifest.display().to_string();
        vec![
            (Step::ApiReady, self.kubectl(test_case, ["get", "po", "-A"])),
            (
                Step::KubernetesService,
                self.kubectl(test_case, ["get", "svc", "kubernetes"]),
            ),
            (
                Step::DnsService,
                self.kubectl(test_case, ["get", "svc", "kube-dns", "-n", "kube-system"]),
            ),
            (
                Step::DeployWorkload,
                self.kubectl(test_case, ["apply", "-f", manifest.as_str()]),
            ),
            (
                Step::WorkloadReachable,
                self.kubectl(
                    test_case,
                    ["exec", "deployment/netcat", "--", "nc", "-v", "localhost", "8080"],
                ),
            ),
            (
                Step::DnsResolves,
                self.kubectl(
                    test_case,
                    ["exec", "deployment/netcat", "--", "nslookup", "netcat.default"],
                ),
            ),
        ]
    }

    /// Run the full sequence for one test case.
    pub async fn run(
        &self,
        test_case: &TestCase,
        iteration: u32,
    ) -> Result<ExperimentResult, SequenceError> {
        let ctx = RunContext::with_timeout(self.config.timeout);
        let mut result = ExperimentResult::new(test_case, iteration, &self.config.platform);

        info!(
            test_case = %test_case.name,
            iteration,
            setup = %test_case.setup,
            teardown = %test_case.teardown,
            provisioner = test_case.provisioner.map_or("unknown", |p| p.as_str()),
            "starting sequence"
        );

        let sampler = self
            .config
            .cpu_sample_interval
            .map(|interval| CpuSampler::start(ctx.token().child_token(), interval));

        let phases = self.run_phases(&ctx, test_case, &mut result).await;

        if let Some(sampler) = sampler {
            if let Some(busy) = sampler.finish().await {
                result.cpu_time = result.total.mul_f64(busy);
            }
        }
        ctx.cancel();

        if let Err((step, err)) = phases {
            if step != Step::VersionProbe {
                self.teardown_after_failure(test_case).await;
            }
            return Err(Self::fail(result, step, err));
        }

        let teardown_ctx = RunContext::with_timeout(self.config.timeout);
        if let Err(err) =
            run_until_success(&teardown_ctx, &test_case.teardown, &self.config.retry).await
        {
            return Err(Self::fail(result, Step::Teardown, err));
        }

        info!(
            test_case = %test_case.name,
            iteration,
            total_ms = result.total.as_millis() as u64,
            "sequence complete"
        );
        Ok(result)
    }

    async fn run_phases(
        &self,
        ctx: &RunContext,
        test_case: &TestCase,
        result: &mut ExperimentResult,
    ) -> Result<(), (Step, ExecError)> {
        let probe = CommandLine::new(&test_case.setup.program).arg("version");
        let version = run_command(ctx, &probe)
            .await
            .map_err(|e| (Step::VersionProbe, e))?;
        result.version = version.first_line().to_string();

        let startup = run_command(ctx, &test_case.setup)
            .await
            .map_err(|e| (Step::Startup, e))?;
        result.record(Phase::Startup, startup.duration);
        info!(
            test_case = %test_case.name,
            duration_ms = startup.duration.as_millis() as u64,
            "startup complete"
        );

        for (step, command) in self.plan(test_case) {
            let outcome = run_until_success(ctx, &command, &self.config.retry)
                .await
                .map_err(|e| (step, e))?;
            if let Some(phase) = step.phase() {
                result.record(phase, outcome.duration);
            }
            info!(
                test_case = %test_case.name,
                step = %step,
                attempts = outcome.attempts,
                duration_ms = outcome.duration.as_millis() as u64,
                "step complete"
            );
        }

        Ok(())
    }

    /// One-shot teardown after an aborted sequence. Never alters the result.
    async fn teardown_after_failure(&self, test_case: &TestCase) {
        let ctx = RunContext::with_timeout(self.config.timeout);
        if let Err(err) = run_command(&ctx, &test_case.teardown).await {
            warn!(test_case = %test_case.name, error = %err, "cleanup after failure failed");
        }
    }

    fn fail(mut result: ExperimentResult, step: Step, source: ExecError) -> SequenceError {
        result.fail(source.outcome().exit_code, format!("{step}: {source}"));
        SequenceError {
            test_case: result.name.clone(),
            step,
            source,
            result: Box::new(result),
        }
    }
}
