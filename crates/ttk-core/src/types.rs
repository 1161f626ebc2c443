//! Core types for the benchmark harness.
//!
//! Commands, provisioning tools, phases and the per-iteration result record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandLineError {
    #[error("empty command line")]
    Empty,
}

/// An external command: a program plus its arguments.
///
/// Command lines from configuration are split on whitespace. There is no shell
/// quoting, so a single argument cannot contain spaces, and shell metacharacters
/// reach the program as literal arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Split a configured command string on whitespace.
    pub fn parse(line: &str) -> Result<Self, CommandLineError> {
        let mut tokens = line.split_whitespace();
        let program = tokens.next().ok_or(CommandLineError::Empty)?;
        Ok(Self::new(program).args(tokens))
    }

    /// Full argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// File name of the program, without any leading directories.
    pub fn binary_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }
}

impl FromStr for CommandLine {
    type Err = CommandLineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Known cluster provisioning tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provisioner {
    Kind,
    Minikube,
    K3d,
}

impl Provisioner {
    /// Detection order for binary-name matching.
    pub const ALL: [Self; 3] = [Self::Kind, Self::Minikube, Self::K3d];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kind => "kind",
            Self::Minikube => "minikube",
            Self::K3d => "k3d",
        }
    }

    /// Kube context the tool registers for its default cluster.
    pub fn kube_context(&self) -> &'static str {
        match self {
            Self::Kind => "kind-kind",
            Self::Minikube => "minikube",
            Self::K3d => "k3d-k3s-default",
        }
    }

    /// Extra kubectl arguments selecting this tool's cluster.
    pub fn context_args(&self) -> [&'static str; 2] {
        ["--context", self.kube_context()]
    }

    /// Detect the tool from a binary path by substring match on its file name.
    pub fn detect(program: &str) -> Option<Self> {
        let name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        Self::ALL.into_iter().find(|p| name.contains(p.as_str()))
    }
}

/// Named, timed stage of bringing up and validating a cluster.
///
/// Core-service readiness is split into its two sub-checks. Applying the
/// workload and probing it over TCP share `AppRunning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Startup,
    ApiReady,
    KubernetesService,
    DnsService,
    AppRunning,
    DnsResolved,
}

impl Phase {
    pub const ALL: [Self; 6] = [
        Self::Startup,
        Self::ApiReady,
        Self::KubernetesService,
        Self::DnsService,
        Self::AppRunning,
        Self::DnsResolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::ApiReady => "api_ready",
            Self::KubernetesService => "kubernetes_svc",
            Self::DnsService => "dns_svc",
            Self::AppRunning => "app_running",
            Self::DnsResolved => "dns_resolved",
        }
    }

    /// Report column header.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Startup => "command exec (seconds)",
            Self::ApiReady => "apiserver answering (seconds)",
            Self::KubernetesService => "kubernetes svc (seconds)",
            Self::DnsService => "dns svc (seconds)",
            Self::AppRunning => "app running (seconds)",
            Self::DnsResolved => "dns answering (seconds)",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated duration of every phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseDurations {
    pub startup: Duration,
    pub api_ready: Duration,
    pub kubernetes_svc: Duration,
    pub dns_svc: Duration,
    pub app_running: Duration,
    pub dns_resolved: Duration,
}

impl PhaseDurations {
    pub fn get(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Startup => self.startup,
            Phase::ApiReady => self.api_ready,
            Phase::KubernetesService => self.kubernetes_svc,
            Phase::DnsService => self.dns_svc,
            Phase::AppRunning => self.app_running,
            Phase::DnsResolved => self.dns_resolved,
        }
    }

    fn slot(&mut self, phase: Phase) -> &mut Duration {
        match phase {
            Phase::Startup => &mut self.startup,
            Phase::ApiReady => &mut self.api_ready,
            Phase::KubernetesService => &mut self.kubernetes_svc,
            Phase::DnsService => &mut self.dns_svc,
            Phase::AppRunning => &mut self.app_running,
            Phase::DnsResolved => &mut self.dns_resolved,
        }
    }

    /// Add `duration` to a phase.
    pub fn add(&mut self, phase: Phase, duration: Duration) {
        *self.slot(phase) += duration;
    }

    pub fn total(&self) -> Duration {
        Phase::ALL.iter().map(|p| self.get(*p)).sum()
    }
}

/// One provisioning tool configuration benchmarked across iterations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub setup: CommandLine,
    pub teardown: CommandLine,
    /// Resolved once, from configuration or the setup binary's name.
    pub provisioner: Option<Provisioner>,
}

impl TestCase {
    /// Create a test case. Without an explicit `tool`, the provisioner is
    /// detected from the setup binary.
    pub fn new(
        name: impl Into<String>,
        setup: CommandLine,
        teardown: CommandLine,
        tool: Option<Provisioner>,
    ) -> Self {
        let provisioner = tool.or_else(|| Provisioner::detect(&setup.program));
        Self {
            name: name.into(),
            setup,
            teardown,
            provisioner,
        }
    }

    /// Extra kubectl arguments for every cluster query of this test case.
    pub fn context_args(&self) -> Vec<String> {
        self.provisioner
            .map(|p| p.context_args().iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }
}

/// Captured result of running one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub argv: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 when the process produced none.
    pub exit_code: i32,
    pub duration: Duration,
    pub attempts: u32,
}

impl CommandOutcome {
    /// Outcome for a command that never produced an exit status.
    pub fn unfinished(argv: Vec<String>, duration: Duration) -> Self {
        Self {
            argv,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            duration,
            attempts: 1,
        }
    }

    /// First line of stdout, trimmed.
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().unwrap_or("").trim()
    }

    /// Last few non-empty lines of stderr, falling back to stdout.
    pub fn output_tail(&self, max_lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join(" | ")
    }
}

impl std::fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}

/// Timing record for one (test case, iteration) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentResult {
    pub name: String,
    pub args: Vec<String>,
    pub version: String,
    pub phases: PhaseDurations,
    /// Always the sum of `phases`.
    pub total: Duration,
    /// Host CPU busy time over the sequence, not part of `total`.
    pub cpu_time: Duration,
    pub exit_code: i32,
    /// Empty on success.
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub platform: String,
}

impl ExperimentResult {
    pub fn new(test_case: &TestCase, iteration: u32, platform: impl Into<String>) -> Self {
        Self {
            name: test_case.name.clone(),
            args: test_case.setup.argv(),
            version: String::new(),
            phases: PhaseDurations::default(),
            total: Duration::ZERO,
            cpu_time: Duration::ZERO,
            exit_code: 0,
            error: String::new(),
            timestamp: Utc::now(),
            iteration,
            platform: platform.into(),
        }
    }

    /// Accumulate a phase duration, keeping `total` in step.
    pub fn record(&mut self, phase: Phase, duration: Duration) {
        self.phases.add(phase, duration);
        self.total = self.phases.total();
    }

    /// Mark the result as failed.
    pub fn fail(&mut self, exit_code: i32, message: impl Into<String>) {
        let message = message.into();
        self.exit_code = exit_code;
        self.error = if message.is_empty() {
            "unknown failure".to_string()
        } else {
            message
        };
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(setup: &str) -> TestCase {
        TestCase::new(
            "case",
            CommandLine::parse(setup).unwrap(),
            CommandLine::parse("true").unwrap(),
            None,
        )
    }

    #[test]
    fn command_line_splits_on_whitespace() {
        let cmd = CommandLine::parse("  kind create   cluster --wait 5m ").unwrap();
        assert_eq!(cmd.program, "kind");
        assert_eq!(cmd.args, vec!["create", "cluster", "--wait", "5m"]);
        assert_eq!(cmd.to_string(), "kind create cluster --wait 5m");
    }

    #[test]
    fn command_line_keeps_shell_metacharacters_literal() {
        let cmd = CommandLine::parse("echo $HOME && rm *").unwrap();
        assert_eq!(cmd.args, vec!["$HOME", "&&", "rm", "*"]);
    }

    #[test]
    fn command_line_rejects_blank() {
        assert_eq!(CommandLine::parse("   "), Err(CommandLineError::Empty));
        assert_eq!("".parse::<CommandLine>(), Err(CommandLineError::Empty));
    }

    #[test]
    fn argv_starts_with_program() {
        let cmd = CommandLine::new("/usr/bin/k3d").arg("cluster").arg("create");
        assert_eq!(cmd.argv(), vec!["/usr/bin/k3d", "cluster", "create"]);
        assert_eq!(cmd.binary_name(), "k3d");
    }

    #[test]
    fn provisioner_detected_from_binary_name() {
        assert_eq!(Provisioner::detect("kind"), Some(Provisioner::Kind));
        assert_eq!(
            Provisioner::detect("/opt/bin/minikube-linux-amd64"),
            Some(Provisioner::Minikube)
        );
        assert_eq!(Provisioner::detect("./k3d"), Some(Provisioner::K3d));
        assert_eq!(Provisioner::detect("kubeadm"), None);
    }

    #[test]
    fn provisioner_detection_ignores_directories() {
        assert_eq!(Provisioner::detect("/home/kind/bin/k3d"), Some(Provisioner::K3d));
    }

    #[test]
    fn test_case_context_args_follow_provisioner() {
        assert_eq!(case("kind create cluster").context_args(), vec!["--context", "kind-kind"]);
        assert_eq!(case("minikube start").context_args(), vec!["--context", "minikube"]);
        assert_eq!(
            case("k3d cluster create").context_args(),
            vec!["--context", "k3d-k3s-default"]
        );
        assert!(case("microk8s start").context_args().is_empty());
    }

    #[test]
    fn explicit_tool_overrides_detection() {
        let tc = TestCase::new(
            "wrapped",
            CommandLine::parse("./start-cluster.sh").unwrap(),
            CommandLine::parse("./stop-cluster.sh").unwrap(),
            Some(Provisioner::Minikube),
        );
        assert_eq!(tc.provisioner, Some(Provisioner::Minikube));
    }

    #[test]
    fn phase_durations_accumulate_and_total() {
        let mut phases = PhaseDurations::default();
        phases.add(Phase::AppRunning, Duration::from_millis(200));
        phases.add(Phase::AppRunning, Duration::from_millis(300));
        phases.add(Phase::KubernetesService, Duration::from_millis(40));
        phases.add(Phase::Startup, Duration::from_secs(10));
        assert_eq!(phases.app_running, Duration::from_millis(500));
        assert_eq!(phases.dns_svc, Duration::ZERO);
        assert_eq!(phases.total(), Duration::from_millis(10_540));
    }

    #[test]
    fn result_total_tracks_recorded_phases() {
        let mut result = ExperimentResult::new(&case("kind create cluster"), 3, "linux");
        result.record(Phase::Startup, Duration::from_secs(20));
        result.record(Phase::ApiReady, Duration::from_secs(2));
        assert_eq!(result.total, Duration::from_secs(22));
        assert_eq!(result.total, result.phases.total());
        assert_eq!(result.args, vec!["kind", "create", "cluster"]);
        assert_eq!(result.iteration, 3);
        assert!(result.is_success());
    }

    #[test]
    fn failed_result_always_has_error_text() {
        let mut result = ExperimentResult::new(&case("kind create cluster"), 1, "linux");
        result.fail(2, "");
        assert!(!result.is_success());
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.phases.dns_resolved, Duration::ZERO);
    }

    #[test]
    fn outcome_helpers() {
        let outcome = CommandOutcome {
            argv: vec!["kind".into(), "version".into()],
            stdout: "kind v0.20.0 go1.20\nextra\n".into(),
            stderr: "warn: a\n\nerror: b\nerror: c\n".into(),
            exit_code: 0,
            duration: Duration::from_millis(5),
            attempts: 1,
        };
        assert_eq!(outcome.first_line(), "kind v0.20.0 go1.20");
        assert_eq!(outcome.output_tail(2), "error: b | error: c");
        assert_eq!(outcome.to_string(), "kind version");
    }
}
