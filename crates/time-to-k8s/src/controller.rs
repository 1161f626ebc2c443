//! Iteration controller.
//!
//! Runs a teardown sweep, then the dry run (iteration 0) and the recording
//! iterations 1..=N over every test case, one at a time.

use crate::exec::{run_command, RunContext};
use crate::sequencer::{PhaseSequencer, SequenceError};
use std::io::Write;
use thiserror::Error;
use tracing::{error, info, warn};
use ttk_core::{ExperimentResult, ReportWriter, TestSuite};

/// Destination for recorded results.
pub trait ResultSink {
    fn record(&mut self, result: &ExperimentResult) -> std::io::Result<()>;
}

impl<W: Write> ResultSink for ReportWriter<W> {
    fn record(&mut self, result: &ExperimentResult) -> std::io::Result<()> {
        self.write_result(result)
    }
}

impl ResultSink for Vec<ExperimentResult> {
    fn record(&mut self, result: &ExperimentResult) -> std::io::Result<()> {
        self.push(result.clone());
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("dry run failed: {0}")]
    DryRun(#[source] Box<SequenceError>),
    #[error("failed to record result: {0}")]
    Sink(#[from] std::io::Error),
}

/// Counts for a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub recorded: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct IterationController<'a> {
    sequencer: &'a PhaseSequencer,
    suite: &'a TestSuite,
    iterations: u32,
}

impl<'a> IterationController<'a> {
    pub fn new(sequencer: &'a PhaseSequencer, suite: &'a TestSuite, iterations: u32) -> Self {
        Self {
            sequencer,
            suite,
            iterations,
        }
    }

    /// Run every teardown once to clear state left by an earlier run.
    pub async fn teardown_sweep(&self) {
        for test_case in self.suite {
            info!(test_case = %test_case.name, command = %test_case.teardown, "cleaning up");
            let ctx = RunContext::with_timeout(self.sequencer.config().timeout);
            if let Err(err) = run_command(&ctx, &test_case.teardown).await {
                warn!(test_case = %test_case.name, error = %err, "cleanup failed");
            }
        }
    }

    /// Sweep, dry run, then record iterations 1..=N into `sink`.
    pub async fn run(&self, sink: &mut dyn ResultSink) -> Result<RunSummary, ControllerError> {
        self.teardown_sweep().await;

        let mut summary = RunSummary::default();
        for iteration in 0..=self.iterations {
            if iteration == 0 {
                info!("starting dry-run iteration; results will not be recorded");
            } else {
                info!(iteration, of = self.iterations, "starting iteration");
            }

            for test_case in self.suite {
                let result = match self.sequencer.run(test_case, iteration).await {
                    Ok(result) => result,
                    Err(err) if iteration == 0 => {
                        error!(test_case = %test_case.name, error = %err, "dry run failed");
                        return Err(ControllerError::DryRun(Box::new(err)));
                    }
                    Err(err) => {
                        error!(
                            test_case = %test_case.name,
                            iteration,
                            error = %err,
                            "experiment failed"
                        );
                        summary.failed += 1;
                        err.into_result()
                    }
                };

                info!(
                    test_case = %test_case.name,
                    iteration,
                    total_ms = result.total.as_millis() as u64,
                    version = %result.version,
                    "experiment finished"
                );
                if iteration == 0 {
                    continue;
                }
                sink.record(&result)?;
                summary.recorded += 1;
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::SequencerConfig;
    use ttk_core::{CommandLine, TestCase};

    struct FailingSink;

    impl ResultSink for FailingSink {
        fn record(&mut self, _: &ExperimentResult) -> std::io::Result<()> {
            Err(std::io::Error::other("disk full"))
        }
    }

    fn broken_suite() -> TestSuite {
        TestSuite::from_cases(vec![TestCase::new(
            "broken",
            CommandLine::parse("/nonexistent/kind create cluster").unwrap(),
            CommandLine::parse("true").unwrap(),
            None,
        )])
    }

    fn sequencer() -> PhaseSequencer {
        PhaseSequencer::new(SequencerConfig {
            cpu_sample_interval: None,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn dry_run_failure_aborts_before_recording() {
        let suite = broken_suite();
        let sequencer = sequencer();
        let controller = IterationController::new(&sequencer, &suite, 3);
        let mut sink: Vec<ExperimentResult> = Vec::new();

        let err = controller.run(&mut sink).await.unwrap_err();
        assert!(matches!(err, ControllerError::DryRun(_)));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn zero_iterations_records_nothing() {
        let suite = TestSuite::default();
        let sequencer = sequencer();
        let controller = IterationController::new(&sequencer, &suite, 0);
        let mut sink = FailingSink;
        let summary = controller.run(&mut sink).await.unwrap();
        assert_eq!(summary, RunSummary::default());
    }

    #[test]
    fn vec_sink_collects_results() {
        let tc = TestCase::new("a", CommandLine::new("kind"), CommandLine::new("kind"), None);
        let mut sink: Vec<ExperimentResult> = Vec::new();
        sink.record(&ExperimentResult::new(&tc, 1, "linux")).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].name, "a");
    }
}
