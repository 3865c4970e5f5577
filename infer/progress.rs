use std::fmt;

/// Stages reported once per bootstrap while inferring a network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InferenceStage {
    Association,
    Regression,
}

impl InferenceStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Association => "mutual information",
            Self::Regression => "per-target regression",
        }
    }
}

impl fmt::Display for InferenceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress during a run.
///
/// Only the coordinating worker reports, so implementations need not be thread safe.
pub trait InferenceProgressObserver {
    fn on_run_start(&mut self, bootstraps: usize) {
        let _ = bootstraps;
    }
    fn on_stage_start(&mut self, bootstrap: usize, stage: InferenceStage, total_units: usize) {
        let _ = (bootstrap, stage, total_units);
    }
    fn on_stage_finish(&mut self, bootstrap: usize, stage: InferenceStage) {
        let _ = (bootstrap, stage);
    }
    fn on_bootstrap_finish(&mut self, bootstrap: usize) {
        let _ = bootstrap;
    }
    fn on_run_finish(&mut self) {}
}

#[derive(Default)]
pub struct NoopInferenceProgress;

impl InferenceProgressObserver for NoopInferenceProgress {}
