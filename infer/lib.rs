#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Bootstrap inference of gene regulatory networks.
//!
//! Each bootstrap resamples the experiments, scores regulator-target association by
//! background-corrected mutual information, fits a sparse regression per target and
//! ranks the selected regulators by explained variance. Bootstraps are folded into a
//! consensus network by rank aggregation. Work is shared by a fixed set of cooperating
//! workers that meet at named barriers on a common key-value store.

pub mod activity;
pub mod association;
pub mod config;
pub mod consensus;
pub mod coordinate;
pub mod holdout;
pub mod linalg;
pub mod progress;
pub mod pseudobulk;
pub mod resample;
pub mod types;
pub mod workflow;

#[path = "../regress/mod.rs"]
pub mod regression;

#[path = "../shared/files.rs"]
pub mod shared_files;

pub mod shared {
    pub use super::shared_files as files;
}

pub use config::RunConfig;
pub use consensus::{ConsensusNetwork, NetworkEdge};
pub use workflow::{InferenceEngine, InferenceError, InferenceInput, InferenceOutcome};
