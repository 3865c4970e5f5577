//! # Bootstrap Inference Workflow
//!
//! `InferenceEngine::run` is the single entry point. It spawns one worker thread per
//! rank, all sharing one `KvStore`, and every worker walks the same bootstrap loop
//! in lockstep:
//!
//! 1. The coordinator builds the bootstrap scope (resampled design and response,
//!    discretized rows, empty result slots) and publishes it.
//! 2. Workers claim blocks of regulators and fill in mutual-information rows.
//! 3. The coordinator assembles and background-corrects the association matrix and
//!    publishes it.
//! 4. Workers claim blocks of targets and fit them against the published scores.
//! 5. The coordinator collects the per-target results into dense matrices.
//!
//! Once every bootstrap is collected the coordinator aggregates the consensus.
//! Statistical failures are folded into per-target statuses; coordination failures
//! abort every worker and surface as the error of the whole run.

use crate::association::{AssociationEngine, AssociationMatrix, DiscretizedRows, background_correct};
use crate::config::{ConfigError, RunConfig};
use crate::consensus::{ConsensusAggregator, ConsensusNetwork};
use crate::coordinate::{
    COORDINATOR_RANK, ChunkClaims, CoordinationError, KvStore, ResultAccumulator, Wait,
    leader_publish,
};
use crate::activity::ActivityError;
use crate::holdout::PriorSplit;
use crate::progress::{InferenceProgressObserver, InferenceStage, NoopInferenceProgress};
use crate::pseudobulk::{
    ClusterIndex, PseudobulkError, cluster_sizes, initial_clustering, make_clusters_from_singles,
    make_singles_from_clusters, rebulk,
};
use crate::regression::{RegressionEngine, TargetContext, standardize};
use crate::resample::{BootstrapIndexSet, ResampleError, Resampler};
use crate::types::{
    BootstrapMatrices, DesignResponse, ExpressionMatrix, PerTargetResult, PriorMatrix, TargetStatus,
};
use ahash::AHashSet;
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const CLUSTER_KEY: &str = "cluster_idx";
const DESIGN_KEY: &str = "design_response";
const ASSOCIATION_BARRIER: &str = "association-scored";
const REGRESSION_BARRIER: &str = "targets-fitted";
const COLLECTED_BARRIER: &str = "bootstrap-collected";

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Coordination timed out: {0}")]
    CoordinationTimeout(CoordinationError),
    #[error("Coordination failed: {0}")]
    Coordination(CoordinationError),
    #[error("Regulator activity could not be computed: {0}")]
    Activity(ActivityError),
    #[error("Pseudobulk aggregation failed: {0}")]
    Pseudobulk(#[from] PseudobulkError),
    #[error("Worker {0} panicked.")]
    WorkerPanicked(usize),
    #[error("Bootstrap {bootstrap} has no {stage} result for unit {unit}.")]
    IncompleteBootstrap {
        bootstrap: usize,
        stage: &'static str,
        unit: usize,
    },
}

impl From<CoordinationError> for InferenceError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Timeout { .. } => Self::CoordinationTimeout(err),
            other => Self::Coordination(other),
        }
    }
}

impl From<ActivityError> for InferenceError {
    fn from(err: ActivityError) -> Self {
        match err {
            ActivityError::NoRegulators(_) => Self::InvalidParameter(err.to_string()),
            other => Self::Activity(other),
        }
    }
}

impl From<ResampleError> for InferenceError {
    fn from(err: ResampleError) -> Self {
        Self::InvalidParameter(err.to_string())
    }
}

impl From<ConfigError> for InferenceError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidParameter(message) => Self::InvalidParameter(message),
            other => Self::InvalidParameter(other.to_string()),
        }
    }
}

impl InferenceError {
    /// Errors that only echo another worker's failure.
    fn is_secondary(&self) -> bool {
        matches!(self, Self::Coordination(CoordinationError::Aborted(_)))
    }
}

/// The root-cause failure among those reported by the workers.
fn primary_failure(mut failures: Vec<InferenceError>) -> Option<InferenceError> {
    if failures.is_empty() {
        return None;
    }
    let position = failures.iter().position(|e| !e.is_secondary()).unwrap_or(0);
    Some(failures.swap_remove(position))
}

/// Pre-aligned inputs of one run.
#[derive(Clone, Debug)]
pub struct InferenceInput {
    /// Genes by samples. Every gene is a regression target.
    pub expression: Arc<ExpressionMatrix>,
    pub regulators: Vec<String>,
    pub prior: Arc<PriorMatrix>,
}

impl InferenceInput {
    pub fn new(expression: ExpressionMatrix, regulators: Vec<String>, prior: PriorMatrix) -> Self {
        Self {
            expression: Arc::new(expression),
            regulators,
            prior: Arc::new(prior),
        }
    }
}

/// Per-run diagnostics for the logging layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunDiagnostics {
    pub bootstrap_wall_clock: Vec<Duration>,
    pub fitted: usize,
    pub no_candidates: usize,
    pub degenerate: usize,
    pub not_converged: usize,
    pub degenerate_targets: BTreeSet<String>,
    pub non_converged_targets: BTreeSet<String>,
}

impl RunDiagnostics {
    fn record(&mut self, matrices: &BootstrapMatrices, targets: &[String], elapsed: Duration) {
        self.bootstrap_wall_clock.push(elapsed);
        for (status, name) in matrices.statuses.iter().zip(targets) {
            match status {
                TargetStatus::Fitted => self.fitted += 1,
                TargetStatus::NoCandidates => self.no_candidates += 1,
                TargetStatus::Degenerate => {
                    self.degenerate += 1;
                    self.degenerate_targets.insert(name.clone());
                }
                TargetStatus::NotConverged => {
                    self.not_converged += 1;
                    self.non_converged_targets.insert(name.clone());
                }
            }
        }
    }

    pub fn total_wall_clock(&self) -> Duration {
        self.bootstrap_wall_clock.iter().sum()
    }
}

impl fmt::Display for RunDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bootstraps in {:.2}s; {} fitted, {} without candidates, {} degenerate ({} targets), {} not converged ({} targets)",
            self.bootstrap_wall_clock.len(),
            self.total_wall_clock().as_secs_f64(),
            self.fitted,
            self.no_candidates,
            self.degenerate,
            self.degenerate_targets.len(),
            self.not_converged,
            self.non_converged_targets.len()
        )
    }
}

#[derive(Clone, Debug)]
pub struct InferenceOutcome {
    pub network: ConsensusNetwork,
    pub diagnostics: RunDiagnostics,
    /// Prior edges kept out of fitting, when a holdout was configured.
    pub held_out_prior: Option<PriorMatrix>,
}

/// Bootstrap-scoped arena. Published once by the coordinator and dropped by every
/// worker when the bootstrap ends.
pub struct BootstrapScope {
    pub bootstrap: usize,
    /// Regulators by resampled samples.
    pub design: Array2<f64>,
    /// Targets by resampled samples.
    pub response: Array2<f64>,
    pub regulator_codes: DiscretizedRows,
    pub target_codes: DiscretizedRows,
    /// Regulators with zero variance in the resampled design.
    pub constant_regulators: Vec<bool>,
    mi_rows: ResultAccumulator<Array1<f64>>,
    results: ResultAccumulator<PerTargetResult>,
}

impl BootstrapScope {
    fn build(
        bootstrap: usize,
        indices: &BootstrapIndexSet,
        data: &DesignResponse,
        clusters: Option<&ClusterIndex>,
        association: &AssociationEngine,
    ) -> Self {
        let design = data.design.values().select(Axis(1), indices);
        let response = data.response.values().select(Axis(1), indices);
        let (regulator_codes, target_codes) = match clusters {
            Some(index) => {
                let resampled = index.resampled(indices);
                let design_bulk = rebulk(design.view(), &resampled);
                let response_bulk = rebulk(response.view(), &resampled);
                log::debug!(
                    "Bootstrap {bootstrap}: rebulked design {:?} and response {:?}",
                    design_bulk.dim(),
                    response_bulk.dim()
                );
                (
                    association.discretize(design_bulk.view()),
                    association.discretize(response_bulk.view()),
                )
            }
            None => (
                association.discretize(design.view()),
                association.discretize(response.view()),
            ),
        };
        let constant_regulators = design
            .axis_iter(Axis(0))
            .map(|row| standardize(row).is_none())
            .collect();
        Self {
            bootstrap,
            design,
            response,
            regulator_codes,
            target_codes,
            constant_regulators,
            mi_rows: ResultAccumulator::new(),
            results: ResultAccumulator::new(),
        }
    }

    fn assemble_association(&self) -> Result<AssociationMatrix, InferenceError> {
        let n_regulators = self.regulator_codes.nrows();
        let rows = self
            .mi_rows
            .take_ordered(n_regulators)
            .map_err(|unit| InferenceError::IncompleteBootstrap {
                bootstrap: self.bootstrap,
                stage: "mutual information",
                unit,
            })?;
        let mut raw = Array2::<f64>::zeros((n_regulators, self.target_codes.nrows()));
        for (mut out, row) in raw.axis_iter_mut(Axis(0)).zip(rows.iter()) {
            out.assign(row);
        }
        let corrected = background_correct(
            raw.view(),
            self.regulator_codes.constant_flags(),
            self.target_codes.constant_flags(),
        );
        Ok(AssociationMatrix { raw, corrected })
    }

    fn collect(&self) -> Result<BootstrapMatrices, InferenceError> {
        let n_regulators = self.design.nrows();
        let n_targets = self.response.nrows();
        let results = self
            .results
            .take_ordered(n_targets)
            .map_err(|unit| InferenceError::IncompleteBootstrap {
                bootstrap: self.bootstrap,
                stage: "regression",
                unit,
            })?;
        let mut coefficients = Array2::<f64>::zeros((n_regulators, n_targets));
        let mut contributions = Array2::<f64>::zeros((n_regulators, n_targets));
        let mut fit_quality = Array1::<f64>::zeros(n_targets);
        let mut statuses = Vec::with_capacity(n_targets);
        for result in results {
            let t = result.target;
            for ((&r, &beta), &share) in result
                .predictors
                .iter()
                .zip(&result.coefficients)
                .zip(&result.contributions)
            {
                coefficients[(r, t)] = beta;
                contributions[(r, t)] = share;
            }
            fit_quality[t] = result.fit_quality;
            statuses.push(result.status);
        }
        Ok(BootstrapMatrices {
            coefficients,
            contributions,
            fit_quality,
            statuses,
        })
    }
}

/// What the coordinator carries out of the bootstrap loop.
struct LeaderOutput {
    regulators: Vec<String>,
    targets: Vec<String>,
    bootstraps: Vec<BootstrapMatrices>,
    diagnostics: RunDiagnostics,
}

/// Read-only state shared by all workers of one run.
struct RunContext<'a> {
    store: &'a KvStore,
    /// The prior the run fits against, after any holdout.
    prior: &'a PriorMatrix,
    resamples: &'a [BootstrapIndexSet],
    seed: u64,
    association: AssociationEngine,
    regression: RegressionEngine,
}

/// Aborts the store if a worker unwinds, so the others do not wait for the timeout.
struct AbortOnPanic<'a> {
    store: &'a KvStore,
    rank: usize,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.store.abort(&format!("worker {} panicked", self.rank));
        }
    }
}

fn first_repeat(names: &[String]) -> Option<&String> {
    let mut seen = AHashSet::with_capacity(names.len());
    names.iter().find(|name| !seen.insert(name.as_str()))
}

pub struct InferenceEngine {
    input: InferenceInput,
    config: RunConfig,
}

impl InferenceEngine {
    pub fn new(input: InferenceInput, config: RunConfig) -> Result<Self, InferenceError> {
        config.validate()?;
        if input.regulators.is_empty() {
            return Err(InferenceError::InvalidParameter(
                "at least one regulator is required".into(),
            ));
        }
        if let Some(repeated) = first_repeat(&input.regulators) {
            return Err(InferenceError::InvalidParameter(format!(
                "regulator '{repeated}' is listed more than once"
            )));
        }
        Ok(Self { input, config })
    }

    /// Applies the configured prior holdout, drawn from the run seed.
    fn split_prior(&self, seed: u64) -> Result<Option<PriorSplit>, InferenceError> {
        let Some(holdout) = &self.config.prior_holdout else {
            return Ok(None);
        };
        if self.input.prior.is_empty() {
            log::warn!("A prior holdout was requested but the prior is empty; nothing is held out");
            return Ok(None);
        }
        let split = holdout
            .split(&self.input.prior, seed)
            .map_err(|err| InferenceError::InvalidParameter(err.to_string()))?;
        log::info!(
            "Held out {} of {} prior edges by {:?}",
            split.held_out.edge_count(),
            self.input.prior.edge_count(),
            holdout.axis
        );
        Ok(Some(split))
    }

    pub fn run(&self, bootstrap_count: usize, seed: u64) -> Result<InferenceOutcome, InferenceError> {
        self.run_with_progress(bootstrap_count, seed, &mut NoopInferenceProgress)
    }

    /// Runs every bootstrap and returns the consensus network, or the first fatal error.
    pub fn run_with_progress(
        &self,
        bootstrap_count: usize,
        seed: u64,
        observer: &mut dyn InferenceProgressObserver,
    ) -> Result<InferenceOutcome, InferenceError> {
        let resamples =
            Resampler::generate_many(self.input.expression.ncols(), bootstrap_count, seed)?;
        let split = self.split_prior(seed)?;
        let workers = self.config.workers;
        let store = KvStore::new(workers, self.config.coordination_timeout());
        let run = RunContext {
            store: &store,
            prior: split.as_ref().map_or(self.input.prior.as_ref(), |s| &s.fitting),
            resamples: &resamples,
            seed,
            association: AssociationEngine::new(self.config.bins, self.config.discretization),
            regression: RegressionEngine::new(
                self.config.regression.clone(),
                self.config.attribution,
            ),
        };
        log::info!(
            "Starting {bootstrap_count} bootstraps on {workers} workers with {} and {} MI bins",
            self.config.regression.describe(),
            run.association.bins()
        );
        observer.on_run_start(bootstrap_count);

        let (leader, others) = thread::scope(|scope| {
            let handles: Vec<_> = (1..workers)
                .map(|rank| {
                    let run = &run;
                    scope.spawn(move || self.guarded_work(run, rank, &mut NoopInferenceProgress))
                })
                .collect();
            let leader = self.guarded_work(&run, COORDINATOR_RANK, observer);
            let others: Vec<Result<Option<LeaderOutput>, InferenceError>> = handles
                .into_iter()
                .enumerate()
                .map(|(offset, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(InferenceError::WorkerPanicked(offset + 1)))
                })
                .collect();
            (leader, others)
        });

        let mut failures = Vec::new();
        let output = match leader {
            Ok(output) => output,
            Err(err) => {
                failures.push(err);
                None
            }
        };
        failures.extend(others.into_iter().filter_map(Result::err));
        if let Some(primary) = primary_failure(failures) {
            return Err(primary);
        }
        let output = output.ok_or_else(|| {
            InferenceError::Coordination(CoordinationError::Aborted(
                "coordinator finished without output".into(),
            ))
        })?;

        let aggregator = ConsensusAggregator::new(self.config.rank_basis);
        let network = aggregator.aggregate(output.regulators, output.targets, &output.bootstraps);
        observer.on_run_finish();
        log::info!("Run finished: {}", output.diagnostics);
        Ok(InferenceOutcome {
            network,
            diagnostics: output.diagnostics,
            held_out_prior: split.map(|s| s.held_out),
        })
    }

    fn guarded_work(
        &self,
        run: &RunContext<'_>,
        rank: usize,
        observer: &mut dyn InferenceProgressObserver,
    ) -> Result<Option<LeaderOutput>, InferenceError> {
        let guard = AbortOnPanic {
            store: run.store,
            rank,
        };
        let outcome = self.work(run, rank, observer);
        if let Err(err) = &outcome {
            if !err.is_secondary() {
                run.store.abort(&format!("worker {rank} failed: {err}"));
            }
        }
        drop(guard);
        outcome
    }

    fn cluster_cells(&self, seed: u64) -> Result<Option<ClusterIndex>, InferenceError> {
        let Some(config) = &self.config.pseudobulk else {
            return Ok(None);
        };
        let index = initial_clustering(self.input.expression.values(), config, seed)?;
        let sizes = cluster_sizes(&index);
        log::debug!(
            "Pseudobulk cluster sizes range from {} to {}",
            sizes.iter().min().copied().unwrap_or(0),
            sizes.iter().max().copied().unwrap_or(0)
        );
        Ok(Some(index))
    }

    fn design_response(
        &self,
        prior: &PriorMatrix,
        clusters: Option<&ClusterIndex>,
    ) -> Result<DesignResponse, InferenceError> {
        let expression = self.input.expression.as_ref();
        let regulators = &self.input.regulators;
        let design = match clusters {
            Some(index) => {
                let bulk = make_clusters_from_singles(expression, index, true)?;
                log::info!("Pseudobulk data matrix assembled {:?}", (bulk.nrows(), bulk.ncols()));
                let activity = self.config.activity.design(prior, &bulk, regulators)?;
                make_singles_from_clusters(&activity, index, expression.col_names())?
            }
            None => self.config.activity.design(prior, expression, regulators)?,
        };
        log::info!(
            "Design has {} regulators and response has {} targets over {} samples",
            design.nrows(),
            expression.nrows(),
            expression.ncols()
        );
        Ok(DesignResponse {
            design: Arc::new(design),
            response: Arc::clone(&self.input.expression),
        })
    }

    fn work(
        &self,
        run: &RunContext<'_>,
        rank: usize,
        observer: &mut dyn InferenceProgressObserver,
    ) -> Result<Option<LeaderOutput>, InferenceError> {
        let store = run.store;
        let leader = rank == COORDINATOR_RANK;
        let chunk_size = self.config.chunk_size;

        let clusters: Arc<Option<ClusterIndex>> =
            leader_publish(store, rank, CLUSTER_KEY, || self.cluster_cells(run.seed))?;
        let cluster_index = Option::as_ref(&clusters);
        let data: Arc<DesignResponse> =
            leader_publish(store, rank, DESIGN_KEY, || self.design_response(run.prior, cluster_index))?;
        let regulators = data.design.row_names();
        let targets = data.response.row_names();
        let mut output = leader.then(|| LeaderOutput {
            regulators: regulators.to_vec(),
            targets: targets.to_vec(),
            bootstraps: Vec::with_capacity(run.resamples.len()),
            diagnostics: RunDiagnostics::default(),
        });

        for (bootstrap, indices) in run.resamples.iter().enumerate() {
            let started = Instant::now();
            let scope: Arc<BootstrapScope> =
                leader_publish(store, rank, &format!("scope/{bootstrap}"), || {
                    Ok::<_, InferenceError>(BootstrapScope::build(
                        bootstrap,
                        indices,
                        &data,
                        cluster_index,
                        &run.association,
                    ))
                })?;

            if leader {
                log::info!("Bootstrap {}: calculating MI, background MI and CLR", bootstrap + 1);
                observer.on_stage_start(bootstrap, InferenceStage::Association, regulators.len());
            }
            let mi_key = format!("mi/{bootstrap}");
            for block in ChunkClaims::new(store, mi_key.as_str(), regulators.len(), chunk_size) {
                let rows = run.association.mutual_information_block(
                    &scope.regulator_codes,
                    &scope.target_codes,
                    block.clone(),
                );
                for (offset, row) in rows.axis_iter(Axis(0)).enumerate() {
                    scope.mi_rows.insert(block.start + offset, row.to_owned())?;
                }
            }
            store.barrier_with(ASSOCIATION_BARRIER, Wait::UntilAbort)?;
            let association: Arc<AssociationMatrix> =
                leader_publish(store, rank, &format!("association/{bootstrap}"), || {
                    scope.assemble_association()
                })?;

            if leader {
                observer.on_stage_finish(bootstrap, InferenceStage::Association);
                log::info!("Bootstrap {}: fitting {} targets", bootstrap + 1, targets.len());
                observer.on_stage_start(bootstrap, InferenceStage::Regression, targets.len());
            }
            let context = TargetContext {
                design: scope.design.view(),
                regulator_names: regulators,
                constant_regulators: &scope.constant_regulators,
                prior: run.prior,
                prior_weight: self.config.prior_weight,
            };
            let regression_key = format!("regression/{bootstrap}");
            for block in ChunkClaims::new(store, regression_key.as_str(), targets.len(), chunk_size) {
                let fitted: Vec<PerTargetResult> = block
                    .into_par_iter()
                    .map(|t| {
                        run.regression.fit_gene(
                            &context,
                            t,
                            &targets[t],
                            scope.response.row(t),
                            association.corrected.column(t),
                        )
                    })
                    .collect();
                for result in fitted {
                    scope.results.insert(result.target, result)?;
                }
            }
            store.barrier_with(REGRESSION_BARRIER, Wait::UntilAbort)?;

            if let Some(output) = output.as_mut() {
                let matrices = scope.collect()?;
                let elapsed = started.elapsed();
                let count = |status: TargetStatus| matrices.statuses.iter().filter(|s| **s == status).count();
                log::info!(
                    "Bootstrap {} finished in {:.2}s: {} degenerate, {} not converged",
                    bootstrap + 1,
                    elapsed.as_secs_f64(),
                    count(TargetStatus::Degenerate),
                    count(TargetStatus::NotConverged)
                );
                output.diagnostics.record(&matrices, targets, elapsed);
                output.bootstraps.push(matrices);
                store.reset_claims(&mi_key);
                store.reset_claims(&regression_key);
                observer.on_stage_finish(bootstrap, InferenceStage::Regression);
                observer.on_bootstrap_finish(bootstrap);
            }
            store.barrier(COLLECTED_BARRIER)?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holdout::{HoldoutAxis, PriorHoldout};
    use crate::regression::RegressionMethod;
    use crate::regression::elastic_net::ElasticNetConfig;
    use crate::types::LabeledMatrix;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn synthetic_input(genes: usize, samples: usize) -> InferenceInput {
        let mut rng = StdRng::seed_from_u64(11);
        let mut values = Array2::from_shape_fn((genes, samples), |_| rng.gen_range(0.0..10.0));
        for s in 0..samples {
            values[(0, s)] = 2.0 * values[(1, s)] + rng.gen_range(-0.5..0.5);
        }
        let names: Vec<String> = (1..=genes).map(|i| format!("G{i}")).collect();
        let columns = (1..=samples).map(|i| format!("S{i}")).collect();
        let expression = LabeledMatrix::new(values, names.clone(), columns).unwrap();
        InferenceInput::new(expression, names, PriorMatrix::empty())
    }

    fn config(workers: usize) -> RunConfig {
        RunConfig {
            workers,
            chunk_size: 3,
            coordination_timeout_secs: 30,
            ..RunConfig::default()
        }
    }

    #[test]
    fn worker_count_does_not_change_the_network() {
        let input = synthetic_input(12, 30);
        let single = InferenceEngine::new(input.clone(), config(1))
            .unwrap()
            .run(3, 5)
            .unwrap();
        let several = InferenceEngine::new(input, config(4))
            .unwrap()
            .run(3, 5)
            .unwrap();
        assert_eq!(single.network, several.network);
        assert_eq!(single.diagnostics.fitted, several.diagnostics.fitted);
        assert_eq!(single.diagnostics.bootstrap_wall_clock.len(), 3);
    }

    #[test]
    fn zero_bootstraps_is_an_invalid_parameter() {
        let engine = InferenceEngine::new(synthetic_input(4, 10), config(2)).unwrap();
        assert!(matches!(
            engine.run(0, 1),
            Err(InferenceError::InvalidParameter(_))
        ));
    }

    #[test]
    fn missing_regulators_are_rejected_up_front() {
        let mut input = synthetic_input(4, 10);
        input.regulators.clear();
        assert!(matches!(
            InferenceEngine::new(input, config(1)),
            Err(InferenceError::InvalidParameter(_))
        ));
    }

    #[test]
    fn leader_failure_aborts_every_worker() {
        // Regulators absent from both prior and expression leave no design.
        let mut input = synthetic_input(4, 10);
        input.regulators = vec!["TFX".to_string()];
        let engine = InferenceEngine::new(input, config(3)).unwrap();
        assert!(matches!(
            engine.run(2, 1),
            Err(InferenceError::InvalidParameter(ref message)) if message.contains("None of the 1 regulators")
        ));
    }

    #[test]
    fn repeated_regulator_is_rejected_up_front() {
        let mut input = synthetic_input(4, 10);
        input.regulators = vec!["G2".into(), "G2".into(), "G3".into()];
        assert!(matches!(
            InferenceEngine::new(input, config(2)),
            Err(InferenceError::InvalidParameter(ref message)) if message.contains("'G2'")
        ));
    }

    #[test]
    fn iteration_cap_marks_targets_not_converged_without_failing_the_run() {
        let mut settings = config(2);
        settings.regression = RegressionMethod::ElasticNet(ElasticNetConfig {
            max_iterations: 1,
            tolerance: 0.0,
            ..ElasticNetConfig::default()
        });
        let outcome = InferenceEngine::new(synthetic_input(6, 24), settings)
            .unwrap()
            .run(2, 4)
            .unwrap();
        let diagnostics = &outcome.diagnostics;
        assert_eq!(diagnostics.fitted, 0);
        assert!(diagnostics.not_converged > 0);
        assert!(diagnostics.non_converged_targets.contains("G1"));
        assert_eq!(
            diagnostics.fitted + diagnostics.no_candidates + diagnostics.degenerate + diagnostics.not_converged,
            6 * 2
        );
        let g1 = outcome.network.target_position("G1").unwrap();
        assert!(outcome.network.confidence.column(g1).iter().all(|&c| c == 0.0));
    }

    #[test]
    fn held_out_prior_edges_are_not_fitted_against() {
        let input = synthetic_input(8, 30);
        let regulators = input.regulators.clone();
        let values = Array2::from_shape_fn((8, 8), |(r, t)| if (r + t) % 3 == 0 && r != t { 1.0 } else { 0.0 });
        let prior = PriorMatrix::new(LabeledMatrix::new(values, regulators.clone(), regulators).unwrap());
        let input = InferenceInput {
            prior: Arc::new(prior.clone()),
            ..input
        };
        let mut settings = config(2);
        settings.prior_holdout = Some(PriorHoldout {
            ratio: 0.5,
            axis: HoldoutAxis::Edges,
        });
        let engine = InferenceEngine::new(input, settings).unwrap();
        let fitting = engine.split_prior(6).unwrap().unwrap().fitting;
        let outcome = engine.run(2, 6).unwrap();
        let held_out = outcome.held_out_prior.unwrap();
        assert_eq!(held_out.edge_count() + fitting.edge_count(), prior.edge_count());
        for regulator in held_out.matrix().row_names() {
            for target in held_out.matrix().col_names() {
                if held_out.weight(regulator, target) != 0.0 {
                    assert_eq!(fitting.weight(regulator, target), 0.0);
                }
            }
        }
    }

    #[test]
    fn pseudobulk_mode_runs_end_to_end() {
        let input = synthetic_input(8, 40);
        let mut settings = config(2);
        settings.pseudobulk = Some(crate::pseudobulk::PseudobulkConfig {
            clusters: 5,
            max_iterations: 20,
        });
        let outcome = InferenceEngine::new(input, settings).unwrap().run(2, 3).unwrap();
        assert_eq!(outcome.network.regulators.len(), 8);
        assert_eq!(outcome.network.targets.len(), 8);
        assert!(outcome.network.confidence.iter().all(|c| (0.0..=1.0).contains(c)));
    }
}
