use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use regulon::activity::ActivityMethod;
use regulon::config::RunConfig;
use regulon::regression::RegressionMethod;
use regulon::regression::elastic_net::ElasticNetConfig;
use regulon::shared::files::{read_expression, read_regulators, write_network};
use regulon::types::{LabeledMatrix, PriorMatrix};
use regulon::workflow::{InferenceEngine, InferenceInput, InferenceOutcome};
use std::fs;
use std::io::Write;

const GENES: usize = 100;
const SAMPLES: usize = 50;

fn gene_names() -> Vec<String> {
    (1..=GENES).map(|i| format!("G{i}")).collect()
}

/// Independent standard normal genes, except `G1 = 2 * G2 + noise` and a constant `G100`.
fn synthetic_expression(seed: u64) -> LabeledMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let noise = Normal::new(0.0, 0.3).unwrap();
    let mut values = Array2::from_shape_fn((GENES, SAMPLES), |_| normal.sample(&mut rng));
    for s in 0..SAMPLES {
        values[(0, s)] = 2.0 * values[(1, s)] + noise.sample(&mut rng);
        values[(GENES - 1, s)] = 4.2;
    }
    let samples = (1..=SAMPLES).map(|i| format!("S{i}")).collect();
    LabeledMatrix::new(values, gene_names(), samples).unwrap()
}

fn config() -> RunConfig {
    RunConfig {
        workers: 4,
        activity: ActivityMethod::Expression,
        coordination_timeout_secs: 120,
        ..RunConfig::default()
    }
}

fn run(config: RunConfig) -> InferenceOutcome {
    let input = InferenceInput::new(synthetic_expression(1), gene_names(), PriorMatrix::empty());
    InferenceEngine::new(input, config).unwrap().run(5, 1).unwrap()
}

fn assert_driver_ranks_first(outcome: &InferenceOutcome) {
    let into_g1 = outcome.network.edges_into("G1");
    assert_eq!(into_g1.len(), GENES - 1);
    assert_eq!(into_g1[0].regulator, "G2");
    assert_eq!(into_g1[0].sign, 1);
    assert!(into_g1[0].coefficient > 0.0);

    let mut confidences: Vec<f64> = into_g1.iter().map(|e| e.confidence).collect();
    confidences.sort_by(f64::total_cmp);
    let median = confidences[confidences.len() / 2];
    assert!(into_g1[0].confidence > median);
}

#[test]
fn noisy_linear_driver_is_the_top_edge() {
    let outcome = run(config());
    assert_driver_ranks_first(&outcome);
    assert_eq!(outcome.diagnostics.bootstrap_wall_clock.len(), 5);
}

#[test]
fn elastic_net_recovers_the_same_driver() {
    let outcome = run(RunConfig {
        regression: RegressionMethod::ElasticNet(ElasticNetConfig::default()),
        ..config()
    });
    assert_driver_ranks_first(&outcome);
}

#[test]
fn constant_target_is_degenerate_but_the_run_completes() {
    let outcome = run(config());
    let network = &outcome.network;
    let target = network.target_position("G100").unwrap();
    assert!(network.confidence.column(target).iter().all(|&c| c == 0.0));
    assert_eq!(network.fit_quality[target], 0.0);

    // A constant regulator never enters a model either.
    let regulator = network.regulator_position("G100").unwrap();
    assert!(network.confidence.row(regulator).iter().all(|&c| c == 0.0));

    assert!(outcome.diagnostics.degenerate_targets.contains("G100"));
    assert_eq!(outcome.diagnostics.degenerate_targets.len(), 1);
    assert_eq!(outcome.diagnostics.degenerate, 5);
    assert!(outcome.diagnostics.fitted > 0);
}

#[test]
fn tables_on_disk_run_through_to_an_edge_list() {
    let dir = tempfile::tempdir().unwrap();
    let expression = synthetic_expression(2);

    let expression_path = dir.path().join("expression.tsv");
    let mut file = fs::File::create(&expression_path).unwrap();
    writeln!(file, "\t{}", expression.col_names().join("\t")).unwrap();
    for (g, gene) in expression.row_names().iter().enumerate() {
        let row: Vec<String> = expression.row(g).iter().map(|v| v.to_string()).collect();
        writeln!(file, "{gene}\t{}", row.join("\t")).unwrap();
    }
    drop(file);
    let regulators_path = dir.path().join("regulators.txt");
    fs::write(&regulators_path, "G1\nG2\nG3\nG4\nG5\n").unwrap();

    let loaded = read_expression(&expression_path, false).unwrap();
    assert_eq!(loaded.values(), expression.values());
    let regulators = read_regulators(&regulators_path).unwrap();

    let engine = InferenceEngine::new(
        InferenceInput::new(loaded, regulators, PriorMatrix::empty()),
        RunConfig {
            workers: 2,
            ..config()
        },
    )
    .unwrap();
    let outcome = engine.run(2, 9).unwrap();
    let network_path = dir.path().join("network.tsv");
    let written = write_network(&network_path, &outcome.network).unwrap();
    // Self pairs G1..G5 are never listed.
    assert_eq!(written, 5 * GENES - 5);
    let text = fs::read_to_string(&network_path).unwrap();
    assert_eq!(text.lines().count(), written + 1);
    assert!(text.starts_with("regulator\ttarget\tconfidence\tsign\tcoefficient\tcontribution"));
}
