use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use approx::assert_relative_eq;
use tc_calib::network::SCALARS_INPUT;
use tc_calib::pipeline::{CLF_SCORE, ENERGY_PRED, RATIO_CHARGED, RATIO_NEUTRAL};
use tc_calib::{
    ArtifactBundle, ArtifactManifest, BelowRangePolicy, CalibrationPipeline, EnergyBins,
    NetworkLoader, NetworkSpec, PipelineSettings, ScalerSharing, ScoreCaches,
};
use tc_core::{Error, Network, NetworkInputs, Result};
use tc_data::{CellImages, ClusterBranches, ClusterSample, ClusterTable, LOG_ENERGY};

fn tmp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("topocal_pipeline_{}_{}_{}", std::process::id(), nanos, name));
    std::fs::create_dir_all(&p).unwrap();
    p
}

/// Classifier that returns preset scores; regressors that return a constant.
struct Fixed {
    name: String,
    values: Vec<f64>,
}

impl Network for Fixed {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, inputs: &NetworkInputs) -> Result<Vec<f64>> {
        if self.values.len() == 1 {
            return Ok(vec![self.values[0]; inputs.batch]);
        }
        Ok(self.values[..inputs.batch].to_vec())
    }
}

struct FakeLoader {
    scores: Vec<f64>,
    loads: AtomicUsize,
}

impl FakeLoader {
    fn new(scores: Vec<f64>) -> Self {
        Self { scores, loads: AtomicUsize::new(0) }
    }
}

impl NetworkLoader for FakeLoader {
    fn load(&self, _path: &Path, spec: &NetworkSpec) -> Result<Arc<dyn Network>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let values = if spec.file.starts_with("clf") {
            self.scores.clone()
        } else if spec.file.contains("charged") {
            vec![2.0]
        } else {
            vec![0.5]
        };
        Ok(Arc::new(Fixed { name: spec.file.clone(), values }))
    }
}

struct FailingLoader;

impl NetworkLoader for FailingLoader {
    fn load(&self, path: &Path, _spec: &NetworkSpec) -> Result<Arc<dyn Network>> {
        Err(Error::NotImplemented(format!("no backend for {}", path.display())))
    }
}

/// Regressor that returns its first scaled scalar input.
struct Echo;

impl Network for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn predict(&self, inputs: &NetworkInputs) -> Result<Vec<f64>> {
        let t = inputs
            .tensors
            .iter()
            .find(|t| t.name == SCALARS_INPUT)
            .ok_or_else(|| Error::Validation("no scalar input".into()))?;
        let width = t.shape[1];
        Ok((0..inputs.batch).map(|b| t.data[b * width] as f64).collect())
    }
}

struct EchoLoader {
    scores: Vec<f64>,
}

impl NetworkLoader for EchoLoader {
    fn load(&self, _path: &Path, spec: &NetworkSpec) -> Result<Arc<dyn Network>> {
        if spec.file.starts_with("clf") {
            return Ok(Arc::new(Fixed { name: spec.file.clone(), values: self.scores.clone() }));
        }
        Ok(Arc::new(Echo))
    }
}

/// One bin; regressors read `logE` only. The charged scaler is the identity,
/// the neutral one maps `logE` to `(logE - 1) / 0.5`, the optional target
/// scaler inverts `y` to `0.5 * y + 0.1`.
fn write_echo_artifacts(dir: &Path, target_encoding: &str, with_target_scalers: bool) -> PathBuf {
    for f in ["clf.onnx", "reg_charged_bin0.onnx", "reg_neutral_bin0.onnx"] {
        std::fs::write(dir.join(f), f.as_bytes()).unwrap();
    }
    let scaler = |mean: f64, scale: f64, feature: &str| {
        serde_json::json!({
            "bin": "bin0",
            "feature_names": [feature],
            "transforms": [{ "kind": "standard", "mean": mean, "scale": scale }]
        })
        .to_string()
    };
    std::fs::write(dir.join("scaler_bin0.json"), scaler(0.0, 1.0, "logE")).unwrap();
    std::fs::write(dir.join("scaler_neutral_bin0.json"), scaler(1.0, 0.5, "logE")).unwrap();
    std::fs::write(dir.join("target_bin0.json"), scaler(0.1, 0.5, "calib_ratio")).unwrap();

    let reg = |class: &str| serde_json::json!([{ "file": format!("reg_{class}_bin0.onnx"), "scalars": ["logE"] }]);
    let mut manifest = serde_json::json!({
        "schema_version": "topocal_models_v0",
        "classifier": { "file": "clf.onnx" },
        "scalers": ["scaler_bin0.json"],
        "scalers_neutral": ["scaler_neutral_bin0.json"],
        "regressors": { "charged": reg("charged"), "neutral": reg("neutral") },
        "target_encoding": target_encoding
    });
    if with_target_scalers {
        manifest["target_scalers"] = serde_json::json!(["target_bin0.json"]);
    }
    let path = dir.join("models.json");
    std::fs::write(&path, serde_json::to_string_pretty(&manifest).unwrap()).unwrap();
    path
}

fn write_artifacts(dir: &Path) -> PathBuf {
    let files = ["clf.onnx", "reg_charged_bin0.onnx", "reg_charged_bin1.onnx", "reg_charged_bin2.onnx"]
        .into_iter()
        .chain(["reg_neutral_bin0.onnx", "reg_neutral_bin1.onnx", "reg_neutral_bin2.onnx"]);
    for f in files {
        std::fs::write(dir.join(f), f.as_bytes()).unwrap();
    }
    for i in 0..3 {
        let scaler = serde_json::json!({
            "bin": format!("bin{i}"),
            "feature_names": ["logE", "abs_eta"],
            "transforms": [
                { "kind": "standard", "mean": 0.0, "scale": 1.0 },
                { "kind": "identity" }
            ]
        });
        std::fs::write(dir.join(format!("scaler_bin{i}.json")), scaler.to_string()).unwrap();
    }
    let reg = |class: &str, i: usize| {
        serde_json::json!({ "file": format!("reg_{class}_bin{i}.onnx"), "scalars": ["logE", "abs_eta"] })
    };
    let manifest = serde_json::json!({
        "schema_version": "topocal_models_v0",
        "classifier": { "file": "clf.onnx", "scalars": ["logE", "abs_eta"], "output_column": 0 },
        "scalers": ["scaler_bin0.json", "scaler_bin1.json", "scaler_bin2.json"],
        "regressors": {
            "charged": [reg("charged", 0), reg("charged", 1), reg("charged", 2)],
            "neutral": [reg("neutral", 0), reg("neutral", 1), reg("neutral", 2)]
        },
        "target_encoding": "ratio"
    });
    let path = dir.join("models.json");
    std::fs::write(&path, serde_json::to_string_pretty(&manifest).unwrap()).unwrap();
    path
}

fn sample(energies: &[f64]) -> ClusterSample {
    let b = ClusterBranches::default();
    let n = energies.len();
    let table = ClusterTable::from_columns(
        vec![0; n],
        vec![
            (b.energy.clone(), energies.to_vec()),
            (b.eta.clone(), vec![0.3; n]),
            (b.phi.clone(), vec![0.0; n]),
        ],
    )
    .unwrap();
    ClusterSample::new(table, CellImages::empty(n)).unwrap()
}

fn settings(bins: &EnergyBins, below_range: BelowRangePolicy) -> PipelineSettings {
    PipelineSettings {
        bins: bins.clone(),
        threshold: 0.5,
        below_range,
        branches: ClusterBranches::default(),
    }
}

#[test]
fn reference_scenario_selects_charged_for_high_scores() {
    let dir = tmp_dir("reference");
    let manifest_path = write_artifacts(&dir);
    let bins = EnergyBins::new(vec![0.0, 1.0, 10.0]).unwrap();
    let bundle = ArtifactBundle::open(&manifest_path, &bins, &[], ScalerSharing::Shared).unwrap();

    let loader = FakeLoader::new(vec![0.9, 0.3, 0.6]);
    let pipeline =
        CalibrationPipeline::new(&bundle, settings(&bins, BelowRangePolicy::PassThrough), &loader)
            .unwrap();
    let out = pipeline.run(&sample(&[0.5, 2.0, 15.0])).unwrap();

    assert_eq!(out.assignment.rows(0), &[0]);
    assert_eq!(out.assignment.rows(1), &[1]);
    assert_eq!(out.assignment.rows(2), &[2]);

    let t = out.sample.table();
    assert_eq!(t.column(CLF_SCORE).unwrap(), &[0.9, 0.3, 0.6]);
    assert_eq!(t.column(RATIO_CHARGED).unwrap(), &[2.0, 2.0, 2.0]);
    assert_eq!(t.column(RATIO_NEUTRAL).unwrap(), &[0.5, 0.5, 0.5]);
    let pred = t.column(ENERGY_PRED).unwrap();
    assert_relative_eq!(pred[0], 1.0); // charged: 2.0 * 0.5
    assert_relative_eq!(pred[1], 1.0); // neutral: 0.5 * 2.0
    assert_relative_eq!(pred[2], 30.0); // charged: 2.0 * 15.0
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn warm_caches_skip_network_loading() {
    let dir = tmp_dir("warm");
    let manifest_path = write_artifacts(&dir);
    let bins = EnergyBins::new(vec![0.0, 1.0, 10.0]).unwrap();
    let bundle = ArtifactBundle::open(&manifest_path, &bins, &[], ScalerSharing::Shared).unwrap();
    let tags = bundle.cache_tags(&bins, &ClusterBranches::default()).unwrap();
    let cache_dir = dir.join("cache");
    let input = sample(&[0.5, 2.0, 15.0]);

    let loader = FakeLoader::new(vec![0.9, 0.3, 0.6]);
    let first = CalibrationPipeline::new(&bundle, settings(&bins, BelowRangePolicy::PassThrough), &loader)
        .unwrap()
        .with_caches(ScoreCaches::in_dir(&cache_dir, &tags))
        .run(&input)
        .unwrap();
    assert_eq!(loader.loads.load(Ordering::SeqCst), 7);
    assert!(cache_dir.join("classification.parquet").exists());
    assert!(cache_dir.join("regression.parquet").exists());

    let second = CalibrationPipeline::new(&bundle, settings(&bins, BelowRangePolicy::PassThrough), &FailingLoader)
        .unwrap()
        .with_caches(ScoreCaches::in_dir(&cache_dir, &tags))
        .run(&input)
        .unwrap();
    assert_eq!(
        first.sample.table().column(ENERGY_PRED),
        second.sample.table().column(ENERGY_PRED)
    );

    // a retrained regressor invalidates only the regression cache
    std::fs::write(dir.join("reg_neutral_bin2.onnx"), b"retrained").unwrap();
    let new_tags = bundle.cache_tags(&bins, &ClusterBranches::default()).unwrap();
    let err = CalibrationPipeline::new(&bundle, settings(&bins, BelowRangePolicy::PassThrough), &FailingLoader)
        .unwrap()
        .with_caches(ScoreCaches::in_dir(&cache_dir, &new_tags))
        .run(&input);
    assert!(matches!(err, Err(Error::NotImplemented(_))));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn below_range_policies() {
    let dir = tmp_dir("below");
    let manifest_path = write_artifacts(&dir);
    let bins = EnergyBins::new(vec![1.0, 5.0, 10.0]).unwrap();
    let bundle = ArtifactBundle::open(&manifest_path, &bins, &[], ScalerSharing::Shared).unwrap();
    let input = sample(&[0.5, 2.0, 15.0]);

    let loader = FakeLoader::new(vec![0.9, 0.3, 0.6]);
    let kept = CalibrationPipeline::new(&bundle, settings(&bins, BelowRangePolicy::PassThrough), &loader)
        .unwrap()
        .run(&input)
        .unwrap();
    assert_eq!(kept.n_dropped, 0);
    assert_eq!(kept.sample.n_rows(), 3);
    assert_eq!(kept.sample.table().column(ENERGY_PRED).unwrap()[0], 0.5);
    assert_eq!(kept.sample.table().column(RATIO_CHARGED).unwrap()[0], 1.0);

    let dropped = CalibrationPipeline::new(&bundle, settings(&bins, BelowRangePolicy::Drop), &loader)
        .unwrap()
        .run(&input)
        .unwrap();
    assert_eq!(dropped.n_dropped, 1);
    assert_eq!(dropped.sample.table().column("clusterE").unwrap(), &[2.0, 15.0]);
    assert_eq!(dropped.sample.table().column(ENERGY_PRED).unwrap(), &[1.0, 30.0]);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn mismatched_artifacts_abort_before_any_network_is_loaded() {
    let dir = tmp_dir("mismatch");
    let manifest_path = write_artifacts(&dir);
    let mut manifest = ArtifactManifest::from_path(&manifest_path).unwrap();
    manifest.regressors.neutral.swap(0, 1);
    std::fs::write(&manifest_path, serde_json::to_string(&manifest).unwrap()).unwrap();

    let bins = EnergyBins::new(vec![0.0, 1.0, 10.0]).unwrap();
    let result = ArtifactBundle::open(&manifest_path, &bins, &[], ScalerSharing::Shared);
    assert!(matches!(result, Err(Error::Consistency(_))));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn zero_and_negative_energies_do_not_abort_the_run() {
    let dir = tmp_dir("nonpositive");
    let manifest_path = write_artifacts(&dir);
    let bins = EnergyBins::new(vec![0.0, 1.0, 10.0]).unwrap();
    let bundle = ArtifactBundle::open(&manifest_path, &bins, &[], ScalerSharing::Shared).unwrap();
    let input = sample(&[0.0, -0.3, 2.0, 15.0]);
    let loader = FakeLoader::new(vec![0.9, 0.3, 0.6, 0.7]);

    let kept = CalibrationPipeline::new(&bundle, settings(&bins, BelowRangePolicy::PassThrough), &loader)
        .unwrap()
        .run(&input)
        .unwrap();
    // zero energy sits on the first edge, negative energy is below it
    assert_eq!(kept.assignment.rows(0), &[0]);
    assert_eq!(kept.assignment.unassigned(), &[1]);
    let t = kept.sample.table();
    assert!(t.column(LOG_ENERGY).unwrap()[0].is_nan());
    assert_eq!(t.column(RATIO_CHARGED).unwrap(), &[1.0, 1.0, 2.0, 2.0]);
    assert_eq!(t.column(RATIO_NEUTRAL).unwrap(), &[1.0, 1.0, 0.5, 0.5]);
    assert_eq!(t.column(ENERGY_PRED).unwrap(), &[0.0, -0.3, 4.0, 30.0]);

    let dropped = CalibrationPipeline::new(&bundle, settings(&bins, BelowRangePolicy::Drop), &loader)
        .unwrap()
        .run(&input)
        .unwrap();
    assert_eq!(dropped.n_dropped, 1);
    assert_eq!(dropped.sample.table().column("clusterE").unwrap(), &[0.0, 2.0, 15.0]);
    assert_eq!(dropped.sample.table().column(ENERGY_PRED).unwrap(), &[0.0, 4.0, 30.0]);

    let raised = EnergyBins::new(vec![1.0, 5.0, 10.0]).unwrap();
    let out = CalibrationPipeline::new(&bundle, settings(&raised, BelowRangePolicy::PassThrough), &loader)
        .unwrap()
        .run(&sample(&[-0.3, 2.0, 15.0]))
        .unwrap();
    assert_eq!(out.sample.table().column(ENERGY_PRED).unwrap()[0], -0.3);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn per_class_sharing_feeds_neutral_scaled_inputs() {
    let dir = tmp_dir("per_class");
    let manifest_path = write_echo_artifacts(&dir, "ratio", false);
    let bins = EnergyBins::new(vec![1.0]).unwrap();
    let e = std::f64::consts::E;
    let input = sample(&[e, e * e]);
    let loader = EchoLoader { scores: vec![0.9, 0.2] };

    let bundle = ArtifactBundle::open(&manifest_path, &bins, &[], ScalerSharing::PerClass).unwrap();
    let out = CalibrationPipeline::new(&bundle, settings(&bins, BelowRangePolicy::PassThrough), &loader)
        .unwrap()
        .run(&input)
        .unwrap();
    let t = out.sample.table();
    let (charged, neutral) = (t.column(RATIO_CHARGED).unwrap(), t.column(RATIO_NEUTRAL).unwrap());
    assert_relative_eq!(charged[0], 1.0, epsilon = 1e-6);
    assert_relative_eq!(charged[1], 2.0, epsilon = 1e-6);
    assert_relative_eq!(neutral[0], 0.0, epsilon = 1e-6);
    assert_relative_eq!(neutral[1], 2.0, epsilon = 1e-6);
    let pred = t.column(ENERGY_PRED).unwrap();
    assert_relative_eq!(pred[0], e, epsilon = 1e-5);
    assert_relative_eq!(pred[1], 2.0 * e * e, epsilon = 1e-5);

    // shared sharing ignores the neutral list
    let shared = ArtifactBundle::open(&manifest_path, &bins, &[], ScalerSharing::Shared).unwrap();
    let out = CalibrationPipeline::new(&shared, settings(&bins, BelowRangePolicy::PassThrough), &loader)
        .unwrap()
        .run(&input)
        .unwrap();
    let neutral = out.sample.table().column(RATIO_NEUTRAL).unwrap();
    assert_relative_eq!(neutral[0], 1.0, epsilon = 1e-6);
    assert_relative_eq!(neutral[1], 2.0, epsilon = 1e-6);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn target_scalers_and_log_ratio_decode_regressor_outputs() {
    let dir = tmp_dir("target");
    let manifest_path = write_echo_artifacts(&dir, "log_ratio", true);
    let bins = EnergyBins::new(vec![1.0]).unwrap();
    let bundle = ArtifactBundle::open(&manifest_path, &bins, &[], ScalerSharing::Shared).unwrap();
    assert!(bundle.target_scalers().is_some());

    let e = std::f64::consts::E;
    let loader = EchoLoader { scores: vec![0.9, 0.2] };
    let out = CalibrationPipeline::new(&bundle, settings(&bins, BelowRangePolicy::PassThrough), &loader)
        .unwrap()
        .run(&sample(&[e, e * e]))
        .unwrap();
    let t = out.sample.table();
    for column in [RATIO_CHARGED, RATIO_NEUTRAL] {
        let ratios = t.column(column).unwrap();
        assert_relative_eq!(ratios[0], (0.5 * 1.0 + 0.1f64).exp(), epsilon = 1e-6);
        assert_relative_eq!(ratios[1], (0.5 * 2.0 + 0.1f64).exp(), epsilon = 1e-6);
    }
    let pred = t.column(ENERGY_PRED).unwrap();
    assert_relative_eq!(pred[0], 0.6f64.exp() * e, epsilon = 1e-5);
    assert_relative_eq!(pred[1], 1.1f64.exp() * e * e, epsilon = 1e-5);
    std::fs::remove_dir_all(&dir).ok();
}
