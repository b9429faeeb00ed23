use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tc_calib::pipeline::ENERGY_PRED;
use tc_calib::{
    ArtifactBundle, BelowRangePolicy, CalibrationPipeline, EnergyBins, NetworkLoader, NetworkSpec,
    PipelineSettings, ScalerSharing, ScoreCaches,
};
use tc_core::{Network, NetworkInputs, Result};
use tc_data::{
    CellImages, ClusterBranches, ClusterSample, ClusterTable, read_cluster_parquet,
    write_cluster_parquet,
};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_topocal"))
}

fn tmp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("topocal_cli_{}_{}_{}", std::process::id(), nanos, name));
    std::fs::create_dir_all(&p).unwrap();
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

struct Fixed(Vec<f64>);

impl Network for Fixed {
    fn name(&self) -> &str {
        "fixed"
    }

    fn predict(&self, inputs: &NetworkInputs) -> Result<Vec<f64>> {
        if self.0.len() == 1 {
            return Ok(vec![self.0[0]; inputs.batch]);
        }
        Ok(self.0[..inputs.batch].to_vec())
    }
}

/// Classifier scores `[0.9, 0.3, 0.6]`, charged ratio 2, neutral ratio 0.5.
struct FakeLoader;

impl NetworkLoader for FakeLoader {
    fn load(&self, _path: &Path, spec: &NetworkSpec) -> Result<Arc<dyn Network>> {
        let values = if spec.file.starts_with("clf") {
            vec![0.9, 0.3, 0.6]
        } else if spec.file.contains("charged") {
            vec![2.0]
        } else {
            vec![0.5]
        };
        Ok(Arc::new(Fixed(values)))
    }
}

/// Clusters, model artifacts and a config under `dir`; returns the config path.
fn write_fixture(dir: &Path, extra_paths: &str) -> PathBuf {
    let b = ClusterBranches::default();
    let table = ClusterTable::from_columns(
        vec![0, 0, 1],
        vec![
            (b.energy.clone(), vec![0.5, 2.0, 15.0]),
            (b.eta.clone(), vec![0.3, 0.3, 0.3]),
            (b.phi.clone(), vec![0.0, 0.1, 2.0]),
        ],
    )
    .unwrap();
    let sample = ClusterSample::new(table, CellImages::empty(3)).unwrap();
    write_cluster_parquet(&sample, &b.event, &dir.join("clusters.parquet")).unwrap();

    let models = dir.join("models");
    std::fs::create_dir_all(&models).unwrap();
    for class in ["charged", "neutral"] {
        for i in 0..3 {
            let f = format!("reg_{class}_bin{i}.onnx");
            std::fs::write(models.join(&f), f.as_bytes()).unwrap();
        }
    }
    std::fs::write(models.join("clf.onnx"), b"clf").unwrap();
    for i in 0..3 {
        let scaler = serde_json::json!({
            "bin": format!("bin{i}"),
            "feature_names": ["logE", "abs_eta"],
            "transforms": [{ "kind": "standard", "mean": 0.0, "scale": 1.0 }, { "kind": "identity" }]
        });
        std::fs::write(models.join(format!("scaler_bin{i}.json")), scaler.to_string()).unwrap();
    }
    let reg = |class: &str, i: usize| {
        serde_json::json!({ "file": format!("reg_{class}_bin{i}.onnx"), "scalars": ["logE", "abs_eta"] })
    };
    let manifest = serde_json::json!({
        "schema_version": "topocal_models_v0",
        "classifier": { "file": "clf.onnx", "scalars": ["logE", "abs_eta"] },
        "scalers": ["scaler_bin0.json", "scaler_bin1.json", "scaler_bin2.json"],
        "regressors": {
            "charged": [reg("charged", 0), reg("charged", 1), reg("charged", 2)],
            "neutral": [reg("neutral", 0), reg("neutral", 1), reg("neutral", 2)]
        }
    });
    std::fs::write(models.join("models.json"), manifest.to_string()).unwrap();

    let config = dir.join("analysis.yaml");
    let yaml = format!(
        r#"schema_version: topocal_analysis_v0
layers: []
bin_edges: [0.0, 1.0, 10.0]
threshold: 0.5
paths:
  clusters: clusters.parquet
  manifest: models/models.json
  cache_dir: cache
  output: out/calibrated.parquet
{extra_paths}"#
    );
    std::fs::write(&config, yaml).unwrap();
    config
}

/// Fill the score caches the way an earlier run with real networks would have.
fn warm_caches(dir: &Path) {
    let bins = EnergyBins::new(vec![0.0, 1.0, 10.0]).unwrap();
    let bundle =
        ArtifactBundle::open(&dir.join("models/models.json"), &bins, &[], ScalerSharing::Shared)
            .unwrap();
    let tags = bundle.cache_tags(&bins, &ClusterBranches::default()).unwrap();
    let settings = PipelineSettings {
        bins,
        threshold: 0.5,
        below_range: BelowRangePolicy::PassThrough,
        branches: ClusterBranches::default(),
    };
    let sample =
        read_cluster_parquet(&dir.join("clusters.parquet"), &ClusterBranches::default(), &[])
            .unwrap();
    CalibrationPipeline::new(&bundle, settings, &FakeLoader)
        .unwrap()
        .with_caches(ScoreCaches::in_dir(&dir.join("cache"), &tags))
        .run(&sample)
        .unwrap();
}

#[test]
fn run_with_warm_caches_writes_calibrated_clusters() {
    let dir = tmp_dir("warm");
    let config = write_fixture(&dir, "");
    warm_caches(&dir);

    let out = run(&["run", "--config", config.to_string_lossy().as_ref()]);
    assert!(out.status.success(), "run failed, stderr={}", String::from_utf8_lossy(&out.stderr));

    let summary: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(summary["clusters_in"], 3);
    assert_eq!(summary["per_bin"]["bin0"], 1);
    assert_eq!(summary["per_bin"]["bin2"], 1);
    assert_eq!(summary["charged"], 2);
    assert_eq!(summary["calibrated_energy_sum"].as_f64().unwrap(), 32.0);

    let calibrated = read_cluster_parquet(
        &dir.join("out/calibrated.parquet"),
        &ClusterBranches::default(),
        &[],
    )
    .unwrap();
    assert_eq!(calibrated.table().column(ENERGY_PRED).unwrap(), &[1.0, 1.0, 30.0]);
    assert_eq!(calibrated.table().events(), &[0, 0, 1]);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn run_logs_the_cache_directory_and_row_count() {
    let dir = tmp_dir("cache_log");
    let config = write_fixture(&dir, "");
    warm_caches(&dir);
    let summary = dir.join("summary.json");

    let out = run(&[
        "--log-level",
        "info",
        "run",
        "--config",
        config.to_string_lossy().as_ref(),
        "--output",
        summary.to_string_lossy().as_ref(),
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let log = format!("{}{}", String::from_utf8_lossy(&out.stdout), String::from_utf8_lossy(&out.stderr));
    assert!(log.contains("using score caches"), "log={log}");
    assert!(log.contains("score cache hit"), "log={log}");
    let v: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&summary).unwrap()).unwrap();
    assert_eq!(v["clusters_in"], 3);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn inspect_cache_reports_tag_and_freshness() {
    let dir = tmp_dir("inspect");
    let config = write_fixture(&dir, "");
    warm_caches(&dir);

    let cache = dir.join("cache/regression.parquet");
    let out = run(&[
        "inspect-cache",
        "--input",
        cache.to_string_lossy().as_ref(),
        "--config",
        config.to_string_lossy().as_ref(),
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["schema_version"], "topocal_scores_v1");
    assert_eq!(v["rows"], 3);
    assert_eq!(v["keys"], serde_json::json!(["charged", "neutral"]));
    assert_eq!(v["fresh_for"], "regression");

    // retraining one regressor makes the regression cache stale
    std::fs::write(dir.join("models/reg_neutral_bin1.onnx"), b"retrained").unwrap();
    let out = run(&[
        "inspect-cache",
        "--input",
        cache.to_string_lossy().as_ref(),
        "--config",
        config.to_string_lossy().as_ref(),
    ]);
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["fresh_for"], "stale");

    let _ = std::fs::remove_dir_all(&dir);
}

#[cfg(not(feature = "neural"))]
#[test]
fn run_with_cold_caches_needs_the_inference_backend() {
    let dir = tmp_dir("cold");
    let config = write_fixture(&dir, "");

    let out = run(&["run", "--config", config.to_string_lossy().as_ref()]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("neural"), "stderr={stderr}");
    assert!(!dir.join("out/calibrated.parquet").exists());

    let _ = std::fs::remove_dir_all(&dir);
}

#[cfg(not(feature = "jetty"))]
#[test]
fn jet_study_needs_the_clustering_backend() {
    let dir = tmp_dir("nojetty");
    let config = write_fixture(&dir, "  jets: jets.parquet\n");
    warm_caches(&dir);

    let out = run(&["run", "--config", config.to_string_lossy().as_ref()]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("jetty"), "stderr={stderr}");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn route_counts_clusters_per_bin() {
    let dir = tmp_dir("route");
    let config = write_fixture(&dir, "");

    let out = run(&["route", "--config", config.to_string_lossy().as_ref()]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["clusters"], 3);
    assert_eq!(v["below_range"], 0);
    let counts: Vec<u64> =
        v["bins"].as_array().unwrap().iter().map(|b| b["clusters"].as_u64().unwrap()).collect();
    assert_eq!(counts, vec![1, 1, 1]);
    assert_eq!(v["bins"][1]["lower_edge"], 1.0);

    let _ = std::fs::remove_dir_all(&dir);
}
