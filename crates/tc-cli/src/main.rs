//! topocal CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use tc_calib::pipeline::{CLF_SCORE, ENERGY_PRED};
use tc_calib::{ArtifactBundle, CalibrationPipeline, OnnxLoader, ScoreCaches, read_scores};
use tc_data::{ClusterSample, JetCollection, read_cluster_parquet, read_jet_parquet, write_cluster_parquet};
use tc_jets::{StudyReport, anti_kt, cluster_events, constituents_by_event, run_study};

mod config;

use config::{AnalysisConfig, read_config};

/// Jets clustered from calibrated cluster energies.
const CALIBRATED_JETS: &str = "TopoCalJets";
/// Jets clustered from uncalibrated cluster energies.
const RAW_JETS: &str = "RawTopoJets";

#[derive(Parser)]
#[command(name = "topocal")]
#[command(about = "topocal - ML energy calibration of calorimeter topo-clusters")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate clusters and, with a reference jet file, run the jet study
    Run {
        /// Analysis config (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        config: PathBuf,

        /// Only calibrate the first N selected clusters.
        #[arg(long)]
        max_clusters: Option<usize>,

        /// Output file for the run summary (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads for artifact loading (0 = auto).
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Check scaler/regressor/bin-edge consistency and print cache tags
    ValidateArtifacts {
        /// Analysis config (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the metadata and columns of a score cache file
    InspectCache {
        /// Score cache Parquet file
        #[arg(short, long)]
        input: PathBuf,

        /// Analysis config; reports whether the cache is fresh for its artifacts.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Count clusters per energy bin
    Route {
        /// Analysis config (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        config: PathBuf,

        /// Cluster file to route instead of `paths.clusters`.
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Print version
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Run { config, max_clusters, output, threads } => {
            cmd_run(&config, max_clusters, output.as_ref(), threads)
        }
        Commands::ValidateArtifacts { config } => cmd_validate_artifacts(&config),
        Commands::InspectCache { input, config } => cmd_inspect_cache(&input, config.as_ref()),
        Commands::Route { config, input } => cmd_route(&config, input.as_ref()),
        Commands::Version => {
            println!("topocal {}", tc_core::VERSION);
            Ok(())
        }
    }
}

fn open_bundle(cfg: &AnalysisConfig) -> Result<ArtifactBundle> {
    Ok(ArtifactBundle::open(&cfg.paths.manifest, &cfg.bin_edges, &cfg.layers, cfg.scaler_sharing)?)
}

fn load_clusters(cfg: &AnalysisConfig, path: &Path) -> Result<ClusterSample> {
    let sample = read_cluster_parquet(path, &cfg.branches, &cfg.layers)?;
    Ok(cfg.selection.apply(&sample, &cfg.branches)?)
}

fn cmd_run(
    config: &Path,
    max_clusters: Option<usize>,
    output: Option<&PathBuf>,
    threads: usize,
) -> Result<()> {
    if threads > 0 {
        // Best-effort; if a global pool already exists, keep going.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
    }

    let cfg = read_config(config)?;
    let mut sample = load_clusters(&cfg, &cfg.paths.clusters)?;
    if let Some(n) = max_clusters {
        sample = sample.head(n)?;
    }

    let bundle = open_bundle(&cfg)?;
    let loader = OnnxLoader::new();
    let mut pipeline = CalibrationPipeline::new(&bundle, cfg.settings(), &loader)?;
    if let Some(dir) = &cfg.paths.cache_dir {
        let tags = bundle.cache_tags(&cfg.bin_edges, &cfg.branches)?;
        // Tags do not cover the input file or --max-clusters; only the row count is checked.
        tracing::info!(
            cache_dir = %dir.display(),
            clusters = %cfg.paths.clusters.display(),
            rows = sample.n_rows(),
            max_clusters = ?max_clusters,
            regression_tag = %tags.regression,
            "using score caches"
        );
        pipeline = pipeline.with_caches(ScoreCaches::in_dir(dir, &tags));
    }
    let out = pipeline.run(&sample)?;

    if let Some(path) = &cfg.paths.output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        write_cluster_parquet(&out.sample, &cfg.branches.event, path)?;
        tracing::info!(path = %path.display(), rows = out.sample.n_rows(), "wrote calibrated clusters");
    }

    let study = match &cfg.paths.jets {
        Some(jets) => Some(jet_study(&cfg, &out.sample, jets)?),
        None => None,
    };

    let table = out.sample.table();
    let n_charged = table
        .require(CLF_SCORE)?
        .iter()
        .filter(|&&s| s > cfg.threshold)
        .count();
    let per_bin: serde_json::Map<String, serde_json::Value> = cfg
        .bin_edges
        .labels()
        .into_iter()
        .zip(out.assignment.per_bin())
        .map(|(label, rows)| (label, rows.len().into()))
        .collect();
    let calibrated_energy: f64 = table.require(ENERGY_PRED)?.iter().sum();

    let summary = serde_json::json!({
        "clusters_in": sample.n_rows(),
        "clusters_out": out.sample.n_rows(),
        "per_bin": per_bin,
        "below_range": out.assignment.unassigned().len(),
        "dropped": out.n_dropped,
        "charged": n_charged,
        "calibrated_energy_sum": calibrated_energy,
        "output": cfg.paths.output,
        "jet_study": study.as_ref().map(|s| {
            s.comparisons
                .iter()
                .map(|c| serde_json::json!({
                    "jets": c.jets,
                    "reference": c.reference,
                    "matched_fraction": c.matched_fraction,
                }))
                .collect::<Vec<_>>()
        }),
        "report": study.as_ref().and(cfg.paths.report.as_ref()),
    });
    write_json(output, summary)
}

fn jet_study(cfg: &AnalysisConfig, sample: &ClusterSample, jets: &Path) -> Result<StudyReport> {
    let algorithm = anti_kt(&cfg.jet_definition)?;
    let references: Vec<JetCollection> = read_jet_parquet(jets, &cfg.jet_branches)?
        .into_iter()
        .filter(|c| cfg.reference_collections.iter().any(|name| name == c.name()))
        .collect();
    if references.is_empty() {
        anyhow::bail!(
            "none of the reference collections {:?} found in {}",
            cfg.reference_collections,
            jets.display()
        );
    }

    let table = sample.table();
    let calibrated = cluster_events(
        CALIBRATED_JETS,
        algorithm.as_ref(),
        &constituents_by_event(table, &cfg.branches, ENERGY_PRED)?,
    )?;
    let raw = cluster_events(
        RAW_JETS,
        algorithm.as_ref(),
        &constituents_by_event(table, &cfg.branches, &cfg.branches.energy)?,
    )?;
    let report = run_study(&[calibrated, raw], &references, &cfg.study)?;

    if let Some(path) = &cfg.paths.report {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        report.write_json(path)?;
        tracing::info!(path = %path.display(), "wrote jet study report");
    }
    Ok(report)
}

fn cmd_validate_artifacts(config: &Path) -> Result<()> {
    let cfg = read_config(config)?;
    let bundle = open_bundle(&cfg)?;
    let manifest = bundle.manifest();

    let missing: Vec<&str> = manifest
        .artifact_files()
        .into_iter()
        .filter(|f| !bundle.base_dir().join(f).exists())
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("missing artifact files under {}: {missing:?}", bundle.base_dir().display());
    }
    let tags = bundle.cache_tags(&cfg.bin_edges, &cfg.branches)?;

    write_json(
        None,
        serde_json::json!({
            "status": "ok",
            "manifest": cfg.paths.manifest,
            "bins": cfg.bin_edges.labels(),
            "edges": cfg.bin_edges.edges(),
            "scaler_sharing": cfg.scaler_sharing,
            "target_encoding": manifest.target_encoding,
            "target_scalers": bundle.target_scalers().is_some(),
            "files": manifest.artifact_files(),
            "cache_tags": {
                "classification": tags.classification,
                "regression": tags.regression,
            },
        }),
    )
}

fn cmd_inspect_cache(input: &Path, config: Option<&PathBuf>) -> Result<()> {
    let stored = read_scores(input)?;
    let keys: Vec<&str> = stored.record.keys().collect();

    let fresh_for = match config {
        Some(path) => {
            let cfg = read_config(path)?;
            let tags = open_bundle(&cfg)?.cache_tags(&cfg.bin_edges, &cfg.branches)?;
            let tag = stored.tag.as_deref();
            Some(if tag == Some(tags.classification.as_str()) {
                "classification"
            } else if tag == Some(tags.regression.as_str()) {
                "regression"
            } else {
                "stale"
            })
        }
        None => None,
    };

    write_json(
        None,
        serde_json::json!({
            "path": input,
            "schema_version": stored.schema_version,
            "tag": stored.tag,
            "rows": stored.record.n_rows(),
            "keys": keys,
            "fresh_for": fresh_for,
        }),
    )
}

fn cmd_route(config: &Path, input: Option<&PathBuf>) -> Result<()> {
    let cfg = read_config(config)?;
    let path = input.unwrap_or(&cfg.paths.clusters);
    let sample = load_clusters(&cfg, path)?;
    let assignment = cfg.bin_edges.route(sample.table().require(&cfg.branches.energy)?);

    let bins: Vec<serde_json::Value> = cfg
        .bin_edges
        .labels()
        .into_iter()
        .zip(cfg.bin_edges.edges())
        .zip(assignment.per_bin())
        .map(|((label, edge), rows)| {
            serde_json::json!({ "bin": label, "lower_edge": edge, "clusters": rows.len() })
        })
        .collect();
    write_json(
        None,
        serde_json::json!({
            "clusters": sample.n_rows(),
            "bins": bins,
            "below_range": assignment.unassigned().len(),
        }),
    )
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
