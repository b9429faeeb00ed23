//! Persistent score cache.
//!
//! One Parquet file per cache, one `Float64` column per key. The schema
//! metadata carries a content tag of the producing artifacts; a file whose
//! tag, keys or row count disagree with the request is stale and gets
//! recomputed and overwritten.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tc_core::{Error, Result};
use tc_data::parquet_io::{numeric_column_f64, write_parquet_bytes};

/// Schema version string embedded in score-cache metadata.
pub const SCORES_SCHEMA_V1: &str = "topocal_scores_v1";
/// Metadata key for the schema version.
pub const META_KEY_SCHEMA_VERSION: &str = "topocal.schema_version";
/// Metadata key for the producing-artifact tag.
pub const META_KEY_CACHE_TAG: &str = "topocal.cache_tag";

/// Named score columns of equal length.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    n_rows: usize,
    columns: Vec<(String, Arc<[f64]>)>,
}

impl ScoreRecord {
    /// Build from `(key, values)` pairs; all columns must have the same length.
    pub fn new(columns: impl IntoIterator<Item = (String, Vec<f64>)>) -> Result<Self> {
        let mut out: Vec<(String, Arc<[f64]>)> = Vec::new();
        let mut n_rows = None;
        for (key, values) in columns {
            if out.iter().any(|(k, _)| k == &key) {
                return Err(Error::Validation(format!("duplicate score key '{key}'")));
            }
            match n_rows {
                None => n_rows = Some(values.len()),
                Some(n) if n != values.len() => {
                    return Err(Error::Validation(format!(
                        "score key '{key}' has {} values, expected {n}",
                        values.len()
                    )));
                }
                Some(_) => {}
            }
            out.push((key, values.into()));
        }
        Ok(Self { n_rows: n_rows.unwrap_or(0), columns: out })
    }

    /// Single-key record.
    pub fn single(key: &str, values: Vec<f64>) -> Self {
        Self { n_rows: values.len(), columns: vec![(key.to_string(), values.into())] }
    }

    /// Rows per column.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Keys in stored order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(k, _)| k.as_str())
    }

    /// Column for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.columns.iter().find(|(k, _)| k == key).map(|(_, v)| &v[..])
    }

    /// Column for `key`, or an error naming the key.
    pub fn require(&self, key: &str) -> Result<&[f64]> {
        self.get(key).ok_or_else(|| Error::Data(format!("score key '{key}' missing")))
    }

    fn covers(&self, keys: &[&str], n_rows: usize) -> std::result::Result<(), String> {
        if self.n_rows != n_rows {
            return Err(format!("holds {} rows, expected {n_rows}", self.n_rows));
        }
        match keys.iter().find(|k| self.get(k).is_none()) {
            Some(k) => Err(format!("key '{k}' missing")),
            None => Ok(()),
        }
    }
}

/// Contents of a cache file as found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredScores {
    /// Schema version from the file metadata.
    pub schema_version: Option<String>,
    /// Producing-artifact tag from the file metadata.
    pub tag: Option<String>,
    /// Stored columns.
    pub record: ScoreRecord,
}

/// Outcome of looking a request up in the cache file.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Stored scores are valid for the request.
    Hit(ScoreRecord),
    /// No file at the cache path.
    Absent,
    /// A file exists but cannot serve the request.
    Stale(String),
}

/// A cache file bound to the tag of the artifacts that produce its scores.
#[derive(Debug, Clone)]
pub struct ScoreCache {
    path: PathBuf,
    tag: String,
}

impl ScoreCache {
    /// Cache stored at `path`, valid for scores produced under `tag`.
    pub fn new(path: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self { path: path.into(), tag: tag.into() }
    }

    /// File location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Expected tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Check whether the file can serve `keys` for `n_rows` clusters.
    pub fn lookup(&self, keys: &[&str], n_rows: usize) -> Result<Lookup> {
        if !self.path.exists() {
            return Ok(Lookup::Absent);
        }
        let stored = match read_scores(&self.path) {
            Ok(s) => s,
            Err(e) => return Ok(Lookup::Stale(format!("unreadable: {e}"))),
        };
        if stored.schema_version.as_deref() != Some(SCORES_SCHEMA_V1) {
            return Ok(Lookup::Stale(format!(
                "schema version {:?}, expected '{SCORES_SCHEMA_V1}'",
                stored.schema_version
            )));
        }
        if stored.tag.as_deref() != Some(self.tag.as_str()) {
            return Ok(Lookup::Stale(format!(
                "tag {:?} does not match the current artifacts",
                stored.tag
            )));
        }
        if let Err(reason) = stored.record.covers(keys, n_rows) {
            return Ok(Lookup::Stale(reason));
        }
        Ok(Lookup::Hit(stored.record))
    }

    /// Return stored scores for `keys`, or compute, persist and return them.
    ///
    /// `compute` runs only on a miss and must return every key with
    /// `n_rows` values.
    pub fn get_or_compute<F>(&self, keys: &[&str], n_rows: usize, compute: F) -> Result<ScoreRecord>
    where
        F: FnOnce() -> Result<ScoreRecord>,
    {
        match self.lookup(keys, n_rows)? {
            Lookup::Hit(record) => {
                tracing::info!(
                    path = %self.path.display(),
                    keys = ?keys,
                    rows = n_rows,
                    "score cache hit"
                );
                return Ok(record);
            }
            Lookup::Absent => {
                tracing::info!(path = %self.path.display(), rows = n_rows, "score cache miss, computing");
            }
            Lookup::Stale(reason) => {
                tracing::warn!(
                    path = %self.path.display(),
                    reason = %reason,
                    "stale score cache, recomputing"
                );
            }
        }

        let record = compute()?;
        record.covers(keys, n_rows).map_err(|reason| {
            Error::Computation(format!("computed scores cannot fill the cache: {reason}"))
        })?;
        self.store(&record)?;
        Ok(record)
    }

    /// Write `record` under this cache's tag, replacing any existing file.
    pub fn store(&self, record: &ScoreRecord) -> Result<()> {
        let metadata = HashMap::from([
            (META_KEY_SCHEMA_VERSION.to_string(), SCORES_SCHEMA_V1.to_string()),
            (META_KEY_CACHE_TAG.to_string(), self.tag.clone()),
        ]);
        let fields: Vec<Field> =
            record.keys().map(|k| Field::new(k, DataType::Float64, false)).collect();
        let arrays: Vec<ArrayRef> = record
            .columns
            .iter()
            .map(|(_, v)| Arc::new(Float64Array::from(v.to_vec())) as ArrayRef)
            .collect();
        let schema = Arc::new(Schema::new(fields).with_metadata(metadata));
        let batch = RecordBatch::try_new(schema, arrays)
            .map_err(|e| Error::Data(format!("failed to build score RecordBatch: {e}")))?;
        let bytes = write_parquet_bytes(&[batch])?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("parquet.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), rows = record.n_rows(), "stored scores");
        Ok(())
    }
}

/// Read a score-cache file regardless of its tag.
pub fn read_scores(path: &Path) -> Result<StoredScores> {
    let file = File::open(path)
        .map_err(|e| Error::Data(format!("failed to open {}: {e}", path.display())))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::Data(format!("failed to read Parquet {}: {e}", path.display())))?;
    let schema = builder.schema().clone();
    let meta = schema.metadata();
    let schema_version = meta.get(META_KEY_SCHEMA_VERSION).cloned();
    let tag = meta.get(META_KEY_CACHE_TAG).cloned();

    let reader = builder
        .build()
        .map_err(|e| Error::Data(format!("failed to build Parquet reader: {e}")))?;
    let mut columns: Vec<(String, Vec<f64>)> =
        schema.fields().iter().map(|f| (f.name().clone(), Vec::new())).collect();
    for batch in reader {
        let batch = batch.map_err(|e| Error::Data(format!("failed to read score batch: {e}")))?;
        for (i, (name, out)) in columns.iter_mut().enumerate() {
            out.extend(numeric_column_f64(batch.column(i), name)?);
        }
    }
    Ok(StoredScores { schema_version, tag, record: ScoreRecord::new(columns)? })
}
