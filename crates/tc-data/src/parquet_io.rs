//! Parquet / Arrow I/O for cluster and jet tables.
//!
//! # Cluster table: `topocal_clusters_v1`
//!
//! | Column              | Arrow Type                 | Description                          |
//! |---------------------|----------------------------|--------------------------------------|
//! | `<event>`           | integer or `Float64`       | Owning event id                      |
//! | `<scalar>`          | `Float64` (any numeric)    | One column per cluster quantity      |
//! | `<layer name>`      | `List<Float32>`            | Flattened `eta × phi` cell image     |
//!
//! Key-value metadata `topocal.schema_version` and `topocal.layers` (JSON list
//! of layer geometries) are written; readers rely on the caller's layer list.
//!
//! # Jet table
//!
//! One row per jet: event id, `pt`, `eta`, `phi`, `e` (`Float64`) and a `Utf8`
//! collection name, so both reference collections live in one file.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, Float32Builder, Float64Array, GenericListArray, ListBuilder,
    OffsetSizeTrait, StringArray, UInt64Array,
};
use arrow::datatypes::{
    ArrowNativeType, DataType, Field, Float32Type, Float64Type, Int32Type, Int64Type, Schema,
    UInt32Type, UInt64Type,
};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tc_core::{Error, FourMomentum, LayerSpec, Result};

use crate::branches::{ClusterBranches, JetBranches};
use crate::cells::CellImages;
use crate::jets::JetCollection;
use crate::sample::ClusterSample;
use crate::table::ClusterTable;

/// Schema version string embedded in cluster-file metadata.
pub const CLUSTERS_SCHEMA_V1: &str = "topocal_clusters_v1";

/// Metadata key for the schema version.
pub const META_KEY_SCHEMA_VERSION: &str = "topocal.schema_version";

/// Metadata key for the layer geometry (JSON).
pub const META_KEY_LAYERS: &str = "topocal.layers";

/// Parquet compression used by every writer in topocal.
///
/// Zstd with the `zstd` feature, Snappy otherwise.
pub fn default_compression() -> Compression {
    #[cfg(feature = "zstd")]
    {
        Compression::ZSTD(Default::default())
    }
    #[cfg(not(feature = "zstd"))]
    {
        Compression::SNAPPY
    }
}

// ---------------------------------------------------------------------------
// Generic batch helpers
// ---------------------------------------------------------------------------

/// Read every record batch of a Parquet file.
pub fn read_parquet_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path)
        .map_err(|e| Error::Data(format!("failed to open {}: {e}", path.display())))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::Data(format!("failed to read Parquet {}: {e}", path.display())))?;
    collect_batches(builder)
}

/// Read every record batch of an in-memory Parquet file.
pub fn read_parquet_batches_bytes(data: &[u8]) -> Result<Vec<RecordBatch>> {
    // `bytes::Bytes` implements `ChunkReader`.
    let buf = bytes::Bytes::copy_from_slice(data);
    let builder = ParquetRecordBatchReaderBuilder::try_new(buf)
        .map_err(|e| Error::Data(format!("failed to read Parquet bytes: {e}")))?;
    collect_batches(builder)
}

fn collect_batches<T: parquet::file::reader::ChunkReader + 'static>(
    builder: ParquetRecordBatchReaderBuilder<T>,
) -> Result<Vec<RecordBatch>> {
    let reader = builder
        .build()
        .map_err(|e| Error::Data(format!("failed to build Parquet reader: {e}")))?;
    let batches: std::result::Result<Vec<_>, _> = reader.collect();
    batches.map_err(|e| Error::Data(format!("failed to read Parquet batches: {e}")))
}

/// Write batches (sharing one schema) to a Parquet file.
pub fn write_parquet(path: &Path, batches: &[RecordBatch]) -> Result<()> {
    let bytes = write_parquet_bytes(batches)?;
    std::fs::write(path, bytes)
        .map_err(|e| Error::Data(format!("failed to write {}: {e}", path.display())))
}

/// Write batches (sharing one schema) to Parquet bytes in memory.
pub fn write_parquet_bytes(batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let Some(first) = batches.first() else {
        return Err(Error::Data("write_parquet requires at least one batch".into()));
    };
    let props = WriterProperties::builder().set_compression(default_compression()).build();
    let mut buf = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut buf, first.schema(), Some(props))
            .map_err(|e| Error::Data(format!("failed to create Parquet writer: {e}")))?;
        for batch in batches {
            writer.write(batch).map_err(|e| Error::Data(format!("failed to write Parquet: {e}")))?;
        }
        writer.close().map_err(|e| Error::Data(format!("failed to close Parquet writer: {e}")))?;
    }
    Ok(buf)
}

/// Convert any non-null numeric column to `f64`.
pub fn numeric_column_f64(col: &ArrayRef, name: &str) -> Result<Vec<f64>> {
    if col.null_count() > 0 {
        return Err(Error::Data(format!("column '{name}' contains nulls")));
    }
    let out = match col.data_type() {
        DataType::Float64 => col.as_primitive::<Float64Type>().values().to_vec(),
        DataType::Float32 => {
            col.as_primitive::<Float32Type>().values().iter().map(|&v| v as f64).collect()
        }
        DataType::Int32 => {
            col.as_primitive::<Int32Type>().values().iter().map(|&v| v as f64).collect()
        }
        DataType::Int64 => {
            col.as_primitive::<Int64Type>().values().iter().map(|&v| v as f64).collect()
        }
        DataType::UInt32 => {
            col.as_primitive::<UInt32Type>().values().iter().map(|&v| v as f64).collect()
        }
        DataType::UInt64 => {
            col.as_primitive::<UInt64Type>().values().iter().map(|&v| v as f64).collect()
        }
        other => {
            return Err(Error::Data(format!(
                "column '{name}' has type {other:?}, expected a numeric type"
            )));
        }
    };
    Ok(out)
}

/// Convert an event-id column to `u64`.
fn event_column_u64(col: &ArrayRef, name: &str) -> Result<Vec<u64>> {
    if col.null_count() > 0 {
        return Err(Error::Data(format!("event column '{name}' contains nulls")));
    }
    let out = match col.data_type() {
        DataType::UInt64 => col.as_primitive::<UInt64Type>().values().to_vec(),
        DataType::UInt32 => {
            col.as_primitive::<UInt32Type>().values().iter().map(|&v| v as u64).collect()
        }
        DataType::Int64 | DataType::Int32 | DataType::Float64 | DataType::Float32 => {
            let vals = numeric_column_f64(col, name)?;
            if let Some(bad) = vals.iter().find(|v| **v < 0.0 || v.fract() != 0.0) {
                return Err(Error::Data(format!(
                    "event column '{name}' holds {bad}, expected a non-negative integer"
                )));
            }
            vals.into_iter().map(|v| v as u64).collect()
        }
        other => {
            return Err(Error::Data(format!(
                "event column '{name}' has type {other:?}, expected an integer type"
            )));
        }
    };
    Ok(out)
}

fn is_scalar_numeric(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Float64
            | DataType::Float32
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt32
            | DataType::UInt64
    )
}

fn float_values_f32(values: &ArrayRef, layer: &str) -> Result<Vec<f32>> {
    match values.data_type() {
        DataType::Float32 => Ok(values.as_primitive::<Float32Type>().values().to_vec()),
        DataType::Float64 => {
            Ok(values.as_primitive::<Float64Type>().values().iter().map(|&v| v as f32).collect())
        }
        other => Err(Error::Data(format!(
            "layer '{layer}' holds {other:?} cells, expected Float32 or Float64"
        ))),
    }
}

fn flatten_list<O: OffsetSizeTrait>(
    list: &GenericListArray<O>,
    spec: &LayerSpec,
) -> Result<Vec<f32>> {
    if list.null_count() > 0 {
        return Err(Error::Data(format!("layer '{}' contains null images", spec.name)));
    }
    let values = float_values_f32(list.values(), &spec.name)?;
    let offsets = list.value_offsets();
    let n = spec.n_cells();
    let mut out = Vec::with_capacity(list.len() * n);
    for row in 0..list.len() {
        let start = offsets[row].as_usize();
        let end = offsets[row + 1].as_usize();
        if end - start != n {
            return Err(Error::Data(format!(
                "layer '{}' row {row}: image has {} cells, expected {}x{} = {n}",
                spec.name,
                end - start,
                spec.eta_bins,
                spec.phi_bins
            )));
        }
        out.extend_from_slice(&values[start..end]);
    }
    Ok(out)
}

fn layer_column_f32(col: &ArrayRef, spec: &LayerSpec) -> Result<Vec<f32>> {
    match col.data_type() {
        DataType::List(_) => flatten_list(col.as_list::<i32>(), spec),
        DataType::LargeList(_) => flatten_list(col.as_list::<i64>(), spec),
        other => Err(Error::Data(format!(
            "layer column '{}' has type {other:?}, expected List<Float32>",
            spec.name
        ))),
    }
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

/// Build a [`ClusterSample`] from one record batch.
///
/// Every numeric scalar column except the event column becomes a table
/// column; the required cluster branches must be present. `layers` selects
/// which list columns are read as cell images.
pub fn cluster_sample_from_record_batch(
    batch: &RecordBatch,
    branches: &ClusterBranches,
    layers: &[LayerSpec],
) -> Result<ClusterSample> {
    let schema = batch.schema();

    let event_idx = schema.index_of(&branches.event).map_err(|_| {
        Error::Data(format!("missing event column '{}' in cluster file", branches.event))
    })?;
    let events = event_column_u64(batch.column(event_idx), &branches.event)?;

    for name in branches.required() {
        if schema.index_of(name).is_err() {
            return Err(Error::Data(format!("missing required cluster column '{name}'")));
        }
    }

    let layer_names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
    let mut columns = Vec::new();
    for (i, field) in schema.fields().iter().enumerate() {
        if i == event_idx || layer_names.contains(&field.name().as_str()) {
            continue;
        }
        if is_scalar_numeric(field.data_type()) {
            columns.push((field.name().clone(), numeric_column_f64(batch.column(i), field.name())?));
        }
    }
    let table = ClusterTable::from_columns(events, columns)?;

    let mut images = Vec::with_capacity(layers.len());
    for spec in layers {
        let idx = schema
            .index_of(&spec.name)
            .map_err(|_| Error::Data(format!("missing cell-image column '{}'", spec.name)))?;
        images.push((spec.clone(), layer_column_f32(batch.column(idx), spec)?));
    }
    let images = CellImages::new(table.n_rows(), images)?;

    ClusterSample::new(table, images)
}

fn cluster_sample_from_batches(
    batches: &[RecordBatch],
    branches: &ClusterBranches,
    layers: &[LayerSpec],
) -> Result<ClusterSample> {
    if batches.is_empty() {
        return Err(Error::Data("cluster file contains no data".into()));
    }
    let mut parts = batches
        .iter()
        .map(|b| cluster_sample_from_record_batch(b, branches, layers))
        .collect::<Result<Vec<_>>>()?;
    if parts.len() == 1 {
        if let Some(only) = parts.pop() {
            return Ok(only);
        }
    }
    ClusterSample::concat(&parts)
}

/// Read a cluster Parquet file.
pub fn read_cluster_parquet(
    path: &Path,
    branches: &ClusterBranches,
    layers: &[LayerSpec],
) -> Result<ClusterSample> {
    let batches = read_parquet_batches(path)?;
    let sample = cluster_sample_from_batches(&batches, branches, layers)?;
    tracing::info!(
        path = %path.display(),
        clusters = sample.n_rows(),
        layers = layers.len(),
        "loaded cluster file"
    );
    Ok(sample)
}

/// Read an in-memory cluster Parquet file.
pub fn read_cluster_parquet_bytes(
    data: &[u8],
    branches: &ClusterBranches,
    layers: &[LayerSpec],
) -> Result<ClusterSample> {
    let batches = read_parquet_batches_bytes(data)?;
    cluster_sample_from_batches(&batches, branches, layers)
}

/// Build a record batch from a [`ClusterSample`].
pub fn cluster_sample_to_record_batch(
    sample: &ClusterSample,
    event_column: &str,
) -> Result<RecordBatch> {
    let table = sample.table();
    let layer_specs: Vec<LayerSpec> = sample.images().layer_specs().into_iter().cloned().collect();
    let layers_json = serde_json::to_string(&layer_specs)?;

    let list_field = Arc::new(Field::new("item", DataType::Float32, true));
    let mut fields = vec![Field::new(event_column, DataType::UInt64, false)];
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(UInt64Array::from(table.events().to_vec()))];

    for name in table.column_names() {
        if name == event_column {
            return Err(Error::Data(format!("column '{name}' collides with the event column")));
        }
        fields.push(Field::new(name, DataType::Float64, false));
        let col = table.require(name)?;
        arrays.push(Arc::new(Float64Array::from(col.to_vec())));
    }

    for spec in &layer_specs {
        let layer = sample.images().layer(&spec.name)?;
        let mut builder = ListBuilder::new(Float32Builder::new());
        for row in 0..sample.n_rows() {
            builder.values().append_slice(layer.image(row));
            builder.append(true);
        }
        fields.push(Field::new(&spec.name, DataType::List(list_field.clone()), false));
        arrays.push(Arc::new(builder.finish()));
    }

    let metadata = HashMap::from([
        (META_KEY_SCHEMA_VERSION.to_string(), CLUSTERS_SCHEMA_V1.to_string()),
        (META_KEY_LAYERS.to_string(), layers_json),
    ]);
    let schema = Arc::new(Schema::new(fields).with_metadata(metadata));
    RecordBatch::try_new(schema, arrays)
        .map_err(|e| Error::Data(format!("failed to build cluster RecordBatch: {e}")))
}

/// Write a [`ClusterSample`] to a Parquet file.
pub fn write_cluster_parquet(sample: &ClusterSample, event_column: &str, path: &Path) -> Result<()> {
    let batch = cluster_sample_to_record_batch(sample, event_column)?;
    write_parquet(path, &[batch])?;
    tracing::info!(path = %path.display(), clusters = sample.n_rows(), "wrote cluster file");
    Ok(())
}

/// Write a [`ClusterSample`] to Parquet bytes in memory.
pub fn write_cluster_parquet_bytes(sample: &ClusterSample, event_column: &str) -> Result<Vec<u8>> {
    let batch = cluster_sample_to_record_batch(sample, event_column)?;
    write_parquet_bytes(&[batch])
}

// ---------------------------------------------------------------------------
// Jets
// ---------------------------------------------------------------------------

/// Build a record batch holding several jet collections.
pub fn jets_to_record_batch(
    collections: &[JetCollection],
    branches: &JetBranches,
) -> Result<RecordBatch> {
    let mut events = Vec::new();
    let mut pt = Vec::new();
    let mut eta = Vec::new();
    let mut phi = Vec::new();
    let mut e = Vec::new();
    let mut names: Vec<&str> = Vec::new();

    for coll in collections {
        for (ev, jets) in coll.iter() {
            for j in jets {
                events.push(ev);
                pt.push(j.pt());
                eta.push(j.eta());
                phi.push(j.phi());
                e.push(j.e);
                names.push(coll.name());
            }
        }
    }

    let schema = Arc::new(Schema::new(vec![
        Field::new(&branches.event, DataType::UInt64, false),
        Field::new(&branches.pt, DataType::Float64, false),
        Field::new(&branches.eta, DataType::Float64, false),
        Field::new(&branches.phi, DataType::Float64, false),
        Field::new(&branches.e, DataType::Float64, false),
        Field::new(&branches.collection, DataType::Utf8, false),
    ]));
    let arrays: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(events)),
        Arc::new(Float64Array::from(pt)),
        Arc::new(Float64Array::from(eta)),
        Arc::new(Float64Array::from(phi)),
        Arc::new(Float64Array::from(e)),
        Arc::new(StringArray::from(names)),
    ];
    RecordBatch::try_new(schema, arrays)
        .map_err(|e| Error::Data(format!("failed to build jet RecordBatch: {e}")))
}

/// Write jet collections to a Parquet file.
pub fn write_jet_parquet(
    collections: &[JetCollection],
    branches: &JetBranches,
    path: &Path,
) -> Result<()> {
    let batch = jets_to_record_batch(collections, branches)?;
    write_parquet(path, &[batch])
}

fn string_column(col: &ArrayRef, name: &str) -> Result<Vec<String>> {
    if col.null_count() > 0 {
        return Err(Error::Data(format!("column '{name}' contains nulls")));
    }
    match col.data_type() {
        DataType::Utf8 => Ok(col.as_string::<i32>().iter().flatten().map(str::to_string).collect()),
        DataType::LargeUtf8 => {
            Ok(col.as_string::<i64>().iter().flatten().map(str::to_string).collect())
        }
        other => Err(Error::Data(format!("column '{name}' has type {other:?}, expected Utf8"))),
    }
}

/// Jet collections from record batches, in order of first appearance.
pub fn jets_from_record_batches(
    batches: &[RecordBatch],
    branches: &JetBranches,
) -> Result<Vec<JetCollection>> {
    let mut order: Vec<String> = Vec::new();
    let mut by_name: HashMap<String, JetCollection> = HashMap::new();

    for batch in batches {
        let schema = batch.schema();
        let col = |name: &str| -> Result<ArrayRef> {
            let idx = schema
                .index_of(name)
                .map_err(|_| Error::Data(format!("missing jet column '{name}'")))?;
            Ok(batch.column(idx).clone())
        };
        let events = event_column_u64(&col(&branches.event)?, &branches.event)?;
        let pt = numeric_column_f64(&col(&branches.pt)?, &branches.pt)?;
        let eta = numeric_column_f64(&col(&branches.eta)?, &branches.eta)?;
        let phi = numeric_column_f64(&col(&branches.phi)?, &branches.phi)?;
        let e = numeric_column_f64(&col(&branches.e)?, &branches.e)?;
        let names = string_column(&col(&branches.collection)?, &branches.collection)?;

        for i in 0..batch.num_rows() {
            let coll = by_name.entry(names[i].clone()).or_insert_with(|| {
                order.push(names[i].clone());
                JetCollection::new(names[i].clone())
            });
            coll.push(events[i], FourMomentum::from_pt_eta_phi_e(pt[i], eta[i], phi[i], e[i]));
        }
    }

    Ok(order.into_iter().filter_map(|n| by_name.remove(&n)).collect())
}

/// Read all jet collections from a Parquet file.
pub fn read_jet_parquet(path: &Path, branches: &JetBranches) -> Result<Vec<JetCollection>> {
    let batches = read_parquet_batches(path)?;
    let collections = jets_from_record_batches(&batches, branches)?;
    tracing::info!(
        path = %path.display(),
        collections = collections.len(),
        "loaded reference jets"
    );
    Ok(collections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> ClusterSample {
        let b = ClusterBranches::default();
        let table = ClusterTable::from_columns(
            vec![10, 10, 11],
            vec![
                (b.energy.clone(), vec![0.5, 2.0, 15.0]),
                (b.eta.clone(), vec![0.1, -0.2, 0.3]),
                (b.phi.clone(), vec![1.0, 1.1, -2.0]),
            ],
        )
        .unwrap();
        let images = CellImages::new(
            3,
            vec![
                (LayerSpec::new("EMB2", 2, 2), (0..12).map(|v| v as f32).collect()),
                (LayerSpec::new("TileBar2", 1, 2), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
            ],
        )
        .unwrap();
        ClusterSample::new(table, images).unwrap()
    }

    fn layers() -> Vec<LayerSpec> {
        vec![LayerSpec::new("EMB2", 2, 2), LayerSpec::new("TileBar2", 1, 2)]
    }

    #[test]
    fn test_cluster_batch_metadata() {
        let batch = cluster_sample_to_record_batch(&sample(), "eventNumber").unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 6);
        let schema = batch.schema();
        let meta = schema.metadata();
        assert_eq!(meta.get(META_KEY_SCHEMA_VERSION).unwrap(), CLUSTERS_SCHEMA_V1);
        let layers: Vec<LayerSpec> =
            serde_json::from_str(meta.get(META_KEY_LAYERS).unwrap()).unwrap();
        assert_eq!(layers, self::layers());
    }

    #[test]
    fn test_cluster_parquet_bytes_roundtrip() {
        let s = sample();
        let bytes = write_cluster_parquet_bytes(&s, "eventNumber").unwrap();
        let back =
            read_cluster_parquet_bytes(&bytes, &ClusterBranches::default(), &layers()).unwrap();
        assert_eq!(back.n_rows(), 3);
        assert_eq!(back.table().events(), &[10, 10, 11]);
        assert_eq!(back.table().column("clusterE").unwrap(), &[0.5, 2.0, 15.0]);
        assert_eq!(back.images().layer("EMB2").unwrap().image(2), &[8.0, 9.0, 10.0, 11.0]);
        assert_eq!(back.images().layer("TileBar2").unwrap().image(1), &[2.0, 3.0]);
    }

    #[test]
    fn test_wrong_layer_shape_is_rejected() {
        let bytes = write_cluster_parquet_bytes(&sample(), "eventNumber").unwrap();
        let wrong = vec![LayerSpec::new("EMB2", 4, 4)];
        let err = read_cluster_parquet_bytes(&bytes, &ClusterBranches::default(), &wrong);
        assert!(matches!(err, Err(Error::Data(_))));
    }

    #[test]
    fn test_missing_required_column_is_rejected() {
        let bytes = write_cluster_parquet_bytes(&sample(), "eventNumber").unwrap();
        let branches = ClusterBranches { energy: "clusterE_raw".into(), ..Default::default() };
        assert!(read_cluster_parquet_bytes(&bytes, &branches, &layers()).is_err());
    }

    #[test]
    fn test_jet_batch_roundtrip() {
        let mut em = JetCollection::new("AntiKt4EMTopoJets");
        em.push(1, FourMomentum::from_pt_eta_phi_e(40.0, 0.5, 1.0, 45.2));
        em.push(2, FourMomentum::from_pt_eta_phi_e(25.0, -1.0, -0.5, 38.6));
        let mut lc = JetCollection::new("AntiKt4LCTopoJets");
        lc.push(1, FourMomentum::from_pt_eta_phi_e(48.0, 0.5, 1.0, 54.2));

        let branches = JetBranches::default();
        let batch = jets_to_record_batch(&[em.clone(), lc], &branches).unwrap();
        assert_eq!(batch.num_rows(), 3);

        let back = jets_from_record_batches(&[batch], &branches).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].name(), "AntiKt4EMTopoJets");
        assert_eq!(back[1].name(), "AntiKt4LCTopoJets");
        let j = back[0].jets(2)[0];
        assert_relative_eq!(j.pt(), 25.0, epsilon = 1e-9);
        assert_relative_eq!(j.eta(), -1.0, epsilon = 1e-9);
        assert_relative_eq!(j.phi(), -0.5, epsilon = 1e-9);
        assert_relative_eq!(j.e, 38.6);
    }
}
