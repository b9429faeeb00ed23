//! A cluster table together with its aligned cell images.

use tc_core::{Error, Result};

use crate::cells::CellImages;
use crate::table::ClusterTable;

/// Clusters and their images, row-aligned.
#[derive(Debug, Clone)]
pub struct ClusterSample {
    table: ClusterTable,
    images: CellImages,
}

impl ClusterSample {
    /// Pair a table with its images; both must describe the same clusters.
    pub fn new(table: ClusterTable, images: CellImages) -> Result<Self> {
        if table.n_rows() != images.n_rows() {
            return Err(Error::Validation(format!(
                "cluster table has {} rows but cell images have {}",
                table.n_rows(),
                images.n_rows()
            )));
        }
        Ok(Self { table, images })
    }

    /// Scalar columns.
    pub fn table(&self) -> &ClusterTable {
        &self.table
    }

    /// Cell images.
    pub fn images(&self) -> &CellImages {
        &self.images
    }

    /// Number of clusters.
    pub fn n_rows(&self) -> usize {
        self.table.n_rows()
    }

    /// Same images, different table (e.g. with derived columns appended).
    pub fn with_table(&self, table: ClusterTable) -> Result<Self> {
        Self::new(table, self.images.clone())
    }

    /// Subset of rows, keeping table and images aligned.
    pub fn take_rows(&self, rows: &[usize]) -> Result<Self> {
        Self::new(self.table.take_rows(rows)?, self.images.take_rows(rows)?)
    }

    /// First `n` rows (all rows if `n` exceeds the sample size).
    pub fn head(&self, n: usize) -> Result<Self> {
        let rows: Vec<usize> = (0..n.min(self.n_rows())).collect();
        self.take_rows(&rows)
    }

    /// Concatenate samples read from several files.
    pub fn concat(parts: &[ClusterSample]) -> Result<Self> {
        let tables: Vec<ClusterTable> = parts.iter().map(|p| p.table.clone()).collect();
        let images: Vec<CellImages> = parts.iter().map(|p| p.images.clone()).collect();
        Self::new(ClusterTable::concat(&tables)?, CellImages::concat(&images)?)
    }
}
