//! Columnar topo-cluster storage (Structure-of-Arrays).
//!
//! Rows are clusters in event order; the row index is the cluster identity and
//! stays aligned with cell images, scaler outputs and network scores. Columns
//! are shared (`Arc<[f64]>`), so adding a derived column produces a new table
//! without copying the existing ones.

use std::collections::HashMap;
use std::sync::Arc;

use tc_core::{Error, Result};

/// Immutable table of per-cluster scalar columns.
#[derive(Debug, Clone)]
pub struct ClusterTable {
    n_rows: usize,
    events: Arc<[u64]>,
    column_names: Vec<String>,
    columns: Vec<Arc<[f64]>>,
    name_to_index: HashMap<String, usize>,
}

impl ClusterTable {
    /// Create a table from an event-id column and named scalar columns.
    ///
    /// Column order is preserved. Every column must have `events.len()` rows.
    pub fn from_columns(
        events: Vec<u64>,
        columns: impl IntoIterator<Item = (String, Vec<f64>)>,
    ) -> Result<Self> {
        let n_rows = events.len();
        let mut table = Self {
            n_rows,
            events: events.into(),
            column_names: Vec::new(),
            columns: Vec::new(),
            name_to_index: HashMap::new(),
        };
        for (name, col) in columns {
            table.push_column(name, col.into())?;
        }
        Ok(table)
    }

    fn push_column(&mut self, name: String, col: Arc<[f64]>) -> Result<()> {
        if self.name_to_index.contains_key(&name) {
            return Err(Error::Validation(format!("duplicate column '{name}'")));
        }
        if col.len() != self.n_rows {
            return Err(Error::Validation(format!(
                "column length mismatch for '{}': expected {}, got {}",
                name,
                self.n_rows,
                col.len()
            )));
        }
        self.name_to_index.insert(name.clone(), self.columns.len());
        self.column_names.push(name);
        self.columns.push(col);
        Ok(())
    }

    /// Number of clusters.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    /// Event id of every row.
    pub fn events(&self) -> &[u64] {
        &self.events
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Whether a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.name_to_index.get(name).map(|&i| &*self.columns[i])
    }

    /// Column by name, as an error when missing.
    pub fn require(&self, name: &str) -> Result<&[f64]> {
        self.column(name)
            .ok_or_else(|| Error::Validation(format!("missing column '{name}' in cluster table")))
    }

    /// Return a new table with one more column.
    pub fn with_column(&self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        let mut out = self.clone();
        out.push_column(name.into(), values.into())?;
        Ok(out)
    }

    /// Return a new table with several more columns.
    pub fn with_columns(
        &self,
        columns: impl IntoIterator<Item = (String, Vec<f64>)>,
    ) -> Result<Self> {
        let mut out = self.clone();
        for (name, col) in columns {
            out.push_column(name, col.into())?;
        }
        Ok(out)
    }

    /// Return a new table holding `rows` (in the given order).
    pub fn take_rows(&self, rows: &[usize]) -> Result<Self> {
        if let Some(&bad) = rows.iter().find(|&&r| r >= self.n_rows) {
            return Err(Error::Validation(format!(
                "row index {bad} out of range for table with {} rows",
                self.n_rows
            )));
        }
        let events: Vec<u64> = rows.iter().map(|&r| self.events[r]).collect();
        let columns = self
            .column_names
            .iter()
            .zip(&self.columns)
            .map(|(name, col)| (name.clone(), rows.iter().map(|&r| col[r]).collect::<Vec<f64>>()));
        Self::from_columns(events, columns)
    }

    /// Concatenate tables with identical column lists.
    pub fn concat(tables: &[ClusterTable]) -> Result<Self> {
        let Some(first) = tables.first() else {
            return Err(Error::Validation("concat requires at least one table".into()));
        };
        for (i, t) in tables.iter().enumerate().skip(1) {
            if t.column_names != first.column_names {
                return Err(Error::Validation(format!(
                    "table {i} columns {:?} differ from {:?}",
                    t.column_names, first.column_names
                )));
            }
        }
        let events: Vec<u64> = tables.iter().flat_map(|t| t.events.iter().copied()).collect();
        let columns = first.column_names.iter().enumerate().map(|(c, name)| {
            let col: Vec<f64> = tables.iter().flat_map(|t| t.columns[c].iter().copied()).collect();
            (name.clone(), col)
        });
        Self::from_columns(events, columns)
    }
}
