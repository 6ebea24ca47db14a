//! In-memory tabular row-set.
//!
//! `Table` is the materialized form every query produces and every foreign
//! fetch returns: an Arrow schema plus the record batches that carry the rows.
//! The schema travels separately from the batches so zero-row results keep
//! their column structure.

use std::sync::Arc;

use anyhow::anyhow;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::pretty::pretty_format_batches;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl Table {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { schema, batches }
    }

    /// Build a table from batches, taking the schema from the first batch.
    pub fn from_batches(batches: Vec<RecordBatch>) -> Result<Self> {
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| anyhow!("cannot infer a schema from zero batches"))?;
        Ok(Self { schema, batches })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    /// Render the rows as an ASCII table, mainly for logs and tests.
    pub fn pretty(&self) -> Result<String> {
        let formatted = pretty_format_batches(&self.batches)
            .map_err(|e| anyhow!("failed to format batches: {e}"))?;
        Ok(formatted.to_string())
    }
}
