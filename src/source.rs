//! Foreign connection abstraction.
//!
//! The orchestrator only ever asks a connection to run `SELECT * FROM <name>`
//! and hand back a snapshot; everything else happens inside the engine. Any
//! backend that can answer that shape of query can participate.

use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::Schema;
use datafusion::datasource::MemTable;
use datafusion::prelude::SessionContext;

use crate::table::Table;

/// A connection the orchestrator can pull table snapshots from.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Run `query` against the backend and return the full result.
    async fn fetch(&self, query: &str) -> anyhow::Result<Table>;
}

/// In-process connection backed by its own private engine session. Used for
/// binding loose tables (and by tests); register tables up front, then hand
/// the connection to the runner.
pub struct MemoryConnection {
    ctx: SessionContext,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            ctx: SessionContext::new(),
        }
    }

    /// Make `snapshot` visible to queries under `name`.
    pub fn register(&self, name: &str, snapshot: &Table) -> anyhow::Result<()> {
        let provider = MemTable::try_new(snapshot.schema(), vec![snapshot.batches().to_vec()])?;
        self.ctx.register_table(name, Arc::new(provider))?;
        Ok(())
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RowSource for MemoryConnection {
    async fn fetch(&self, query: &str) -> anyhow::Result<Table> {
        let df = self.ctx.sql(query).await?;
        let schema = Arc::new(Schema::from(df.schema()));
        let batches = df.collect().await?;
        Ok(Table::new(schema, batches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::{DataType, Field};
    use datafusion::arrow::record_batch::RecordBatch;

    fn ints(name: &str, values: Vec<i64>) -> Table {
        let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int64Array::from(values))],
        )
        .expect("batch");
        Table::new(schema, vec![batch])
    }

    #[tokio::test]
    async fn registered_table_is_fetchable() {
        let conn = MemoryConnection::new();
        conn.register("t", &ints("a", vec![1, 2, 3])).expect("register");
        let out = conn.fetch("SELECT * FROM t").await.expect("fetch");
        assert_eq!(out.num_rows(), 3);
    }

    #[tokio::test]
    async fn unknown_table_is_an_error() {
        let conn = MemoryConnection::new();
        assert!(conn.fetch("SELECT * FROM missing").await.is_err());
    }
}
