//! Query orchestration.
//!
//! `Runner` ties the pieces together: extract the referenced tables, pull a
//! snapshot of each from the foreign connection, stage the snapshots in a
//! fresh isolated namespace, rewrite the query to point at them, attach
//! caller functions plus the LLM built-ins, execute, and tear the namespace
//! down again. Each `query` call gets its own engine session; the memoized
//! completion cache lives on the runner so it spans calls.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::debug;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::extract::referenced_tables;
use crate::functions::{ai, sentiment, FunctionSpec};
use crate::llm::{LlmClient, Memoized, OpenAiClient};
use crate::rewrite::qualify_tables;
use crate::source::{MemoryConnection, RowSource};
use crate::table::Table;

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

pub struct Runner {
    llm: Arc<dyn LlmClient>,
    null_on_error: bool,
}

impl Runner {
    /// Runner backed by the OpenAI-compatible endpoint described by the
    /// environment (`OPENAI_API_KEY`, optional `OPENAI_BASE_URL`).
    pub fn from_env() -> Result<Self> {
        Ok(Self::with_client(Arc::new(OpenAiClient::from_env()?)))
    }

    /// Runner backed by `client`, wrapped in a bounded memoization layer so
    /// repeated identical completions are answered from cache.
    pub fn with_client(client: Arc<dyn LlmClient>) -> Self {
        Self {
            llm: Arc::new(Memoized::new(client, DEFAULT_CACHE_CAPACITY)),
            null_on_error: true,
        }
    }

    /// When set (the default), a scalar function failure yields SQL null for
    /// that row; when cleared, the failure aborts the whole query.
    pub fn null_on_error(mut self, enabled: bool) -> Self {
        self.null_on_error = enabled;
        self
    }

    /// Run `sql` against `conn`, staging every referenced table through a
    /// private namespace. `functions` are attached before the built-ins, so a
    /// caller-supplied name wins a collision with `ai` or `sentiment`.
    pub async fn query(
        &self,
        conn: &dyn RowSource,
        sql: &str,
        functions: &[FunctionSpec],
    ) -> Result<Table> {
        let tables = referenced_tables(sql);
        debug!(tables = ?tables, "resolved foreign table references");

        let engine = Engine::new();
        for spec in functions {
            engine.register_function(spec, self.null_on_error);
        }
        engine.register_function(&ai(Arc::clone(&self.llm)), self.null_on_error);
        engine.register_function(&sentiment(Arc::clone(&self.llm)), self.null_on_error);

        let namespace = engine.create_namespace()?;
        self.stage_and_run(conn, &engine, &namespace, sql, &tables)
            .await
        // `namespace` drops here on success and failure alike, cascading over
        // the staged tables.
    }

    async fn stage_and_run(
        &self,
        conn: &dyn RowSource,
        engine: &Engine,
        namespace: &crate::engine::Namespace,
        sql: &str,
        tables: &[String],
    ) -> Result<Table> {
        for table in tables {
            let snapshot = conn
                .fetch(&format!("SELECT * FROM {table}"))
                .await
                .map_err(|source| Error::Fetch {
                    table: table.clone(),
                    source,
                })?;
            engine.stage_table(namespace, table, &snapshot)?;
        }

        let statements = qualify_tables(sql, namespace.name(), tables)?;
        let mut last = None;
        for statement in &statements {
            debug!(%statement, "executing staged statement");
            last = Some(engine.run(statement).await?);
        }
        last.ok_or_else(|| anyhow!("query contained no statements").into())
    }

    /// Run `sql` with `df` bound as the table `df`, no external connection
    /// required.
    pub async fn query_df(
        &self,
        df: &Table,
        sql: &str,
        functions: &[FunctionSpec],
    ) -> Result<Table> {
        let conn = MemoryConnection::new();
        conn.register("df", df)?;
        self.query(&conn, sql, functions).await
    }
}
