//! Embedded analytical engine.
//!
//! Each orchestrator call owns one `Engine`: a fresh in-memory DataFusion
//! session plus the per-call isolated namespace staged tables live in. The
//! namespace is an ordinary schema registered under the default catalog and
//! handed back as an RAII guard, so it is deregistered (cascading over its
//! tables) on every exit path, including unwinds.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use datafusion::arrow::array::new_empty_array;
use datafusion::arrow::datatypes::{DataType, Schema};
use datafusion::catalog::memory::MemorySchemaProvider;
use datafusion::catalog::CatalogProvider;
use datafusion::datasource::MemTable;
use datafusion::error::{DataFusionError, Result as DataFusionResult};
use datafusion::execution::FunctionRegistry;
use datafusion::logical_expr::{
    ColumnarValue, ScalarFunctionArgs, ScalarUDF, ScalarUDFImpl, Signature,
};
use datafusion::prelude::{SessionConfig, SessionContext};
use datafusion::scalar::ScalarValue;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;
use crate::functions::{FunctionSpec, ScalarFnBody};
use crate::table::Table;

const DEFAULT_CATALOG: &str = "sqllm";
const DEFAULT_SCHEMA: &str = "public";
const NAMESPACE_LEN: usize = 8;

pub struct Engine {
    ctx: SessionContext,
}

impl Engine {
    pub fn new() -> Self {
        let config = SessionConfig::new()
            .with_information_schema(true)
            .with_default_catalog_and_schema(DEFAULT_CATALOG, DEFAULT_SCHEMA);
        Self {
            ctx: SessionContext::new_with_config(config),
        }
    }

    fn catalog(&self) -> Result<Arc<dyn CatalogProvider>> {
        self.ctx
            .catalog(DEFAULT_CATALOG)
            .ok_or_else(|| anyhow!("default catalog '{DEFAULT_CATALOG}' is missing").into())
    }

    /// Create the isolated namespace under a freshly generated random name.
    /// Dropping the returned guard deregisters it, cascading over anything
    /// staged inside.
    pub fn create_namespace(&self) -> Result<Namespace> {
        let name = random_namespace(NAMESPACE_LEN);
        let catalog = self.catalog()?;
        catalog.register_schema(&name, Arc::new(MemorySchemaProvider::new()))?;
        debug!(namespace = %name, "created isolated namespace");
        Ok(Namespace { catalog, name })
    }

    pub fn namespace_exists(&self, name: &str) -> bool {
        self.ctx
            .catalog(DEFAULT_CATALOG)
            .map(|catalog| catalog.schema(name).is_some())
            .unwrap_or(false)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.ctx.udf(name).is_ok()
    }

    /// Attach a scalar function. Returns `false` without touching the engine
    /// when the name is already registered: the earlier registration wins.
    pub fn register_function(&self, spec: &FunctionSpec, null_on_error: bool) -> bool {
        if self.has_function(spec.name()) {
            debug!(function = spec.name(), "name already registered, keeping the existing function");
            return false;
        }
        self.ctx
            .register_udf(ScalarUDF::from(UdfAdapter::new(spec, null_on_error)));
        true
    }

    /// Materialize a snapshot as a table inside the namespace.
    pub fn stage_table(&self, namespace: &Namespace, name: &str, snapshot: &Table) -> Result<()> {
        let provider = MemTable::try_new(snapshot.schema(), vec![snapshot.batches().to_vec()])?;
        let schema = namespace
            .catalog
            .schema(namespace.name())
            .ok_or_else(|| anyhow!("namespace '{}' is missing", namespace.name()))?;
        schema.register_table(name.to_string(), Arc::new(provider))?;
        debug!(
            namespace = namespace.name(),
            table = name,
            rows = snapshot.num_rows(),
            "staged table snapshot"
        );
        Ok(())
    }

    /// Execute one statement and materialize the full result.
    pub async fn run(&self, sql: &str) -> Result<Table> {
        let df = self.ctx.sql(sql).await?;
        let schema = Arc::new(Schema::from(df.schema()));
        let batches = df.collect().await?;
        Ok(Table::new(schema, batches))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for the isolated namespace.
pub struct Namespace {
    catalog: Arc<dyn CatalogProvider>,
    name: String,
}

impl Namespace {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        // Best effort: a cleanup failure must not mask whatever error may be
        // propagating through this drop.
        if let Err(err) = self.catalog.deregister_schema(&self.name, true) {
            warn!(namespace = %self.name, %err, "failed to drop isolated namespace");
        }
    }
}

/// Lowercase alphanumeric, alphabetic first character so the name needs no
/// quoting when rendered into SQL.
fn random_namespace(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut name = String::with_capacity(len);
    name.push(rng.gen_range(b'a'..=b'z') as char);
    for _ in 1..len {
        let c = rng.sample(rand::distributions::Alphanumeric) as char;
        name.push(c.to_ascii_lowercase());
    }
    name
}

/// Bridges a [`FunctionSpec`] into the engine, enforcing the null-handling
/// and error-handling policy row by row: any null argument short-circuits to
/// a null result without invoking the body; a body error becomes null when
/// `null_on_error` is set and aborts the query otherwise.
struct UdfAdapter {
    name: String,
    signature: Signature,
    return_type: DataType,
    body: ScalarFnBody,
    null_on_error: bool,
}

impl UdfAdapter {
    fn new(spec: &FunctionSpec, null_on_error: bool) -> Self {
        Self {
            name: spec.name().to_string(),
            signature: spec.signature().clone(),
            return_type: spec.return_type().clone(),
            body: spec.body(),
            null_on_error,
        }
    }
}

impl fmt::Debug for UdfAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdfAdapter")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .field("null_on_error", &self.null_on_error)
            .finish()
    }
}

impl ScalarUDFImpl for UdfAdapter {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn return_type(&self, _arg_types: &[DataType]) -> DataFusionResult<DataType> {
        Ok(self.return_type.clone())
    }

    fn invoke_with_args(&self, args: ScalarFunctionArgs) -> DataFusionResult<ColumnarValue> {
        let num_rows = args.number_rows;
        if num_rows == 0 {
            return Ok(ColumnarValue::Array(new_empty_array(&self.return_type)));
        }
        let null = ScalarValue::try_from(&self.return_type)?;
        let inputs = args.args;
        let mut out = Vec::with_capacity(num_rows);
        let mut row: Vec<ScalarValue> = Vec::with_capacity(inputs.len());
        for i in 0..num_rows {
            row.clear();
            for input in &inputs {
                row.push(match input {
                    ColumnarValue::Scalar(value) => value.clone(),
                    ColumnarValue::Array(array) => ScalarValue::try_from_array(array, i)?,
                });
            }
            if row.iter().any(ScalarValue::is_null) {
                out.push(null.clone());
                continue;
            }
            match (self.body)(&row) {
                Ok(value) => out.push(value),
                Err(err) if self.null_on_error => {
                    debug!(function = %self.name, %err, "scalar function error replaced with null");
                    out.push(null.clone());
                }
                Err(err) => {
                    return Err(DataFusionError::Execution(format!(
                        "function '{}' failed: {err}",
                        self.name
                    )));
                }
            }
        }
        Ok(ColumnarValue::Array(ScalarValue::iter_to_array(out)?))
    }
}
