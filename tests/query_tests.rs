use std::sync::Arc;

use datafusion::arrow::array::{Float64Array, Int64Array, StringArray};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::scalar::ScalarValue;

use sqllm::error::Error;
use sqllm::functions::FunctionSpec;
use sqllm::llm::LlmClient;
use sqllm::query::Runner;
use sqllm::source::MemoryConnection;
use sqllm::table::Table;

struct MockLlm;

impl LlmClient for MockLlm {
    fn complete(&self, _system: Option<&str>, text: &str) -> anyhow::Result<Option<String>> {
        Ok(Some(format!("mock:{text}")))
    }
}

fn runner() -> Runner {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
    Runner::with_client(Arc::new(MockLlm))
}

fn simple_df() -> Table {
    let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, false)]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![Arc::new(Int64Array::from(vec![1, 2, 3]))],
    )
    .expect("batch");
    Table::new(schema, vec![batch])
}

fn users() -> Table {
    let schema = Arc::new(Schema::new(vec![
        Field::new("user_id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(Int64Array::from(vec![1, 2])),
            Arc::new(StringArray::from(vec!["ann", "bo"])),
        ],
    )
    .expect("batch");
    Table::new(schema, vec![batch])
}

fn orders() -> Table {
    let schema = Arc::new(Schema::new(vec![
        Field::new("order_id", DataType::Int64, false),
        Field::new("user_id", DataType::Int64, false),
        Field::new("item_id", DataType::Int64, false),
        Field::new("price", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(Int64Array::from(vec![10, 11, 12])),
            Arc::new(Int64Array::from(vec![1, 1, 2])),
            Arc::new(Int64Array::from(vec![100, 101, 100])),
            Arc::new(Float64Array::from(vec![450.0, 100.0, 200.0])),
        ],
    )
    .expect("batch");
    Table::new(schema, vec![batch])
}

fn column_i64(table: &Table, index: usize) -> Vec<i64> {
    let mut out = Vec::new();
    for batch in table.batches() {
        let col = batch
            .column(index)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 column");
        out.extend(col.iter().map(|v| v.expect("non-null")));
    }
    out
}

#[tokio::test]
async fn filter_over_a_bound_frame() {
    let out = runner()
        .query_df(&simple_df(), "SELECT a FROM df WHERE a > 1 ORDER BY a", &[])
        .await
        .expect("query");
    assert_eq!(column_i64(&out, 0), vec![2, 3]);
}

#[tokio::test]
async fn join_and_aggregate_across_connection_tables() {
    let conn = MemoryConnection::new();
    conn.register("users", &users()).expect("register users");
    conn.register("orders", &orders()).expect("register orders");
    let out = runner()
        .query(
            &conn,
            "SELECT u.user_id, SUM(o.price) AS total, COUNT(DISTINCT o.item_id) AS items \
             FROM users u JOIN orders o ON u.user_id = o.user_id \
             GROUP BY u.user_id ORDER BY u.user_id",
            &[],
        )
        .await
        .expect("query");
    assert_eq!(column_i64(&out, 0), vec![1, 2]);
    assert_eq!(column_i64(&out, 2), vec![2, 1]);
    let totals = out.batches()[0]
        .column(1)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("float column");
    assert_eq!(totals.value(0), 550.0);
    assert_eq!(totals.value(1), 200.0);
}

#[tokio::test]
async fn subquery_sources_are_staged_too() {
    let conn = MemoryConnection::new();
    conn.register("users", &users()).expect("register users");
    conn.register("orders", &orders()).expect("register orders");
    let out = runner()
        .query(
            &conn,
            "SELECT name FROM users \
             WHERE user_id IN (SELECT user_id FROM orders WHERE price > 300) \
             ORDER BY name",
            &[],
        )
        .await
        .expect("query");
    assert_eq!(out.num_rows(), 1);
}

#[tokio::test]
async fn multi_statement_input_returns_the_last_result() {
    let out = runner()
        .query_df(
            &simple_df(),
            "SELECT a FROM df WHERE a = 1; SELECT a FROM df WHERE a > 1",
            &[],
        )
        .await
        .expect("query");
    assert_eq!(out.num_rows(), 2);
}

#[tokio::test]
async fn missing_table_surfaces_as_a_fetch_error() {
    let conn = MemoryConnection::new();
    let err = runner()
        .query(&conn, "SELECT * FROM nowhere", &[])
        .await
        .expect_err("must fail");
    match err {
        Error::Fetch { table, .. } => assert_eq!(table, "nowhere"),
        other => panic!("expected a fetch error, got {other}"),
    }
}

#[tokio::test]
async fn repeated_queries_are_isolated_from_each_other() {
    let r = runner();
    let df = simple_df();
    let first = r
        .query_df(&df, "SELECT a FROM df ORDER BY a", &[])
        .await
        .expect("first");
    let second = r
        .query_df(&df, "SELECT a FROM df ORDER BY a", &[])
        .await
        .expect("second");
    assert_eq!(
        first.pretty().expect("pretty"),
        second.pretty().expect("pretty")
    );
}

#[tokio::test]
async fn caller_functions_are_available_in_queries() {
    let double = FunctionSpec::new(
        "double_it",
        vec![DataType::Int64],
        DataType::Int64,
        |args| match &args[0] {
            ScalarValue::Int64(Some(v)) => Ok(ScalarValue::Int64(Some(v * 2))),
            other => anyhow::bail!("unexpected arg {other:?}"),
        },
    );
    let out = runner()
        .query_df(
            &simple_df(),
            "SELECT double_it(a) AS d FROM df ORDER BY a",
            &[double],
        )
        .await
        .expect("query");
    assert_eq!(column_i64(&out, 0), vec![2, 4, 6]);
}

#[tokio::test]
async fn cte_alias_colliding_with_a_staged_table_shadows_it() {
    let conn = MemoryConnection::new();
    conn.register("t", &simple_df()).expect("register");
    let out = runner()
        .query(
            &conn,
            "SELECT a FROM t; WITH t AS (SELECT 100 AS a) SELECT a FROM t",
            &[],
        )
        .await
        .expect("query");
    // the last statement must read the CTE, not the staged snapshot
    assert_eq!(column_i64(&out, 0), vec![100]);
}

#[tokio::test]
async fn cte_names_are_not_fetched_from_the_connection() {
    // `big` exists only as a CTE alias; only `df` may be pulled.
    let out = runner()
        .query_df(
            &simple_df(),
            "WITH big AS (SELECT a FROM df WHERE a > 1) SELECT a FROM big ORDER BY a",
            &[],
        )
        .await
        .expect("query");
    assert_eq!(column_i64(&out, 0), vec![2, 3]);
}
