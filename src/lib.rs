//! SQL over foreign-connection data with LLM-backed scalar functions.
//!
//! A query names tables the way the caller's connection knows them. The
//! runner extracts those references, pulls a snapshot of each table, stages
//! the snapshots in an isolated namespace inside an embedded analytical
//! engine, rewrites the query to point at them and executes it there. Scalar
//! functions backed by a completion endpoint (`ai`, `sentiment`) are
//! available in every query, alongside any caller-registered functions.

pub mod cache;
pub mod engine;
pub mod error;
pub mod extract;
pub mod functions;
pub mod llm;
pub mod query;
pub mod rewrite;
pub mod source;
pub mod table;
