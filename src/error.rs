//! Unified error surface for the crate.
//!
//! Callers see either a complete result table or exactly one of these errors;
//! there is no partial-result contract. Plugin seams (scalar function bodies,
//! foreign connections) speak `anyhow` and are wrapped at the boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The query text could not be parsed when rewriting table references.
    /// The extractor itself never raises; it simply yields nothing.
    #[error("failed to parse sql: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    /// Fetching rows for a referenced table from the foreign connection
    /// failed. Fatal to the call; namespace cleanup still runs first.
    #[error("failed to fetch rows for table '{table}': {source}")]
    Fetch {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// The embedded analytical engine rejected a statement or failed during
    /// execution (including scalar function errors when `null_on_error` is
    /// disabled).
    #[error(transparent)]
    Execution(#[from] datafusion::error::DataFusionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
