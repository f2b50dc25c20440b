use thiserror::Error;

/// Library-level failures surfaced at startup and by the health endpoint.
#[derive(Error, Debug)]
pub enum WayfindError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    /// The live schema does not match what the pipeline relies on, e.g. a
    /// missing pgvector extension or a wrongly sized embedding column.
    #[error("schema mismatch on {table}: {detail}")]
    Schema { table: String, detail: String },
}
