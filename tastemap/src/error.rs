use thiserror::Error;

/// Enumeration of errors raised while acquiring data from the upstream
/// row service or its local sidecar files.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("upstream request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed upstream payload: {0}")]
    Parse(#[from] csv::Error),
    #[error("sidecar file {path}: {source}")]
    Sidecar { path: String, source: csv::Error },
}

/// Enumeration of errors raised by the pure transformation step.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("unparseable inspection_date {value:?} for id {id}")]
    BadDate { id: i64, value: String },
}

/// Enumeration of errors for operations against the relational store.
/// Errors originate from sqlx and are wrapped to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection to {path} failed: {error}")]
    Connection { path: String, error: sqlx::Error },
    #[error("{command} query failed: {error}")]
    Query { command: String, error: sqlx::Error },
}

/// Errors surfaced by a pipeline run. Nothing here is retried at this
/// level; retries live inside acquisition only.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("could not stat storage file: {0}")]
    Probe(#[from] std::io::Error),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
