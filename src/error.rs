//! Error types shared across the export pipeline.
//!
//! Only [`ExportError`] ever escapes a run. [`SourceError`] and [`FetchError`]
//! are produced by the external collaborators and are either recovered
//! locally (cell reads, attachment fetches) or wrapped into an
//! [`ExportError`].

use thiserror::Error;

use crate::config::ExportFormat;

/// Errors reported by a [`DataSource`](crate::source::DataSource).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation not supported by this data source: {0}")]
    Unsupported(&'static str),

    #[error("data source request failed: {0}")]
    Failed(String),
}

/// Errors raised while fetching a single attachment binary.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid attachment url: {0}")]
    InvalidUrl(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("fetch timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("could not decode attachment: {0}")]
    Decode(String),
}

/// Fatal errors that end an export run.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("no data table is available")]
    NoTable,

    #[error("data source error: {0}")]
    Source(#[from] SourceError),

    /// The rendering backend for `format` could not be loaded after every
    /// fallback was tried.
    #[error("{format} backend unavailable: {reason}")]
    BackendUnavailable { format: ExportFormat, reason: String },

    /// The sink was driven in an order it cannot honour.
    #[error("document sink error: {0}")]
    Sink(String),

    /// The backend failed while producing the final file.
    #[error("failed to generate {format} file: {reason}")]
    Finalize { format: ExportFormat, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExportResult<T> = Result<T, ExportError>;
pub type SourceResult<T> = Result<T, SourceError>;
