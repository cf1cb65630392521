//! # table_export – tabular dataset → XLSX / DOCX / PDF
//!
//! This crate exports one table of a record store into a document, embedding
//! image attachments where the target format allows. The pipeline stages are:
//!
//! 1. **Collect** – pick table and view, read fields and records ([`source`])
//! 2. **Classify** – split scalar and attachment fields ([`fields`])
//! 3. **Plan** – grow the column plan with attachment slots ([`columns`])
//! 4. **Resolve** – fetch attachments under bounded concurrency
//!    ([`resolver`], [`executor`], [`fetch`])
//! 5. **Lay out** – column widths, text wrapping, image sizes, pages
//!    ([`layout`], [`scaler`], [`pagination`])
//! 6. **Write** – stream rows into a format sink ([`sink`])
//!
//! [`pipeline`] drives the stages and reports through [`progress`]; format
//! prerequisites such as the PDF font are loaded once by [`backend`].
//!
//! A C-compatible FFI surface is exposed via the [`ffi`] module.

pub mod backend;
pub mod columns;
pub mod config;
pub mod error;
pub mod executor;
pub mod ffi;
pub mod fetch;
pub mod fields;
pub mod fonts;
pub mod layout;
pub mod pagination;
pub mod pipeline;
pub mod progress;
pub mod resolver;
pub mod scaler;
pub mod sink;
pub mod source;

// Re-exports for convenience
pub use config::{ExportConfig, ExportFormat};
pub use error::{ExportError, ExportResult};
pub use pipeline::{run_export, ExportArtifact, ExportPipeline, ExportRequest};
