//! Document sinks – one writer per output format behind a common contract.
//!
//! The pipeline drives a sink row by row:
//!
//! 1. [`DocumentSink::add_header_row`] once (early for sinks that can
//!    retrofit headers, after all records otherwise)
//! 2. per record: [`add_data_row`](DocumentSink::add_data_row), then
//!    [`place_image`](DocumentSink::place_image) for each image of that row,
//!    then [`set_row_height`](DocumentSink::set_row_height)
//! 3. [`DocumentSink::finalize`]
//!
//! A row must be registered before anything is anchored to it; sinks reject
//! out-of-order anchors instead of silently attaching an image to the
//! previous row.

mod docx;
mod pdf;
mod xlsx;

use std::sync::Arc;

pub use docx::DocxSink;
pub use pdf::PdfSink;
pub use xlsx::XlsxSink;

use crate::backend::BackendAssets;
use crate::config::{ExportConfig, ExportFormat, ImageBounds};
use crate::error::{ExportError, ExportResult};
use crate::fonts::{FontManager, TextMeasure};
use crate::layout::CellLayout;
use crate::resolver::{EmbeddedImage, ImageKind};
use crate::scaler::ImageSize;

/// What a sink can do and how the layout engine must size things for it.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkCapabilities {
    pub format: ExportFormat,
    /// Header cells can be rewritten after data rows exist.
    pub retrofit_headers: bool,
    /// Fixed table width in points; `None` means columns take their desired
    /// widths.
    pub content_width: Option<f32>,
    /// Page content height in points for paginated sinks.
    pub content_height: Option<f32>,
    /// Whether the layout engine wraps cell text to the column width.
    pub wraps_text: bool,
    pub accepted_images: Vec<ImageKind>,
    pub image_bounds: ImageBounds,
    /// Points per image size unit.
    pub image_unit_pt: f32,
    pub font_size: f32,
    pub header_font_size: f32,
}

/// Per-format writer. Row 0 is the header row; data rows start at 1.
pub trait DocumentSink {
    fn capabilities(&self) -> SinkCapabilities;

    /// Measurement oracle matching the fonts this sink renders with.
    fn measure(&self) -> Arc<dyn TextMeasure + Send + Sync>;

    /// `lines[i]` is the wrapped form of `headers[i]`.
    fn add_header_row(&mut self, headers: &[String], lines: &[Vec<String>], height: f32)
        -> ExportResult<()>;

    /// Rewrite (or create) a single header cell after the header row exists.
    fn set_header_cell(&mut self, column: usize, header: &str) -> ExportResult<()>;

    /// Register data row `row` (1-based, consecutive) with its text.
    fn add_data_row(&mut self, row: usize, cells: &[CellLayout]) -> ExportResult<()>;

    fn place_image(
        &mut self,
        row: usize,
        column: usize,
        image: &EmbeddedImage,
        size: ImageSize,
    ) -> ExportResult<()>;

    /// Width in points.
    fn set_column_width(&mut self, column: usize, width: f32) -> ExportResult<()>;

    /// Height in points.
    fn set_row_height(&mut self, row: usize, height: f32) -> ExportResult<()>;

    /// Start a new page and redraw the header. No-op for flowing formats.
    fn page_break(&mut self) -> ExportResult<()> {
        Ok(())
    }

    fn finalize(self: Box<Self>) -> ExportResult<Vec<u8>>;
}

/// Build the sink for `format` from the loaded backend assets.
pub fn create_sink(
    format: ExportFormat,
    config: &ExportConfig,
    assets: BackendAssets,
) -> Box<dyn DocumentSink> {
    match format {
        ExportFormat::Xlsx => Box::new(XlsxSink::new(config)),
        ExportFormat::Docx => Box::new(DocxSink::new(config)),
        ExportFormat::Pdf => {
            let fonts = match assets.font {
                Some(font) => FontManager::with_font(font),
                None => FontManager::new(),
            };
            Box::new(PdfSink::new(config, fonts))
        }
    }
}

/// Tracks registered rows so anchors can be validated.
#[derive(Debug, Default, Clone)]
pub(crate) struct RowLedger {
    header: bool,
    rows: usize,
}

impl RowLedger {
    pub fn header_added(&mut self) -> ExportResult<()> {
        if self.header {
            return Err(ExportError::Sink("header row added twice".to_string()));
        }
        self.header = true;
        Ok(())
    }

    pub fn has_header(&self) -> bool {
        self.header
    }

    pub fn row_added(&mut self, row: usize) -> ExportResult<()> {
        if row != self.rows + 1 {
            return Err(ExportError::Sink(format!(
                "data row {row} added out of order (expected {})",
                self.rows + 1
            )));
        }
        self.rows = row;
        Ok(())
    }

    /// Row must already be registered (0 is the header).
    pub fn check_anchor(&self, row: usize) -> ExportResult<()> {
        let known = if row == 0 { self.header } else { row <= self.rows };
        if known {
            Ok(())
        } else {
            Err(ExportError::Sink(format!(
                "row {row} is not registered yet"
            )))
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_rejects_anchor_before_row() {
        let mut ledger = RowLedger::default();
        assert!(ledger.check_anchor(1).is_err());
        ledger.row_added(1).unwrap();
        assert!(ledger.check_anchor(1).is_ok());
        assert!(ledger.check_anchor(2).is_err());
    }

    #[test]
    fn ledger_requires_consecutive_rows() {
        let mut ledger = RowLedger::default();
        ledger.row_added(1).unwrap();
        assert!(ledger.row_added(3).is_err());
        assert!(ledger.header_added().is_ok());
        assert!(ledger.header_added().is_err());
    }
}
