//! XLSX sink – a single worksheet written with `rust_xlsxwriter`.
//!
//! The worksheet keeps every cell in memory until the workbook is saved, so
//! header cells can be rewritten at any point of the run. The header row is
//! bold and frozen; images are inserted with cell offsets so several images
//! in one cell stack vertically.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use rust_xlsxwriter::{Format, FormatAlign, Image, Workbook, Worksheet, XlsxError};

use super::{DocumentSink, RowLedger, SinkCapabilities};
use crate::config::{ExportConfig, ExportFormat};
use crate::error::{ExportError, ExportResult};
use crate::fonts::{FontManager, TextMeasure};
use crate::layout::CellLayout;
use crate::resolver::{EmbeddedImage, ImageKind};
use crate::scaler::ImageSize;

/// Pixels per point at 96 dpi.
const PX_PER_PT: f32 = 96.0 / 72.0;

fn sink_error(e: XlsxError) -> ExportError {
    ExportError::Sink(format!("xlsx: {e}"))
}

fn column_index(column: usize) -> ExportResult<u16> {
    u16::try_from(column).map_err(|_| ExportError::Sink(format!("column {column} out of range")))
}

fn row_index(row: usize) -> ExportResult<u32> {
    u32::try_from(row).map_err(|_| ExportError::Sink(format!("row {row} out of range")))
}

pub struct XlsxSink {
    caps: SinkCapabilities,
    fonts: Arc<FontManager>,
    worksheet: Worksheet,
    header_format: Format,
    cell_format: Format,
    padding_px: u32,
    image_spacing_px: u32,
    ledger: RowLedger,
    /// Next free vertical offset per `(row, column)` for stacked images.
    image_offsets: HashMap<(usize, usize), u32>,
    images: usize,
}

impl XlsxSink {
    pub fn new(config: &ExportConfig) -> Self {
        let header_format = Format::new()
            .set_bold()
            .set_font_size(config.header_font_size)
            .set_text_wrap()
            .set_align(FormatAlign::VerticalCenter);
        let cell_format = Format::new()
            .set_font_size(config.font_size)
            .set_text_wrap()
            .set_align(FormatAlign::Top);

        Self {
            caps: SinkCapabilities {
                format: ExportFormat::Xlsx,
                retrofit_headers: true,
                content_width: None,
                content_height: None,
                wraps_text: false,
                accepted_images: vec![ImageKind::Png, ImageKind::Jpeg, ImageKind::Gif],
                image_bounds: config.xlsx_images,
                image_unit_pt: 1.0 / PX_PER_PT,
                font_size: config.font_size,
                header_font_size: config.header_font_size,
            },
            fonts: Arc::new(FontManager::new()),
            worksheet: Worksheet::new(),
            header_format,
            cell_format,
            padding_px: (config.cell_padding * PX_PER_PT).round() as u32,
            image_spacing_px: (config.image_spacing * PX_PER_PT).round() as u32,
            ledger: RowLedger::default(),
            image_offsets: HashMap::new(),
            images: 0,
        }
    }

    fn write_header(&mut self, column: usize, header: &str) -> ExportResult<()> {
        self.worksheet
            .write_string_with_format(0, column_index(column)?, header, &self.header_format)
            .map_err(sink_error)?;
        Ok(())
    }
}

impl DocumentSink for XlsxSink {
    fn capabilities(&self) -> SinkCapabilities {
        self.caps.clone()
    }

    fn measure(&self) -> Arc<dyn TextMeasure + Send + Sync> {
        self.fonts.clone()
    }

    fn add_header_row(
        &mut self,
        headers: &[String],
        _lines: &[Vec<String>],
        height: f32,
    ) -> ExportResult<()> {
        self.ledger.header_added()?;
        for (col, header) in headers.iter().enumerate() {
            self.write_header(col, header)?;
        }
        self.worksheet.set_freeze_panes(1, 0).map_err(sink_error)?;
        self.set_row_height(0, height)
    }

    fn set_header_cell(&mut self, column: usize, header: &str) -> ExportResult<()> {
        self.ledger.check_anchor(0)?;
        self.write_header(column, header)
    }

    fn add_data_row(&mut self, row: usize, cells: &[CellLayout]) -> ExportResult<()> {
        self.ledger.row_added(row)?;
        let r = row_index(row)?;
        for (col, cell) in cells.iter().enumerate() {
            if cell.lines.is_empty() || cell.lines.iter().all(String::is_empty) {
                continue;
            }
            self.worksheet
                .write_string_with_format(r, column_index(col)?, cell.lines.join("\n"), &self.cell_format)
                .map_err(sink_error)?;
        }
        Ok(())
    }

    fn place_image(
        &mut self,
        row: usize,
        column: usize,
        image: &EmbeddedImage,
        size: ImageSize,
    ) -> ExportResult<()> {
        self.ledger.check_anchor(row)?;
        if !self.caps.accepted_images.contains(&image.kind) {
            return Err(ExportError::Sink(format!(
                "{} images cannot be embedded in XLSX",
                image.kind.extension()
            )));
        }
        let picture = Image::new_from_buffer(&image.bytes)
            .map_err(sink_error)?
            .set_scale_to_size(size.width, size.height, false);

        let offset = self
            .image_offsets
            .entry((row, column))
            .or_insert(self.padding_px);
        let y_offset = *offset;
        *offset += size.height + self.image_spacing_px;

        self.worksheet
            .insert_image_with_offset(
                row_index(row)?,
                column_index(column)?,
                &picture,
                self.padding_px,
                y_offset,
            )
            .map_err(sink_error)?;
        self.images += 1;
        Ok(())
    }

    fn set_column_width(&mut self, column: usize, width: f32) -> ExportResult<()> {
        let px = (width * PX_PER_PT).ceil().clamp(1.0, f32::from(u16::MAX)) as u16;
        self.worksheet
            .set_column_width_pixels(column_index(column)?, px)
            .map_err(sink_error)?;
        Ok(())
    }

    fn set_row_height(&mut self, row: usize, height: f32) -> ExportResult<()> {
        self.ledger.check_anchor(row)?;
        self.worksheet
            .set_row_height(row_index(row)?, height)
            .map_err(sink_error)?;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> ExportResult<Vec<u8>> {
        debug!(
            "writing xlsx: {} rows, {} images",
            self.ledger.rows(),
            self.images
        );
        let mut workbook = Workbook::new();
        workbook.push_worksheet(self.worksheet);
        workbook
            .save_to_buffer()
            .map_err(|e| ExportError::Finalize {
                format: ExportFormat::Xlsx,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::encode;
    use std::io::{Cursor, Read};

    fn cells(texts: &[&str]) -> Vec<CellLayout> {
        texts
            .iter()
            .map(|t| CellLayout {
                lines: vec![t.to_string()],
                images: Vec::new(),
            })
            .collect()
    }

    fn read_part(bytes: &[u8], name: &str) -> String {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut part = archive.by_name(name).unwrap();
        let mut out = String::new();
        part.read_to_string(&mut out).unwrap();
        out
    }

    fn png_image() -> EmbeddedImage {
        EmbeddedImage {
            bytes: encode(4, 4, ::image::ImageFormat::Png),
            kind: ImageKind::Png,
            natural_width: 4,
            natural_height: 4,
        }
    }

    #[test]
    fn headers_can_be_retrofitted() {
        let mut sink = Box::new(XlsxSink::new(&ExportConfig::default()));
        sink.add_header_row(&["Name".into()], &[], 20.0).unwrap();
        sink.add_data_row(1, &cells(&["Ada"])).unwrap();
        sink.set_header_cell(2, "Files(1)").unwrap();
        let bytes = sink.finalize().unwrap();
        assert_eq!(&bytes[0..2], b"PK");
        let strings = read_part(&bytes, "xl/sharedStrings.xml");
        assert!(strings.contains("Files(1)"));
        assert!(strings.contains("Ada"));
        let sheet = read_part(&bytes, "xl/worksheets/sheet1.xml");
        assert!(sheet.contains(r#"r="C1""#));
        assert!(sheet.contains(r#"state="frozen""#));
    }

    #[test]
    fn header_cells_need_the_header_row() {
        let mut sink = XlsxSink::new(&ExportConfig::default());
        assert!(sink.set_header_cell(0, "Name").is_err());
    }

    #[test]
    fn images_need_a_registered_row() {
        let mut sink = XlsxSink::new(&ExportConfig::default());
        let image = png_image();
        let size = ImageSize { width: 24, height: 24 };
        assert!(matches!(
            sink.place_image(1, 0, &image, size),
            Err(ExportError::Sink(_))
        ));
        sink.add_data_row(1, &cells(&[""])).unwrap();
        sink.place_image(1, 0, &image, size).unwrap();
        sink.place_image(1, 0, &image, size).unwrap();
        let next = sink.image_offsets[&(1, 0)];
        assert_eq!(next, sink.padding_px + 2 * (24 + sink.image_spacing_px));
    }

    #[test]
    fn images_are_packaged_with_a_drawing() {
        let mut sink = Box::new(XlsxSink::new(&ExportConfig::default()));
        sink.add_header_row(&["Photo(1)".into()], &[], 20.0).unwrap();
        sink.add_data_row(1, &cells(&[""])).unwrap();
        sink.place_image(1, 0, &png_image(), ImageSize { width: 30, height: 30 })
            .unwrap();
        sink.set_column_width(0, 120.0).unwrap();
        sink.set_row_height(1, 40.0).unwrap();
        let bytes = sink.finalize().unwrap();
        let drawing = read_part(&bytes, "xl/drawings/drawing1.xml");
        assert_eq!(drawing.matches("<xdr:pic>").count(), 1);
        let sheet = read_part(&bytes, "xl/worksheets/sheet1.xml");
        assert!(sheet.contains(r#"ht="40""#));
        assert!(sheet.contains("<drawing "));
        assert!(read_part(&bytes, "[Content_Types].xml").contains("image/png"));
    }

    #[test]
    fn unaccepted_encodings_are_rejected() {
        let mut sink = XlsxSink::new(&ExportConfig::default());
        sink.add_data_row(1, &cells(&[""])).unwrap();
        let image = EmbeddedImage {
            kind: ImageKind::Gif,
            ..png_image()
        };
        sink.caps.accepted_images = vec![ImageKind::Png];
        assert!(sink.place_image(1, 0, &image, ImageSize { width: 4, height: 4 }).is_err());
    }
}
