//! PDF sink – draws the table with `printpdf` (v0.8 ops-based API).
//!
//! Rows are buffered until the next row (or page break) arrives, because a
//! row's height and its images are only final once the pipeline has placed
//! them. The header row is redrawn at the top of every page.

use std::sync::Arc;

use log::{debug, warn};
use printpdf::*;

use super::{DocumentSink, RowLedger, SinkCapabilities};
use crate::config::{ExportConfig, ExportFormat};
use crate::error::{ExportError, ExportResult};
use crate::fonts::{FontManager, TextMeasure};
use crate::layout::CellLayout;
use crate::resolver::{EmbeddedImage, ImageKind};
use crate::scaler::ImageSize;

const PT_TO_MM: f32 = 0.352778;
const HEADER_FILL: [f32; 3] = [0.92, 0.93, 0.95];
const BORDER: [f32; 3] = [0.6, 0.6, 0.6];
const TEXT: [f32; 3] = [0.1, 0.1, 0.1];

/// An image registered as a reusable XObject.
struct PlacedImage {
    column: usize,
    xobj_id: XObjectId,
    px_width: u32,
    px_height: u32,
    size: ImageSize,
}

struct PendingRow {
    row: usize,
    lines: Vec<Vec<String>>,
    images: Vec<PlacedImage>,
    height: f32,
}

pub struct PdfSink {
    caps: SinkCapabilities,
    fonts: Arc<FontManager>,
    doc: PdfDocument,
    font_id: Option<FontId>,
    page_width: f32,
    page_height: f32,
    margin: f32,
    padding: f32,
    line_height: f32,
    image_spacing: f32,
    ledger: RowLedger,
    column_widths: Vec<f32>,
    header_lines: Vec<Vec<String>>,
    header_height: f32,
    pages: Vec<PdfPage>,
    ops: Vec<Op>,
    /// Distance from the top of the page to the next free row position.
    cursor_y: f32,
    pending: Option<PendingRow>,
}

impl PdfSink {
    /// `fonts` carries the embedded font when the backend loaded one;
    /// otherwise text is drawn in builtin Helvetica.
    pub fn new(config: &ExportConfig, fonts: FontManager) -> Self {
        let mut doc = PdfDocument::new("Table export");
        let font_id = fonts.font().and_then(|font| {
            let mut warnings = Vec::new();
            match ParsedFont::from_bytes(&font.bytes, font.index as usize, &mut warnings) {
                Some(parsed) => Some(doc.add_font(&parsed)),
                None => {
                    warn!("embedded font could not be parsed for PDF, using Helvetica");
                    None
                }
            }
        });
        // Measurements must match what is drawn.
        let fonts = if font_id.is_some() { fonts } else { FontManager::new() };

        Self {
            caps: SinkCapabilities {
                format: ExportFormat::Pdf,
                retrofit_headers: false,
                content_width: Some(config.content_width()),
                content_height: Some(config.content_height()),
                wraps_text: true,
                accepted_images: vec![ImageKind::Png, ImageKind::Jpeg],
                image_bounds: config.pdf_images,
                image_unit_pt: 1.0,
                font_size: config.font_size,
                header_font_size: config.header_font_size,
            },
            fonts: Arc::new(fonts),
            doc,
            font_id,
            page_width: config.effective_width(),
            page_height: config.effective_height(),
            margin: config.page_margin,
            padding: config.cell_padding,
            line_height: config.line_height,
            image_spacing: config.image_spacing,
            ledger: RowLedger::default(),
            column_widths: Vec::new(),
            header_lines: Vec::new(),
            header_height: 0.0,
            pages: Vec::new(),
            ops: Vec::new(),
            cursor_y: config.page_margin,
            pending: None,
        }
    }

    pub fn has_embedded_font(&self) -> bool {
        self.font_id.is_some()
    }

    fn column_x(&self, column: usize) -> f32 {
        self.margin + self.column_widths.iter().take(column).sum::<f32>()
    }

    fn column_width(&self, column: usize) -> f32 {
        self.column_widths.get(column).copied().unwrap_or(0.0)
    }

    fn draw_header(&mut self) {
        let top = self.cursor_y;
        let height = self.header_height;
        let total: f32 = self.column_widths.iter().sum();
        fill_rect(&mut self.ops, self.margin, top, total, height, self.page_height, HEADER_FILL);

        let lines = std::mem::take(&mut self.header_lines);
        for (col, cell) in lines.iter().enumerate() {
            let x = self.column_x(col);
            let w = self.column_width(col);
            stroke_rect(&mut self.ops, x, top, w, height, self.page_height);
            self.draw_lines(cell, x, top, self.caps.header_font_size, true);
        }
        self.header_lines = lines;
        self.cursor_y += height;
    }

    fn flush_row(&mut self) {
        let Some(row) = self.pending.take() else {
            return;
        };
        let top = self.cursor_y;
        let columns = self.column_widths.len().max(row.lines.len());
        for col in 0..columns {
            let x = self.column_x(col);
            let w = self.column_width(col);
            stroke_rect(&mut self.ops, x, top, w, row.height, self.page_height);

            let mut y = top + self.padding;
            for img in row.images.iter().filter(|i| i.column == col) {
                self.draw_image(img, x + self.padding, y);
                y += img.size.height as f32 + self.image_spacing;
            }
            if let Some(lines) = row.lines.get(col) {
                let text_top = if y > top + self.padding { y - self.padding } else { top };
                self.draw_lines(lines, x, text_top, self.caps.font_size, false);
            }
        }
        debug!("pdf row {} drawn at y={top:.1}", row.row);
        self.cursor_y += row.height;
    }

    /// Draw text lines inside the cell whose top-left corner is `(x, top)`.
    fn draw_lines(&mut self, lines: &[String], x: f32, top: f32, size: f32, bold: bool) {
        let lh = self.fonts.line_height(size, self.line_height);
        let ascender = self.fonts.ascender(size);
        for (i, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            let baseline = top + self.padding + ascender + i as f32 * lh;
            self.ops.push(Op::StartTextSection);
            self.ops.push(Op::SetTextCursor {
                pos: Point {
                    x: Pt(x + self.padding),
                    y: Pt(self.page_height - baseline),
                },
            });
            self.ops.push(Op::SetFillColor { col: rgb(TEXT) });
            match &self.font_id {
                Some(font) => {
                    self.ops.push(Op::SetFontSize {
                        size: Pt(size),
                        font: font.clone(),
                    });
                    self.ops.push(Op::WriteText {
                        items: vec![TextItem::Text(line.clone())],
                        font: font.clone(),
                    });
                }
                None => {
                    let font = if bold {
                        BuiltinFont::HelveticaBold
                    } else {
                        BuiltinFont::Helvetica
                    };
                    self.ops.push(Op::SetFontSizeBuiltinFont {
                        size: Pt(size),
                        font,
                    });
                    // printpdf registers a builtin font only through its own
                    // text op, and writes that op's text as UTF-8. The glyphs
                    // go out as a raw `Tj` string of WinAnsi bytes instead.
                    self.ops.push(Op::WriteTextBuiltinFont {
                        items: Vec::new(),
                        font,
                    });
                    self.ops.push(Op::Unknown {
                        key: "Tj".to_string(),
                        value: vec![DictItem::String {
                            data: winansi_bytes(line),
                            literal: false,
                        }],
                    });
                }
            }
            self.ops.push(Op::EndTextSection);
        }
    }

    fn draw_image(&mut self, img: &PlacedImage, x: f32, top: f32) {
        // PDF origin is bottom-left; translate_y is the image's bottom edge.
        let bottom = self.page_height - top - img.size.height as f32;
        // At dpi=72 printpdf renders 1 px = 1 pt.
        let scale_x = img.size.width as f32 / img.px_width.max(1) as f32;
        let scale_y = img.size.height as f32 / img.px_height.max(1) as f32;
        self.ops.push(Op::UseXobject {
            id: img.xobj_id.clone(),
            transform: XObjectTransform {
                translate_x: Some(Pt(x)),
                translate_y: Some(Pt(bottom)),
                dpi: Some(72.0),
                scale_x: Some(scale_x),
                scale_y: Some(scale_y),
                rotate: None,
            },
        });
    }

    fn finish_page(&mut self) {
        let ops = std::mem::take(&mut self.ops);
        self.pages.push(PdfPage::new(
            Mm(self.page_width * PT_TO_MM),
            Mm(self.page_height * PT_TO_MM),
            ops,
        ));
        self.cursor_y = self.margin;
    }
}

impl DocumentSink for PdfSink {
    fn capabilities(&self) -> SinkCapabilities {
        self.caps.clone()
    }

    fn measure(&self) -> Arc<dyn TextMeasure + Send + Sync> {
        self.fonts.clone()
    }

    fn add_header_row(
        &mut self,
        _headers: &[String],
        lines: &[Vec<String>],
        height: f32,
    ) -> ExportResult<()> {
        self.ledger.header_added()?;
        if self.column_widths.len() < lines.len() {
            return Err(ExportError::Sink(
                "PDF column widths must be set before the header row".to_string(),
            ));
        }
        self.header_lines = lines.to_vec();
        self.header_height = height;
        self.draw_header();
        Ok(())
    }

    fn set_header_cell(&mut self, column: usize, _header: &str) -> ExportResult<()> {
        Err(ExportError::Sink(format!(
            "PDF cannot rewrite header cell {column} once it is drawn"
        )))
    }

    fn add_data_row(&mut self, row: usize, cells: &[CellLayout]) -> ExportResult<()> {
        if !self.ledger.has_header() {
            return Err(ExportError::Sink(
                "PDF header row must be drawn before data rows".to_string(),
            ));
        }
        self.ledger.row_added(row)?;
        self.flush_row();
        self.pending = Some(PendingRow {
            row,
            lines: cells.iter().map(|c| c.lines.clone()).collect(),
            images: Vec::new(),
            height: 0.0,
        });
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
        if self.pending.as_ref().map(|p| p.row) != Some(row) {
            return Err(ExportError::Sink(format!(
                "row {row} is already drawn, images must be placed before the next row"
            )));
        }
        if !self.caps.accepted_images.contains(&image.kind) {
            return Err(ExportError::Sink(format!(
                "{} images cannot be embedded in PDF",
                image.kind.extension()
            )));
        }
        let mut warnings: Vec<PdfWarnMsg> = Vec::new();
        let raw = RawImage::decode_from_bytes(&image.bytes, &mut warnings)
            .map_err(|e| ExportError::Sink(format!("PDF image encode error: {e}")))?;
        let xobj_id = self.doc.add_image(&raw);
        if let Some(pending) = self.pending.as_mut() {
            pending.images.push(PlacedImage {
                column,
                xobj_id,
                px_width: image.natural_width,
                px_height: image.natural_height,
                size,
            });
        }
        Ok(())
    }

    fn set_column_width(&mut self, column: usize, width: f32) -> ExportResult<()> {
        if column >= self.column_widths.len() {
            self.column_widths.resize(column + 1, 0.0);
        }
        self.column_widths[column] = width;
        Ok(())
    }

    fn set_row_height(&mut self, row: usize, height: f32) -> ExportResult<()> {
        self.ledger.check_anchor(row)?;
        match self.pending.as_mut() {
            Some(pending) if pending.row == row => {
                pending.height = height;
                Ok(())
            }
            _ => Err(ExportError::Sink(format!(
                "row {row} is already drawn, its height can no longer change"
            ))),
        }
    }

    fn page_break(&mut self) -> ExportResult<()> {
        self.flush_row();
        self.finish_page();
        if self.ledger.has_header() {
            self.draw_header();
        }
        Ok(())
    }

    fn finalize(mut self: Box<Self>) -> ExportResult<Vec<u8>> {
        self.flush_row();
        if !self.ops.is_empty() || self.pages.is_empty() {
            self.finish_page();
        }
        debug!("writing pdf: {} pages", self.pages.len());
        let pages = std::mem::take(&mut self.pages);
        self.doc.with_pages(pages);
        let mut warnings = Vec::new();
        // Raw text ops are only written by a non-secure save.
        let options = PdfSaveOptions {
            secure: self.font_id.is_some(),
            ..PdfSaveOptions::default()
        };
        let bytes = self.doc.save(&options, &mut warnings);
        if bytes.is_empty() {
            return Err(ExportError::Finalize {
                format: ExportFormat::Pdf,
                reason: "printpdf produced an empty document".to_string(),
            });
        }
        Ok(bytes)
    }
}

fn rgb(c: [f32; 3]) -> Color {
    Color::Rgb(Rgb {
        r: c[0],
        g: c[1],
        b: c[2],
        icc_profile: None,
    })
}

/// Corner points of a rectangle given in top-left page coordinates.
fn rect_points(x: f32, top: f32, w: f32, h: f32, page_height: f32) -> Vec<LinePoint> {
    let (y1, y2) = (page_height - top - h, page_height - top);
    [(x, y2), (x + w, y2), (x + w, y1), (x, y1)]
        .into_iter()
        .map(|(x, y)| LinePoint {
            p: Point { x: Pt(x), y: Pt(y) },
            bezier: false,
        })
        .collect()
}

fn fill_rect(ops: &mut Vec<Op>, x: f32, top: f32, w: f32, h: f32, page_height: f32, color: [f32; 3]) {
    ops.push(Op::SetFillColor { col: rgb(color) });
    ops.push(Op::DrawPolygon {
        polygon: Polygon {
            rings: vec![PolygonRing {
                points: rect_points(x, top, w, h, page_height),
            }],
            mode: PaintMode::Fill,
            winding_order: WindingOrder::NonZero,
        },
    });
}

fn stroke_rect(ops: &mut Vec<Op>, x: f32, top: f32, w: f32, h: f32, page_height: f32) {
    ops.push(Op::SetOutlineColor { col: rgb(BORDER) });
    ops.push(Op::SetOutlineThickness { pt: Pt(0.5) });
    ops.push(Op::DrawLine {
        line: Line {
            points: rect_points(x, top, w, h, page_height),
            is_closed: true,
        },
    });
}

/// Windows-1252 bytes for the builtin fonts, which use WinAnsiEncoding.
/// Characters outside the code page become `?`.
fn winansi_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| match c {
            '\u{20AC}' => 0x80,
            '\u{2026}' => 0x85,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201C}' => 0x93,
            '\u{201D}' => 0x94,
            '\u{2022}' => 0x95,
            '\u{2013}' => 0x96,
            '\u{2014}' => 0x97,
            '\u{00A0}' => 0x20,
            '\u{80}'..='\u{9F}' => b'?',
            c if (c as u32) < 256 => c as u8,
            _ => b'?',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::encode;

    fn sink() -> Box<PdfSink> {
        let mut sink = Box::new(PdfSink::new(&ExportConfig::default(), FontManager::new()));
        sink.set_column_width(0, 100.0).unwrap();
        sink.set_column_width(1, 200.0).unwrap();
        sink
    }

    fn text_row(a: &str, b: &str) -> Vec<CellLayout> {
        vec![
            CellLayout { lines: vec![a.into()], images: vec![] },
            CellLayout { lines: vec![b.into()], images: vec![] },
        ]
    }

    #[test]
    fn renders_a_small_table() {
        let mut sink = sink();
        assert!(!sink.has_embedded_font());
        sink.add_header_row(
            &["A".into(), "B".into()],
            &[vec!["A".into()], vec!["B".into()]],
            20.0,
        )
        .unwrap();
        sink.add_data_row(1, &text_row("x", "y")).unwrap();
        sink.set_row_height(1, 20.0).unwrap();
        sink.page_break().unwrap();
        sink.add_data_row(2, &text_row("z", "w")).unwrap();
        sink.set_row_height(2, 20.0).unwrap();
        let bytes = sink.finalize().unwrap();
        assert_eq!(&bytes[0..5], b"%PDF-");
    }

    #[test]
    fn image_after_next_row_is_rejected() {
        let mut sink = sink();
        sink.add_header_row(&["A".into()], &[vec!["A".into()]], 20.0)
            .unwrap();
        sink.add_data_row(1, &text_row("", "")).unwrap();
        sink.add_data_row(2, &text_row("", "")).unwrap();
        let image = EmbeddedImage {
            bytes: encode(4, 4, ::image::ImageFormat::Png),
            kind: ImageKind::Png,
            natural_width: 4,
            natural_height: 4,
        };
        let size = ImageSize { width: 16, height: 16 };
        assert!(sink.place_image(1, 0, &image, size).is_err());
        assert!(sink.place_image(2, 0, &image, size).is_ok());
        assert!(sink.place_image(3, 0, &image, size).is_err());
    }

    #[test]
    fn data_rows_require_the_header() {
        let mut sink = sink();
        assert!(matches!(
            sink.add_data_row(1, &text_row("a", "b")),
            Err(ExportError::Sink(_))
        ));
    }

    #[test]
    fn winansi_maps_unsupported_chars() {
        assert_eq!(winansi_bytes("é"), vec![0xE9]);
        assert_eq!(winansi_bytes("中"), b"?".to_vec());
        assert_eq!(winansi_bytes("\u{2013}€"), vec![0x96, 0x80]);
        assert_eq!(winansi_bytes("\u{85}"), b"?".to_vec());
    }

    #[test]
    fn accented_text_is_written_as_winansi_bytes() {
        let mut sink = sink();
        sink.add_header_row(
            &["Café".into(), "B".into()],
            &[vec!["Café".into()], vec!["B".into()]],
            20.0,
        )
        .unwrap();
        sink.add_data_row(1, &text_row("café über", "naïve 中")).unwrap();
        sink.set_row_height(1, 20.0).unwrap();
        sink.page_break().unwrap();

        let written: Vec<&Vec<u8>> = sink
            .pages
            .iter()
            .flat_map(|page| &page.ops)
            .filter_map(|op| match op {
                Op::Unknown { key, value } if key == "Tj" => match value.as_slice() {
                    [DictItem::String { data, .. }] => Some(data),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert!(written.contains(&&b"caf\xE9 \xFCber".to_vec()));
        assert!(written.contains(&&b"na\xEFve ?".to_vec()));
        assert!(written.contains(&&b"Caf\xE9".to_vec()));

        let bytes = sink.finalize().unwrap();
        assert_eq!(&bytes[0..5], b"%PDF-");
    }
}
