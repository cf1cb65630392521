//! DOCX sink – one fixed-layout table written with `docx-rs`.
//!
//! Word does the text wrapping, so rows carry one paragraph per explicit
//! line rather than pre-wrapped lines, and row heights are minimums. The
//! document is assembled in [`finalize`](DocumentSink::finalize) because the
//! builder is by-value and images arrive after their row.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use docx_rs::{
    BreakType, Docx, HeightRule, PageMargin, PageOrientationType, Paragraph, Pic, Run, Table,
    TableCell, TableLayoutType, TableRow, VAlignType, WidthType,
};
use log::debug;

use super::{DocumentSink, RowLedger, SinkCapabilities};
use crate::config::{ExportConfig, ExportFormat, PageOrientation};
use crate::error::{ExportError, ExportResult};
use crate::fonts::{FontManager, TextMeasure};
use crate::layout::CellLayout;
use crate::resolver::{EmbeddedImage, ImageKind};
use crate::scaler::ImageSize;

const EMU_PER_PT: f32 = 12_700.0;

fn twips(pt: f32) -> usize {
    (pt * 20.0).round().max(0.0) as usize
}

fn half_points(pt: f32) -> usize {
    (pt * 2.0).round().max(1.0) as usize
}

struct Picture {
    column: usize,
    size: ImageSize,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Row {
    lines: Vec<Vec<String>>,
    pictures: Vec<Picture>,
    height: Option<f32>,
}

pub struct DocxSink {
    caps: SinkCapabilities,
    fonts: Arc<FontManager>,
    page_width: f32,
    page_height: f32,
    margin: f32,
    orientation: PageOrientation,
    ledger: RowLedger,
    headers: Vec<String>,
    header_height: f32,
    column_widths: BTreeMap<usize, f32>,
    rows: Vec<Row>,
}

impl DocxSink {
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            caps: SinkCapabilities {
                format: ExportFormat::Docx,
                retrofit_headers: false,
                content_width: Some(config.content_width()),
                content_height: None,
                wraps_text: false,
                accepted_images: vec![ImageKind::Png, ImageKind::Jpeg, ImageKind::Gif],
                image_bounds: config.docx_images,
                image_unit_pt: 1.0,
                font_size: config.font_size,
                header_font_size: config.header_font_size,
            },
            fonts: Arc::new(FontManager::new()),
            page_width: config.effective_width(),
            page_height: config.effective_height(),
            margin: config.page_margin,
            orientation: config.orientation,
            ledger: RowLedger::default(),
            headers: Vec::new(),
            header_height: 0.0,
            column_widths: BTreeMap::new(),
            rows: Vec::new(),
        }
    }

    fn columns(&self) -> usize {
        let data = self.rows.iter().map(|r| r.lines.len()).max().unwrap_or(0);
        self.headers.len().max(data)
    }

    /// Column widths in twips; columns without an explicit width share the
    /// content width equally.
    fn grid(&self) -> Vec<usize> {
        let n = self.columns();
        let fallback = match n {
            0 => 0.0,
            n => self.caps.content_width.unwrap_or(0.0) / n as f32,
        };
        (0..n)
            .map(|c| twips(self.column_widths.get(&c).copied().unwrap_or(fallback)))
            .collect()
    }

    fn text_cell(&self, lines: &[String], bold: bool, width: usize) -> TableCell {
        let size = if bold {
            half_points(self.caps.header_font_size)
        } else {
            half_points(self.caps.font_size)
        };
        let mut run = Run::new().size(size);
        if bold {
            run = run.bold();
        }
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                run = run.add_break(BreakType::TextWrapping);
            }
            run = run.add_text(line.as_str());
        }
        TableCell::new()
            .add_paragraph(Paragraph::new().add_run(run))
            .width(width, WidthType::Dxa)
            .vertical_align(VAlignType::Top)
    }

    fn data_row(&self, row: &Row, grid: &[usize]) -> TableRow {
        let cells = grid
            .iter()
            .enumerate()
            .map(|(c, &width)| {
                let lines = row.lines.get(c).map(Vec::as_slice).unwrap_or(&[]);
                let mut cell = self.text_cell(lines, false, width);
                for pic in row.pictures.iter().filter(|p| p.column == c) {
                    let emu_w = (pic.size.width as f32 * EMU_PER_PT) as u32;
                    let emu_h = (pic.size.height as f32 * EMU_PER_PT) as u32;
                    let image = Pic::new(&pic.bytes).size(emu_w, emu_h);
                    cell = cell.add_paragraph(Paragraph::new().add_run(Run::new().add_image(image)));
                }
                cell
            })
            .collect();
        let tr = TableRow::new(cells);
        match row.height {
            Some(h) => tr.row_height(twips(h) as f32).height_rule(HeightRule::AtLeast),
            None => tr,
        }
    }

    fn build(&self) -> Result<Vec<u8>, String> {
        let grid = self.grid();
        let total: usize = grid.iter().sum();

        let mut table_rows = Vec::with_capacity(self.rows.len() + 1);
        let header_cells = grid
            .iter()
            .enumerate()
            .map(|(c, &width)| {
                let header = self.headers.get(c).cloned().unwrap_or_default();
                self.text_cell(&[header], true, width)
            })
            .collect();
        table_rows.push(
            TableRow::new(header_cells)
                .row_height(twips(self.header_height) as f32)
                .height_rule(HeightRule::AtLeast),
        );
        for row in &self.rows {
            table_rows.push(self.data_row(row, &grid));
        }

        let table = Table::new(table_rows)
            .set_grid(grid)
            .layout(TableLayoutType::Fixed)
            .width(total, WidthType::Dxa);

        let margin = twips(self.margin) as i32;
        let orient = match self.orientation {
            PageOrientation::Portrait => PageOrientationType::Portrait,
            PageOrientation::Landscape => PageOrientationType::Landscape,
        };
        let docx = Docx::new()
            .page_size(twips(self.page_width) as u32, twips(self.page_height) as u32)
            .page_orient(orient)
            .page_margin(
                PageMargin::new()
                    .top(margin)
                    .bottom(margin)
                    .left(margin)
                    .right(margin),
            )
            .add_table(table);

        let mut buf = Cursor::new(Vec::new());
        docx.build()
            .pack(&mut buf)
            .map_err(|e| format!("failed to pack DOCX: {e}"))?;
        Ok(buf.into_inner())
    }
}

impl DocumentSink for DocxSink {
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
        if self.ledger.rows() > 0 {
            return Err(ExportError::Sink(
                "DOCX header row must precede data rows".to_string(),
            ));
        }
        self.headers = headers.to_vec();
        self.header_height = height;
        Ok(())
    }

    fn set_header_cell(&mut self, column: usize, _header: &str) -> ExportResult<()> {
        Err(ExportError::Sink(format!(
            "DOCX cannot rewrite header cell {column} after the header row is written"
        )))
    }

    fn add_data_row(&mut self, row: usize, cells: &[CellLayout]) -> ExportResult<()> {
        self.ledger.row_added(row)?;
        self.rows.push(Row {
            lines: cells.iter().map(|c| c.lines.clone()).collect(),
            ..Row::default()
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
        if row == 0 {
            return Err(ExportError::Sink("images cannot be placed in the header row".to_string()));
        }
        if !self.caps.accepted_images.contains(&image.kind) {
            return Err(ExportError::Sink(format!(
                "{} images cannot be embedded in DOCX",
                image.kind.extension()
            )));
        }
        self.rows[row - 1].pictures.push(Picture {
            column,
            size,
            bytes: image.bytes.clone(),
        });
        Ok(())
    }

    fn set_column_width(&mut self, column: usize, width: f32) -> ExportResult<()> {
        self.column_widths.insert(column, width);
        Ok(())
    }

    fn set_row_height(&mut self, row: usize, height: f32) -> ExportResult<()> {
        self.ledger.check_anchor(row)?;
        match row {
            0 => self.header_height = height,
            r => self.rows[r - 1].height = Some(height),
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> ExportResult<Vec<u8>> {
        debug!(
            "writing docx: {} rows, {} images",
            self.rows.len(),
            self.rows.iter().map(|r| r.pictures.len()).sum::<usize>()
        );
        self.build().map_err(|reason| ExportError::Finalize {
            format: ExportFormat::Docx,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::encode;
    use std::io::Read;

    fn document(bytes: &[u8]) -> String {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut part = archive.by_name("word/document.xml").unwrap();
        let mut out = String::new();
        part.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn writes_header_and_rows_on_a_fixed_grid() {
        let mut sink = Box::new(DocxSink::new(&ExportConfig::default()));
        sink.add_header_row(&["Name".into(), "Note".into()], &[], 20.0)
            .unwrap();
        sink.add_data_row(
            1,
            &[
                CellLayout { lines: vec!["Ada & Bob".into()], images: vec![] },
                CellLayout { lines: vec!["a".into(), "b".into()], images: vec![] },
            ],
        )
        .unwrap();
        sink.set_column_width(0, 100.0).unwrap();
        sink.set_column_width(1, 200.0).unwrap();
        assert_eq!(sink.grid(), vec![2000, 4000]);

        let bytes = sink.finalize().unwrap();
        assert_eq!(&bytes[0..2], b"PK");
        let xml = document(&bytes);
        assert!(xml.contains("Ada &amp; Bob"));
        assert!(xml.contains("Name"));
        assert!(xml.contains("landscape"));
    }

    #[test]
    fn unset_columns_share_the_content_width() {
        let config = ExportConfig::default();
        let mut sink = DocxSink::new(&config);
        sink.add_header_row(&["A".into(), "B".into()], &[], 20.0).unwrap();
        let grid = sink.grid();
        assert_eq!(grid.len(), 2);
        assert_eq!(grid[0], twips(config.content_width() / 2.0));
    }

    #[test]
    fn pictures_are_embedded_in_their_cell() {
        let mut sink = Box::new(DocxSink::new(&ExportConfig::default()));
        sink.add_header_row(&["Photo(1)".into()], &[], 20.0).unwrap();
        sink.add_data_row(1, &[CellLayout::default()]).unwrap();
        let image = EmbeddedImage {
            bytes: encode(3, 2, ::image::ImageFormat::Jpeg),
            kind: ImageKind::Jpeg,
            natural_width: 3,
            natural_height: 2,
        };
        sink.place_image(1, 0, &image, ImageSize { width: 30, height: 20 })
            .unwrap();
        assert_eq!(sink.rows[0].pictures.len(), 1);
        let xml = document(&sink.finalize().unwrap());
        assert!(xml.contains("w:drawing"));
    }

    #[test]
    fn header_cells_cannot_be_retrofitted() {
        let mut sink = DocxSink::new(&ExportConfig::default());
        assert!(!sink.capabilities().retrofit_headers);
        assert!(sink.set_header_cell(0, "x").is_err());
    }

    #[test]
    fn images_cannot_go_in_the_header() {
        let mut sink = DocxSink::new(&ExportConfig::default());
        sink.add_header_row(&["Photo(1)".into()], &[], 20.0).unwrap();
        let image = EmbeddedImage {
            bytes: Vec::new(),
            kind: ImageKind::Png,
            natural_width: 1,
            natural_height: 1,
        };
        assert!(sink.place_image(0, 0, &image, ImageSize { width: 1, height: 1 }).is_err());
    }
}
