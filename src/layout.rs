//! Layout engine – column widths, text wrapping and row heights for the
//! export table.
//!
//! All sizes are in points. Image sizes come from the [`scaler`] in sink
//! units and are converted to points with the sink's `image_unit_pt`.
//!
//! [`scaler`]: crate::scaler

use serde::Serialize;

use crate::config::{ExportConfig, ImageBounds};
use crate::fonts::{wrap_text, TextMeasure};
use crate::resolver::ResolvedCell;
use crate::scaler::{scale_image, ImageSize};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LayoutOptions {
    pub font_size: f32,
    pub header_font_size: f32,
    pub line_height: f32,
    pub cell_padding: f32,
    pub min_column_width: f32,
    pub min_row_height: f32,
    pub sample_rows: usize,
    pub image_spacing: f32,
}

impl From<&ExportConfig> for LayoutOptions {
    fn from(cfg: &ExportConfig) -> Self {
        Self {
            font_size: cfg.font_size,
            header_font_size: cfg.header_font_size,
            line_height: cfg.line_height,
            cell_padding: cfg.cell_padding,
            min_column_width: cfg.min_column_width,
            min_row_height: cfg.min_row_height,
            sample_rows: cfg.sample_rows,
            image_spacing: cfg.image_spacing,
        }
    }
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self::from(&ExportConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Layout results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CellLayout {
    pub lines: Vec<String>,
    /// Stacked top to bottom, in sink units.
    pub images: Vec<ImageSize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowLayout {
    pub height: f32,
    pub cells: Vec<CellLayout>,
}

/// The derived layout of a whole table. Never persisted; serialisable for
/// inspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayoutPlan {
    pub column_widths: Vec<f32>,
    pub header_lines: Vec<Vec<String>>,
    pub header_height: f32,
    pub rows: Vec<RowLayout>,
    /// Indexes of rows that start a new page (paginated sinks only).
    pub page_breaks: Vec<usize>,
}

impl LayoutPlan {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Column width allocation
// ---------------------------------------------------------------------------

/// Distribute `available` among columns in proportion to their desired
/// widths, keeping every column at or above `min_width` when possible.
///
/// The result always sums to `available`. When even the minimum widths do not
/// fit, every column gets an equal share instead.
pub fn allocate_column_widths(desired: &[f32], available: f32, min_width: f32) -> Vec<f32> {
    let n = desired.len();
    if n == 0 {
        return Vec::new();
    }
    let available = available.max(0.0);
    if min_width * n as f32 > available {
        return vec![available / n as f32; n];
    }

    let total: f32 = desired.iter().map(|d| d.max(0.0)).sum();
    let mut widths: Vec<f32> = if total > 0.0 {
        desired
            .iter()
            .map(|d| d.max(0.0) / total * available)
            .collect()
    } else {
        vec![available / n as f32; n]
    };

    // Lift narrow columns to the minimum, paid for by columns with slack.
    let deficit: f32 = widths.iter().map(|w| (min_width - w).max(0.0)).sum();
    if deficit > 0.0 {
        let slack: Vec<f32> = widths.iter().map(|w| (w - min_width).max(0.0)).collect();
        let total_slack: f32 = slack.iter().sum();
        for (w, s) in widths.iter_mut().zip(&slack) {
            if *w < min_width {
                *w = min_width;
            } else if total_slack > 0.0 {
                *w -= deficit * s / total_slack;
            }
        }
    }

    // Rounding residual goes to the last column.
    let residual = available - widths.iter().sum::<f32>();
    if let Some(last) = widths.last_mut() {
        *last += residual;
    }
    widths
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct LayoutEngine<'a> {
    measure: &'a dyn TextMeasure,
    opts: LayoutOptions,
    bounds: ImageBounds,
    /// Points per image size unit (1 for point-based sinks).
    image_unit_pt: f32,
}

impl<'a> LayoutEngine<'a> {
    pub fn new(
        measure: &'a dyn TextMeasure,
        opts: LayoutOptions,
        bounds: ImageBounds,
        image_unit_pt: f32,
    ) -> Self {
        Self {
            measure,
            opts,
            bounds,
            image_unit_pt,
        }
    }

    pub fn options(&self) -> &LayoutOptions {
        &self.opts
    }

    /// Desired width of a column: the widest of its header and sampled cell
    /// lines, plus padding, floored at the minimum column width.
    pub fn desired_width<'s>(&self, header: &str, samples: impl IntoIterator<Item = &'s str>) -> f32 {
        let pad = 2.0 * self.opts.cell_padding;
        let header_w = widest_line(header, self.opts.header_font_size, true, self.measure);
        let cell_w = samples
            .into_iter()
            .map(|s| widest_line(s, self.opts.font_size, false, self.measure))
            .fold(0.0f32, f32::max);
        (header_w.max(cell_w) + pad).max(self.opts.min_column_width)
    }

    /// Desired widths for every column from the headers and the first
    /// `sample_rows` rows.
    pub fn desired_widths(&self, headers: &[String], rows: &[Vec<ResolvedCell>]) -> Vec<f32> {
        let sample = &rows[..rows.len().min(self.opts.sample_rows)];
        headers
            .iter()
            .enumerate()
            .map(|(col, header)| {
                let texts = sample
                    .iter()
                    .map(move |row| row.get(col).map(ResolvedCell::text).unwrap_or(""));
                let mut width = self.desired_width(header, texts);
                // A column must at least hold its widest sampled image.
                let image_w = sample
                    .iter()
                    .filter_map(|row| row.get(col).and_then(ResolvedCell::image))
                    .map(|img| {
                        scale_image(img.natural_width, img.natural_height, &self.bounds, f32::INFINITY)
                            .width as f32
                            * self.image_unit_pt
                    })
                    .fold(0.0f32, f32::max);
                if image_w > 0.0 {
                    width = width.max(image_w + 2.0 * self.opts.cell_padding);
                }
                width
            })
            .collect()
    }

    /// Widens columns so every image placed in `rows` fits with its padding.
    /// Streaming sinks size columns from samples only, so images beyond the
    /// sample window are accounted for here.
    pub fn fit_placed_images(&self, widths: &mut [f32], rows: &[RowLayout]) {
        let pad = 2.0 * self.opts.cell_padding;
        for row in rows {
            for (width, cell) in widths.iter_mut().zip(&row.cells) {
                for image in &cell.images {
                    *width = width.max(image.width as f32 * self.image_unit_pt + pad);
                }
            }
        }
    }

    /// Final column widths: proportional within `content_width` when the sink
    /// has a fixed width, the desired widths otherwise.
    pub fn column_widths(
        &self,
        headers: &[String],
        rows: &[Vec<ResolvedCell>],
        content_width: Option<f32>,
    ) -> Vec<f32> {
        let desired = self.desired_widths(headers, rows);
        match content_width {
            Some(available) => {
                allocate_column_widths(&desired, available, self.opts.min_column_width)
            }
            None => desired,
        }
    }

    pub fn inner_width(&self, column_width: f32) -> f32 {
        (column_width - 2.0 * self.opts.cell_padding).max(1.0)
    }

    pub fn wrap_header(&self, header: &str, column_width: f32) -> Vec<String> {
        wrap_text(
            header,
            self.opts.header_font_size,
            true,
            self.inner_width(column_width),
            self.measure,
        )
    }

    /// Height of the header row: the tallest wrapped header.
    pub fn header_height(&self, header_lines: &[Vec<String>]) -> f32 {
        let lh = self
            .measure
            .line_height(self.opts.header_font_size, self.opts.line_height);
        let max_lines = header_lines.iter().map(Vec::len).max().unwrap_or(1).max(1);
        (max_lines as f32 * lh + 2.0 * self.opts.cell_padding).max(self.opts.min_row_height)
    }

    /// Lay out one data row. `widths` caps image widths (and text when
    /// `wrap` is set); without wrapping a cell keeps its own line breaks only.
    pub fn layout_row(&self, cells: &[ResolvedCell], widths: Option<&[f32]>, wrap: bool) -> RowLayout {
        let lh = self.measure.line_height(self.opts.font_size, self.opts.line_height);
        let pad = 2.0 * self.opts.cell_padding;
        let mut height = self.opts.min_row_height;

        let cells: Vec<CellLayout> = cells
            .iter()
            .enumerate()
            .map(|(col, cell)| {
                let width = widths.and_then(|w| w.get(col).copied());
                let lines = match (cell, width) {
                    (ResolvedCell::Text(text), Some(w)) if wrap => {
                        wrap_text(text, self.opts.font_size, false, self.inner_width(w), self.measure)
                    }
                    (ResolvedCell::Text(text), _) => text.split('\n').map(str::to_string).collect(),
                    _ => Vec::new(),
                };
                let images: Vec<ImageSize> = cell
                    .image()
                    .map(|img| {
                        let available = width
                            .map(|w| self.inner_width(w) / self.image_unit_pt)
                            .unwrap_or(f32::INFINITY);
                        vec![scale_image(img.natural_width, img.natural_height, &self.bounds, available)]
                    })
                    .unwrap_or_default();

                if !lines.is_empty() {
                    height = height.max(lines.len() as f32 * lh + pad);
                }
                if !images.is_empty() {
                    height = height.max(self.stacked_height(&images) + pad);
                }
                CellLayout { lines, images }
            })
            .collect();

        RowLayout { height, cells }
    }

    /// Height of images stacked vertically with the fixed spacing, in points.
    pub fn stacked_height(&self, images: &[ImageSize]) -> f32 {
        let sum: f32 = images
            .iter()
            .map(|s| s.height as f32 * self.image_unit_pt)
            .sum();
        sum + self.opts.image_spacing * images.len().saturating_sub(1) as f32
    }
}

fn widest_line(text: &str, font_size: f32, bold: bool, measure: &dyn TextMeasure) -> f32 {
    text.split('\n')
        .map(|line| measure.text_width(line, font_size, bold))
        .fold(0.0f32, f32::max)
}
