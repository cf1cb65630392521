//! Export configuration – page geometry, typography, image bounds, font
//! sources and transport timeouts.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides:
//!
//! ```json
//! { "font_size": 9.0, "orientation": "portrait", "fetch_timeout_secs": 10 }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, ExportResult};

/// Output document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Xlsx,
    Docx,
    Pdf,
}

impl ExportFormat {
    /// File extension without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Docx => "docx",
            ExportFormat::Pdf => "pdf",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            ExportFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            ExportFormat::Pdf => "application/pdf",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportFormat::Xlsx => "XLSX",
            ExportFormat::Docx => "DOCX",
            ExportFormat::Pdf => "PDF",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xlsx" | "excel" => Ok(ExportFormat::Xlsx),
            "docx" | "word" => Ok(ExportFormat::Docx),
            "pdf" => Ok(ExportFormat::Pdf),
            other => Err(format!("unknown export format: {other}")),
        }
    }
}

/// Page orientation for the fixed-page backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageOrientation {
    Portrait,
    /// Tables are usually wider than tall, so landscape is the default.
    #[default]
    Landscape,
}

/// Upper and lower bounds for embedded image sizes, in the sink's units
/// (points for PDF/DOCX, pixels for XLSX).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageBounds {
    pub max_width: f32,
    pub max_height: f32,
    pub min_width: f32,
    pub min_height: f32,
}

impl ImageBounds {
    pub const fn new(max_width: f32, max_height: f32, min_width: f32, min_height: f32) -> Self {
        Self {
            max_width,
            max_height,
            min_width,
            min_height,
        }
    }
}

/// Where the PDF backend may find a TrueType font.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct FontSource {
    /// A TTF/OTF file on disk.
    pub path: Option<PathBuf>,
    /// Family names looked up among the installed system fonts.
    pub families: Vec<String>,
    /// Remote mirrors tried in order.
    pub urls: Vec<String>,
    /// Use builtin Helvetica (Latin only) when nothing else loads.
    pub allow_builtin: bool,
}

impl Default for FontSource {
    fn default() -> Self {
        Self {
            path: None,
            families: vec![
                "Noto Sans CJK SC".to_string(),
                "Source Han Sans SC".to_string(),
                "Microsoft YaHei".to_string(),
                "PingFang SC".to_string(),
                "WenQuanYi Micro Hei".to_string(),
            ],
            urls: Vec::new(),
            allow_builtin: true,
        }
    }
}

/// Configuration for one export run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Page width in points (default: A4 = 595.28).
    pub page_width: f32,
    /// Page height in points (default: A4 = 841.89).
    pub page_height: f32,
    /// Page margin in points (default: 40).
    pub page_margin: f32,
    pub orientation: PageOrientation,

    pub font_size: f32,
    pub header_font_size: f32,
    /// Line height as a multiple of the font size.
    pub line_height: f32,
    /// Padding on each side of a cell, in points.
    pub cell_padding: f32,
    pub min_column_width: f32,
    pub min_row_height: f32,
    /// Number of leading records sampled for column width estimation.
    pub sample_rows: usize,
    /// Vertical gap between images stacked in one cell.
    pub image_spacing: f32,

    pub pdf_images: ImageBounds,
    pub docx_images: ImageBounds,
    pub xlsx_images: ImageBounds,

    /// Fetch attachments and embed images; `false` writes file names only.
    pub embed_attachments: bool,
    pub fetch_timeout_secs: u64,
    pub backend_load_timeout_secs: u64,
    pub font: FontSource,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            page_width: 595.28,
            page_height: 841.89,
            page_margin: 40.0,
            orientation: PageOrientation::Landscape,
            font_size: 9.0,
            header_font_size: 9.0,
            line_height: 1.3,
            cell_padding: 4.0,
            min_column_width: 40.0,
            min_row_height: 15.0,
            sample_rows: 30,
            image_spacing: 4.0,
            pdf_images: ImageBounds::new(120.0, 90.0, 16.0, 16.0),
            docx_images: ImageBounds::new(120.0, 90.0, 16.0, 16.0),
            xlsx_images: ImageBounds::new(120.0, 90.0, 24.0, 24.0),
            embed_attachments: true,
            fetch_timeout_secs: 30,
            backend_load_timeout_secs: 8,
            font: FontSource::default(),
        }
    }
}

impl ExportConfig {
    /// Load a config from a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> ExportResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(json: &str) -> ExportResult<Self> {
        serde_json::from_str(json).map_err(|e| ExportError::Config(e.to_string()))
    }

    /// Effective page width after applying orientation.
    pub fn effective_width(&self) -> f32 {
        match self.orientation {
            PageOrientation::Portrait => self.page_width,
            PageOrientation::Landscape => self.page_height,
        }
    }

    /// Effective page height after applying orientation.
    pub fn effective_height(&self) -> f32 {
        match self.orientation {
            PageOrientation::Portrait => self.page_height,
            PageOrientation::Landscape => self.page_width,
        }
    }

    /// Width available to the table between the page margins.
    pub fn content_width(&self) -> f32 {
        (self.effective_width() - 2.0 * self.page_margin).max(0.0)
    }

    pub fn content_height(&self) -> f32 {
        (self.effective_height() - 2.0 * self.page_margin).max(0.0)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn backend_load_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_load_timeout_secs.max(1))
    }
}
