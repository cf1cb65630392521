//! Attachment resolver – turns a record's attachment lists into embedded
//! images or fallback text.
//!
//! Per record, every fetch-and-decode task of every attachment field runs
//! under one record-level window; each field's own items are further limited
//! by a field-level window. URL lookups pass through the same windows as the
//! fetches. Results are written back by list position, so completion order
//! never matters.

use std::io::Cursor;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, warn};

use crate::error::FetchError;
use crate::executor::{field_window, record_window, BoundedExecutor, Tiers};
use crate::fetch::BlobFetcher;
use crate::source::{AttachmentItem, FieldId, SourceAdapter};

/// Image encodings a sink can embed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ImageKind {
    Png,
    Jpeg,
    Gif,
}

impl ImageKind {
    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Png => "png",
            ImageKind::Jpeg => "jpeg",
            ImageKind::Gif => "gif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageKind::Png => "image/png",
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Gif => "image/gif",
        }
    }

    fn from_format(format: ::image::ImageFormat) -> Option<Self> {
        match format {
            ::image::ImageFormat::Png => Some(ImageKind::Png),
            ::image::ImageFormat::Jpeg => Some(ImageKind::Jpeg),
            ::image::ImageFormat::Gif => Some(ImageKind::Gif),
            _ => None,
        }
    }
}

/// An image ready to embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedImage {
    pub bytes: Vec<u8>,
    pub kind: ImageKind,
    pub natural_width: u32,
    pub natural_height: u32,
}

/// Content of one output cell.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResolvedCell {
    #[default]
    Empty,
    Text(String),
    Image(EmbeddedImage),
}

impl ResolvedCell {
    /// Text shown in the cell; images contribute none.
    pub fn text(&self) -> &str {
        match self {
            ResolvedCell::Text(s) => s,
            _ => "",
        }
    }

    pub fn image(&self) -> Option<&EmbeddedImage> {
        match self {
            ResolvedCell::Image(img) => Some(img),
            _ => None,
        }
    }
}

/// One attachment field's list for the record being resolved.
#[derive(Debug, Clone)]
pub struct AttachmentCell {
    pub field_id: FieldId,
    pub items: Vec<AttachmentItem>,
}

pub struct AttachmentResolver<'a> {
    source: &'a SourceAdapter,
    fetcher: &'a dyn BlobFetcher,
    table: &'a str,
    embed: bool,
    accepted: &'a [ImageKind],
    fetch_timeout: Duration,
}

impl<'a> AttachmentResolver<'a> {
    pub fn new(
        source: &'a SourceAdapter,
        fetcher: &'a dyn BlobFetcher,
        table: &'a str,
        accepted: &'a [ImageKind],
    ) -> Self {
        Self {
            source,
            fetcher,
            table,
            embed: true,
            accepted,
            fetch_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_embedding(mut self, embed: bool) -> Self {
        self.embed = embed;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Resolve every attachment cell of `record`. The outer result is aligned
    /// with `cells`, each inner one with that cell's item list.
    pub async fn resolve_record(
        &self,
        record: &str,
        cells: &[AttachmentCell],
    ) -> Vec<Vec<ResolvedCell>> {
        if !self.embed {
            return cells
                .iter()
                .map(|cell| cell.items.iter().map(|item| self.offline(item)).collect())
                .collect();
        }

        let total: usize = cells.iter().map(|c| c.items.len()).sum();
        let record_exec = BoundedExecutor::new(record_window(total));
        debug!(
            "record {record}: {total} attachments, window {}",
            record_exec.window()
        );

        let field_execs: Vec<BoundedExecutor> = cells
            .iter()
            .map(|c| BoundedExecutor::new(field_window(c.items.len())))
            .collect();
        let (record_exec, field_execs) = (&record_exec, &field_execs);
        let tiers = move |ci: usize| Tiers {
            record: record_exec,
            field: &field_execs[ci],
        };

        let urls = join_all(cells.iter().enumerate().map(|(ci, cell)| {
            let tokens: Vec<String> = cell.items.iter().map(|i| i.token.clone()).collect();
            async move {
                self.source
                    .resolve_urls(self.table, &cell.field_id, record, &tokens, tiers(ci))
                    .await
            }
        }))
        .await;

        let mut tasks = Vec::with_capacity(total);
        for ((ci, cell), cell_urls) in cells.iter().enumerate().zip(&urls) {
            let cell_tiers = tiers(ci);
            for (slot, item) in cell.items.iter().enumerate() {
                let url = cell_urls.get(slot).cloned().flatten();
                tasks.push(async move {
                    let resolved = cell_tiers.run(self.resolve_item(item, url)).await;
                    (ci, slot, resolved)
                });
            }
        }

        let mut out: Vec<Vec<ResolvedCell>> = cells
            .iter()
            .map(|c| vec![ResolvedCell::Empty; c.items.len()])
            .collect();
        for (ci, slot, resolved) in join_all(tasks).await {
            out[ci][slot] = resolved;
        }
        out
    }

    fn offline(&self, item: &AttachmentItem) -> ResolvedCell {
        if item.token.is_empty() && item.file_name.is_empty() {
            ResolvedCell::Empty
        } else {
            ResolvedCell::Text(item.fallback_text())
        }
    }

    async fn resolve_item(&self, item: &AttachmentItem, url: Option<String>) -> ResolvedCell {
        if item.token.is_empty() {
            return ResolvedCell::Empty;
        }
        let Some(url) = url else {
            debug!("no url for attachment {}, writing its name", item.token);
            return ResolvedCell::Text(item.fallback_text());
        };
        match self.fetch_image(&url).await {
            Ok(Some(image)) => ResolvedCell::Image(image),
            Ok(None) => ResolvedCell::Text(item.fallback_text()),
            Err(e) => {
                warn!("attachment {} falls back to text: {e}", item.token);
                ResolvedCell::Text(item.fallback_text())
            }
        }
    }

    /// `Ok(None)` when the payload is not an image.
    async fn fetch_image(&self, url: &str) -> Result<Option<EmbeddedImage>, FetchError> {
        let blob = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(url))
            .await
            .map_err(|_| FetchError::Timeout(self.fetch_timeout))??;
        if !blob.is_image() {
            return Ok(None);
        }
        prepare_image(blob.bytes, self.accepted).map(Some)
    }
}

/// Read dimensions and, when the encoding is not in `accepted`, decode and
/// re-encode losslessly as PNG.
pub fn prepare_image(bytes: Vec<u8>, accepted: &[ImageKind]) -> Result<EmbeddedImage, FetchError> {
    let format = ::image::guess_format(&bytes).map_err(|e| FetchError::Decode(e.to_string()))?;

    if let Some(kind) = ImageKind::from_format(format).filter(|k| accepted.contains(k)) {
        let (natural_width, natural_height) = ::image::ImageReader::with_format(
            Cursor::new(&bytes),
            format,
        )
        .into_dimensions()
        .map_err(|e| FetchError::Decode(e.to_string()))?;
        return Ok(EmbeddedImage {
            bytes,
            kind,
            natural_width,
            natural_height,
        });
    }

    debug!("re-encoding {format:?} attachment as PNG");
    let decoded = ::image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| FetchError::Decode(e.to_string()))?;
    let mut png = Vec::new();
    decoded
        .write_to(&mut Cursor::new(&mut png), ::image::ImageFormat::Png)
        .map_err(|e| FetchError::Decode(e.to_string()))?;
    Ok(EmbeddedImage {
        bytes: png,
        kind: ImageKind::Png,
        natural_width: decoded.width(),
        natural_height: decoded.height(),
    })
}
