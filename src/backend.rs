//! Backend loader – resolves what a format needs before a sink can be built.
//!
//! XLSX and DOCX are written by this crate and always available. PDF needs a
//! TrueType font to render non-Latin text; it is looked up in order:
//!
//! 1. a font pre-loaded with [`BackendLoader::preload_font`]
//! 2. the configured font file
//! 3. installed system fonts, by family name (`fontdb`)
//! 4. remote mirrors, each bounded by the backend load timeout
//!
//! A successfully loaded font is cached per [`FontSource`] for the life of
//! the loader, so a run with a different font configuration does its own
//! lookup. [`BackendLoader::global`] is the process-wide instance. Concurrent
//! first loads of one source share one in-flight attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use log::{debug, info, warn};
use tokio::sync::OnceCell;

use crate::config::{ExportConfig, ExportFormat, FontSource};
use crate::error::{ExportError, ExportResult};
use crate::fetch::BlobFetcher;
use crate::fonts::FontData;

/// What a loaded backend hands to its sink.
#[derive(Debug, Clone, Default)]
pub struct BackendAssets {
    /// Embedded font for the PDF sink; `None` means builtin Helvetica.
    pub font: Option<FontData>,
}

#[derive(Default)]
pub struct BackendLoader {
    preloaded: RwLock<Option<FontData>>,
    pdf_fonts: Mutex<HashMap<FontSource, Arc<OnceCell<FontData>>>>,
}

impl BackendLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide loader.
    pub fn global() -> &'static BackendLoader {
        static GLOBAL: OnceLock<BackendLoader> = OnceLock::new();
        GLOBAL.get_or_init(BackendLoader::new)
    }

    /// Register font bytes to use ahead of any lookup.
    pub fn preload_font(&self, bytes: Vec<u8>) -> Result<(), String> {
        let font = FontData::parse(Arc::new(bytes))?;
        if let Ok(mut slot) = self.preloaded.write() {
            *slot = Some(font);
        }
        Ok(())
    }

    fn font_cell(&self, source: &FontSource) -> Arc<OnceCell<FontData>> {
        let mut cells = self
            .pdf_fonts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cells.entry(source.clone()).or_default().clone()
    }

    pub async fn load(
        &self,
        format: ExportFormat,
        config: &ExportConfig,
        fetcher: &dyn BlobFetcher,
    ) -> ExportResult<BackendAssets> {
        match format {
            ExportFormat::Xlsx | ExportFormat::Docx => Ok(BackendAssets::default()),
            ExportFormat::Pdf => self.load_pdf(config, fetcher).await,
        }
    }

    async fn load_pdf(
        &self,
        config: &ExportConfig,
        fetcher: &dyn BlobFetcher,
    ) -> ExportResult<BackendAssets> {
        if let Some(font) = self.preloaded.read().ok().and_then(|slot| slot.clone()) {
            debug!("using pre-loaded PDF font");
            return Ok(BackendAssets { font: Some(font) });
        }

        let cell = self.font_cell(&config.font);
        let loaded = cell
            .get_or_try_init(|| discover_font(config, fetcher))
            .await;
        match loaded {
            Ok(font) => Ok(BackendAssets {
                font: Some(font.clone()),
            }),
            Err(reason) if config.font.allow_builtin => {
                warn!("{reason}; falling back to builtin Helvetica (Latin text only)");
                Ok(BackendAssets { font: None })
            }
            Err(reason) => Err(ExportError::BackendUnavailable {
                format: ExportFormat::Pdf,
                reason,
            }),
        }
    }
}

async fn discover_font(config: &ExportConfig, fetcher: &dyn BlobFetcher) -> Result<FontData, String> {
    let source = &config.font;

    if let Some(path) = &source.path {
        match tokio::fs::read(path).await {
            Ok(bytes) => match FontData::parse(Arc::new(bytes)) {
                Ok(font) => {
                    info!("PDF font loaded from {}", path.display());
                    return Ok(font);
                }
                Err(e) => warn!("font file {} unusable: {e}", path.display()),
            },
            Err(e) => warn!("font file {} unreadable: {e}", path.display()),
        }
    }

    if !source.families.is_empty() {
        if let Some(font) = system_font(&source.families) {
            return Ok(font);
        }
    }

    let timeout = config.backend_load_timeout();
    for url in &source.urls {
        match tokio::time::timeout(timeout, fetcher.fetch(url)).await {
            Ok(Ok(blob)) => match FontData::parse(Arc::new(blob.bytes)) {
                Ok(font) => {
                    info!("PDF font fetched from {url}");
                    return Ok(font);
                }
                Err(e) => warn!("font from {url} unusable: {e}"),
            },
            Ok(Err(e)) => warn!("font mirror {url} failed: {e}"),
            Err(_) => warn!("font mirror {url} timed out after {timeout:?}"),
        }
    }

    Err(format!(
        "no usable PDF font (file: {}, {} system families, {} mirrors tried)",
        if source.path.is_some() { "unusable" } else { "none" },
        source.families.len(),
        source.urls.len()
    ))
}

/// First installed face matching one of `families`, in preference order.
fn system_font(families: &[String]) -> Option<FontData> {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    debug!("{} system font faces discovered", db.len());

    families.iter().find_map(|family| {
        let query = fontdb::Query {
            families: &[fontdb::Family::Name(family)],
            ..fontdb::Query::default()
        };
        let id = db.query(&query)?;
        let (bytes, index) = db.with_face_data(id, |data, index| (data.to_vec(), index))?;
        match FontData::parse_indexed(Arc::new(bytes), index) {
            Ok(font) => {
                info!("PDF font: system family {family}");
                Some(font)
            }
            Err(e) => {
                warn!("system font {family} unusable: {e}");
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FontSource;
    use crate::error::FetchError;
    use crate::fetch::FetchedBlob;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Never answers, like a dead mirror.
    struct HangingFetcher;

    #[async_trait]
    impl BlobFetcher for HangingFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedBlob, FetchError> {
            std::future::pending().await
        }
    }

    fn no_fonts(allow_builtin: bool) -> ExportConfig {
        ExportConfig {
            backend_load_timeout_secs: 1,
            font: FontSource {
                path: Some("/nonexistent/font.ttf".into()),
                families: Vec::new(),
                urls: vec!["https://mirror.invalid/font.ttf".into()],
                allow_builtin,
            },
            ..ExportConfig::default()
        }
    }

    #[tokio::test]
    async fn office_formats_are_built_in() {
        let loader = BackendLoader::new();
        let assets = loader
            .load(ExportFormat::Xlsx, &no_fonts(false), &HangingFetcher)
            .await
            .unwrap();
        assert!(assets.font.is_none());
    }

    #[tokio::test]
    async fn missing_font_is_fatal_without_builtin_fallback() {
        let loader = BackendLoader::new();
        let err = loader
            .load(ExportFormat::Pdf, &no_fonts(false), &HangingFetcher)
            .await
            .unwrap_err();
        match err {
            ExportError::BackendUnavailable { format, reason } => {
                assert_eq!(format, ExportFormat::Pdf);
                assert!(reason.contains("no usable PDF font"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_font_falls_back_to_builtin() {
        let loader = BackendLoader::new();
        let assets = loader
            .load(ExportFormat::Pdf, &no_fonts(true), &HangingFetcher)
            .await
            .unwrap();
        assert!(assets.font.is_none());
    }

    /// The smallest face ttf-parser accepts: `head`, `hhea` and `maxp` only.
    fn tiny_font(units_per_em: u16) -> Vec<u8> {
        let mut head = vec![0u8; 54];
        head[18..20].copy_from_slice(&units_per_em.to_be_bytes());
        let mut hhea = vec![0u8; 36];
        hhea[4..6].copy_from_slice(&800i16.to_be_bytes());
        let maxp = [0x00, 0x00, 0x50, 0x00, 0x00, 0x01];

        let mut font = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0, 0, 0, 0, 0, 0];
        let mut offset = 12 + 3 * 16;
        for (tag, table) in [(b"head", &head[..]), (b"hhea", &hhea[..]), (b"maxp", &maxp[..])] {
            font.extend_from_slice(tag);
            font.extend_from_slice(&[0; 4]);
            font.extend_from_slice(&(offset as u32).to_be_bytes());
            font.extend_from_slice(&(table.len() as u32).to_be_bytes());
            offset += table.len();
        }
        font.extend_from_slice(&head);
        font.extend_from_slice(&hhea);
        font.extend_from_slice(&maxp);
        font
    }

    /// Serves a font whose units-per-em is the number at the end of the URL.
    #[derive(Default)]
    struct FontMirror {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlobFetcher for FontMirror {
        async fn fetch(&self, url: &str) -> Result<FetchedBlob, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let units = url
                .rsplit('/')
                .next()
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
            Ok(FetchedBlob {
                bytes: tiny_font(units),
                content_type: Some("font/ttf".into()),
            })
        }
    }

    fn mirror_config(url: &str) -> ExportConfig {
        ExportConfig {
            font: FontSource {
                path: None,
                families: Vec::new(),
                urls: vec![url.to_string()],
                allow_builtin: false,
            },
            ..ExportConfig::default()
        }
    }

    #[tokio::test]
    async fn fonts_are_cached_per_font_source() {
        let loader = BackendLoader::new();
        let mirror = FontMirror::default();
        let first = mirror_config("https://fonts.test/1000");
        let second = mirror_config("https://fonts.test/2048");

        let (loader, mirror) = (&loader, &mirror);
        let load = move |config: ExportConfig| async move {
            loader
                .load(ExportFormat::Pdf, &config, mirror)
                .await
                .unwrap()
                .font
                .unwrap()
                .units_per_em
        };

        assert_eq!(load(first.clone()).await, 1000.0);
        assert_eq!(load(second).await, 2048.0);
        assert_eq!(load(first).await, 1000.0);
        assert_eq!(mirror.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn preload_rejects_garbage() {
        assert!(BackendLoader::new().preload_font(vec![1, 2, 3]).is_err());
    }
}
