//! Attachment transport – turns a resolved URL into bytes plus a content
//! type.
//!
//! [`HttpFetcher`] speaks HTTP(S) through `reqwest` and decodes base64
//! `data:` URIs locally, which is what offline datasets and tests use.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STD, Engine as _};
use log::debug;

use crate::error::FetchError;

/// Raw attachment payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBlob {
    pub bytes: Vec<u8>,
    /// MIME type reported by the transport, without parameters.
    pub content_type: Option<String>,
}

impl FetchedBlob {
    /// Reported content type, falling back to sniffing the magic bytes.
    pub fn effective_content_type(&self) -> Option<String> {
        if let Some(ct) = self.content_type.as_deref().filter(|ct| !ct.is_empty()) {
            return Some(ct.to_ascii_lowercase());
        }
        ::image::guess_format(&self.bytes)
            .ok()
            .map(|f| f.to_mime_type().to_string())
    }

    pub fn is_image(&self) -> bool {
        self.effective_content_type()
            .map(|ct| ct.starts_with("image/"))
            .unwrap_or(false)
    }
}

#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedBlob, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// `timeout` bounds each request end to end.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl BlobFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedBlob, FetchError> {
        if url.starts_with("data:") {
            return parse_data_uri(url);
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(FetchError::InvalidUrl(preview(url)));
        }
        debug!("fetching {}", preview(url));
        let response = self.client.get(url).send().await?.error_for_status()?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(mime_essence);
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedBlob {
            bytes,
            content_type,
        })
    }
}

/// `"image/png; charset=x"` → `"image/png"`.
fn mime_essence(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn preview(url: &str) -> String {
    url.chars().take(80).collect()
}

/// Parse a `data:<mime>;base64,<data>` URI.
pub fn parse_data_uri(src: &str) -> Result<FetchedBlob, FetchError> {
    let rest = src
        .strip_prefix("data:")
        .ok_or_else(|| FetchError::InvalidUrl(preview(src)))?;
    let (header, data) = rest.split_once(',').ok_or_else(|| {
        FetchError::InvalidUrl("data URI is missing the `,` separator".to_string())
    })?;
    if !header.contains(";base64") {
        return Err(FetchError::InvalidUrl(
            "only base64-encoded data URIs are supported".to_string(),
        ));
    }
    let bytes = BASE64_STD
        .decode(data.trim())
        .map_err(|e| FetchError::Decode(format!("base64: {e}")))?;
    let mime = mime_essence(header);
    Ok(FetchedBlob {
        bytes,
        content_type: (!mime.is_empty()).then_some(mime),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_base64_data_uri() {
        let blob = parse_data_uri("data:text/plain;base64,aGVsbG8=").unwrap();
        assert_eq!(blob.bytes, b"hello");
        assert_eq!(blob.content_type.as_deref(), Some("text/plain"));
        assert!(!blob.is_image());
    }

    #[test]
    fn rejects_non_base64_data_uri() {
        assert!(matches!(
            parse_data_uri("data:text/plain,hello"),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[test]
    fn sniffs_missing_content_type() {
        let png_magic = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let blob = FetchedBlob {
            bytes: png_magic,
            content_type: None,
        };
        assert_eq!(blob.effective_content_type().as_deref(), Some("image/png"));
        assert!(blob.is_image());
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let fetcher = HttpFetcher::default();
        assert!(matches!(
            fetcher.fetch("ftp://example.com/a.png").await,
            Err(FetchError::InvalidUrl(_))
        ));
    }
}
