//! Data source abstraction – tables, views, fields, records and attachment
//! URLs.
//!
//! The required surface is small; everything a backend may or may not offer
//! (active table, views, field names) is an optional capability declared up
//! front through [`DataSource::capabilities`]. The [`SourceAdapter`] reads the
//! declaration once and never calls an optional method the source did not
//! announce.

mod adapter;
mod memory;

pub use adapter::{ExportScope, SourceAdapter};
pub use memory::MemorySource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SourceError, SourceResult};

pub type FieldId = String;
pub type RecordId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewInfo {
    pub id: String,
    pub name: String,
}

/// A field as seen by one export run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub id: FieldId,
    pub display_name: String,
    pub is_attachment: bool,
}

/// One file reference inside an attachment cell.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttachmentItem {
    #[serde(default)]
    pub token: String,
    #[serde(default, alias = "name")]
    pub file_name: String,
}

impl AttachmentItem {
    pub fn new(token: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            file_name: file_name.into(),
        }
    }

    /// Text written in place of the attachment when it cannot be embedded.
    pub fn fallback_text(&self) -> String {
        if self.file_name.trim().is_empty() {
            self.token.clone()
        } else {
            self.file_name.clone()
        }
    }
}

/// Optional capabilities a source may offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    /// `active_table` is implemented.
    pub active_table: bool,
    /// `list_views` and `active_view` are implemented.
    pub views: bool,
    /// `visible_field_ids` / `visible_record_ids` are implemented.
    pub view_scoped_lists: bool,
    /// `field_name` is implemented.
    pub field_names: bool,
}

/// The external dataset the exporter reads from.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Declares which optional methods are implemented.
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::default()
    }

    async fn list_tables(&self) -> SourceResult<Vec<TableInfo>>;

    async fn field_ids(&self, table: &str) -> SourceResult<Vec<FieldId>>;

    async fn record_ids(&self, table: &str) -> SourceResult<Vec<RecordId>>;

    /// Ids of the attachment-typed fields of `table`.
    async fn attachment_field_ids(&self, table: &str) -> SourceResult<Vec<FieldId>>;

    /// The ordered attachment list stored in one cell.
    async fn attachments(
        &self,
        table: &str,
        field: &str,
        record: &str,
    ) -> SourceResult<Vec<AttachmentItem>>;

    /// The display string of one cell; `None` for an empty cell.
    async fn cell_string(&self, table: &str, field: &str, record: &str)
        -> SourceResult<Option<String>>;

    /// Download URLs for a batch of tokens of one cell, positionally aligned
    /// with `tokens`. Unresolvable tokens map to `None`.
    async fn attachment_urls(
        &self,
        table: &str,
        field: &str,
        record: &str,
        tokens: &[String],
    ) -> SourceResult<Vec<Option<String>>>;

    async fn active_table(&self) -> SourceResult<Option<String>> {
        Err(SourceError::Unsupported("active_table"))
    }

    async fn list_views(&self, _table: &str) -> SourceResult<Vec<ViewInfo>> {
        Err(SourceError::Unsupported("list_views"))
    }

    async fn active_view(&self, _table: &str) -> SourceResult<Option<String>> {
        Err(SourceError::Unsupported("active_view"))
    }

    async fn visible_field_ids(&self, _table: &str, _view: &str) -> SourceResult<Vec<FieldId>> {
        Err(SourceError::Unsupported("visible_field_ids"))
    }

    async fn visible_record_ids(&self, _table: &str, _view: &str) -> SourceResult<Vec<RecordId>> {
        Err(SourceError::Unsupported("visible_record_ids"))
    }

    async fn field_name(&self, _table: &str, _field: &str) -> SourceResult<String> {
        Err(SourceError::Unsupported("field_name"))
    }
}

/// Render an arbitrary cell value as display text.
///
/// `null` becomes empty, arrays are joined with `,`, objects carrying a
/// string `text` member collapse to it and any other object is written as
/// JSON.
pub fn normalize_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(normalize_value)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(map) => match map.get("text") {
            Some(Value::String(text)) => text.clone(),
            _ => value.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_scalars_and_nulls() {
        assert_eq!(normalize_value(&Value::Null), "");
        assert_eq!(normalize_value(&json!("abc")), "abc");
        assert_eq!(normalize_value(&json!(12.5)), "12.5");
        assert_eq!(normalize_value(&json!(true)), "true");
    }

    #[test]
    fn normalize_arrays_and_objects() {
        assert_eq!(normalize_value(&json!(["a", 1, null])), "a,1,");
        assert_eq!(normalize_value(&json!({"text": "hello", "link": "x"})), "hello");
        assert_eq!(
            normalize_value(&json!([{"text": "a"}, {"text": "b"}])),
            "a,b"
        );
        assert_eq!(normalize_value(&json!({"id": 3})), r#"{"id":3}"#);
    }

    #[test]
    fn fallback_text_prefers_file_name() {
        assert_eq!(AttachmentItem::new("tok", "photo.png").fallback_text(), "photo.png");
        assert_eq!(AttachmentItem::new("tok", "  ").fallback_text(), "tok");
    }
}
