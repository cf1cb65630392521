//! In-memory data source, typically deserialised from a JSON dataset file.
//!
//! ```json
//! {
//!   "active_table": "t1",
//!   "tables": [{
//!     "id": "t1", "name": "Orders", "active_view": "v1",
//!     "fields": [
//!       { "id": "f1", "name": "Customer" },
//!       { "id": "f2", "name": "Photos", "type": "attachment" }
//!     ],
//!     "views": [{ "id": "v1", "name": "Grid", "fields": ["f1", "f2"] }],
//!     "records": [{
//!       "id": "r1",
//!       "cells": {
//!         "f1": "Alice",
//!         "f2": [{ "token": "tk1", "name": "a.png", "url": "data:image/png;base64,..." }]
//!       }
//!     }]
//!   }]
//! }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{
    normalize_value, AttachmentItem, DataSource, FieldId, RecordId, SourceCapabilities, TableInfo,
    ViewInfo,
};
use crate::error::{SourceError, SourceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Attachment,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryField {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryView {
    pub id: String,
    pub name: String,
    /// Visible field ids; all fields when absent.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// Visible record ids; all records when absent.
    #[serde(default)]
    pub records: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    #[serde(default)]
    pub cells: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryTable {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub active_view: Option<String>,
    pub fields: Vec<MemoryField>,
    #[serde(default)]
    pub views: Vec<MemoryView>,
    #[serde(default)]
    pub records: Vec<MemoryRecord>,
}

/// A complete dataset held in memory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemorySource {
    #[serde(default)]
    pub active_table: Option<String>,
    pub tables: Vec<MemoryTable>,
}

impl MemorySource {
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| e.to_string())
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }

    fn table(&self, id: &str) -> SourceResult<&MemoryTable> {
        self.tables
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| SourceError::NotFound(format!("table {id}")))
    }

    fn view<'a>(&self, table: &'a MemoryTable, id: &str) -> SourceResult<&'a MemoryView> {
        table
            .views
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| SourceError::NotFound(format!("view {id}")))
    }

    fn cell<'a>(&self, table: &'a MemoryTable, field: &str, record: &str) -> SourceResult<Option<&'a Value>> {
        let record = table
            .records
            .iter()
            .find(|r| r.id == record)
            .ok_or_else(|| SourceError::NotFound(format!("record {record}")))?;
        Ok(record.cells.get(field))
    }
}

/// Attachment cells hold either a list of items or a single item object.
fn attachment_entries(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn str_member<'a>(entry: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| entry.get(*k).and_then(Value::as_str))
}

#[async_trait]
impl DataSource for MemorySource {
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            active_table: true,
            views: true,
            view_scoped_lists: true,
            field_names: true,
        }
    }

    async fn list_tables(&self) -> SourceResult<Vec<TableInfo>> {
        Ok(self
            .tables
            .iter()
            .map(|t| TableInfo {
                id: t.id.clone(),
                name: t.name.clone(),
            })
            .collect())
    }

    async fn field_ids(&self, table: &str) -> SourceResult<Vec<FieldId>> {
        Ok(self.table(table)?.fields.iter().map(|f| f.id.clone()).collect())
    }

    async fn record_ids(&self, table: &str) -> SourceResult<Vec<RecordId>> {
        Ok(self.table(table)?.records.iter().map(|r| r.id.clone()).collect())
    }

    async fn attachment_field_ids(&self, table: &str) -> SourceResult<Vec<FieldId>> {
        Ok(self
            .table(table)?
            .fields
            .iter()
            .filter(|f| f.kind == FieldKind::Attachment)
            .map(|f| f.id.clone())
            .collect())
    }

    async fn attachments(
        &self,
        table: &str,
        field: &str,
        record: &str,
    ) -> SourceResult<Vec<AttachmentItem>> {
        let table = self.table(table)?;
        let Some(value) = self.cell(table, field, record)? else {
            return Ok(Vec::new());
        };
        Ok(attachment_entries(value)
            .into_iter()
            .map(|entry| AttachmentItem {
                token: str_member(entry, &["token"]).unwrap_or_default().to_string(),
                file_name: str_member(entry, &["name", "file_name"])
                    .map(str::to_string)
                    .unwrap_or_else(|| normalize_value(entry)),
            })
            .collect())
    }

    async fn cell_string(
        &self,
        table: &str,
        field: &str,
        record: &str,
    ) -> SourceResult<Option<String>> {
        let table = self.table(table)?;
        Ok(self
            .cell(table, field, record)?
            .map(normalize_value)
            .filter(|s| !s.is_empty()))
    }

    async fn attachment_urls(
        &self,
        table: &str,
        field: &str,
        record: &str,
        tokens: &[String],
    ) -> SourceResult<Vec<Option<String>>> {
        let table = self.table(table)?;
        let entries = self
            .cell(table, field, record)?
            .map(attachment_entries)
            .unwrap_or_default();
        Ok(tokens
            .iter()
            .map(|token| {
                entries
                    .iter()
                    .find(|e| str_member(e, &["token"]) == Some(token.as_str()))
                    .and_then(|e| str_member(e, &["url"]))
                    .map(str::to_string)
            })
            .collect())
    }

    async fn active_table(&self) -> SourceResult<Option<String>> {
        Ok(self.active_table.clone())
    }

    async fn list_views(&self, table: &str) -> SourceResult<Vec<ViewInfo>> {
        Ok(self
            .table(table)?
            .views
            .iter()
            .map(|v| ViewInfo {
                id: v.id.clone(),
                name: v.name.clone(),
            })
            .collect())
    }

    async fn active_view(&self, table: &str) -> SourceResult<Option<String>> {
        Ok(self.table(table)?.active_view.clone())
    }

    async fn visible_field_ids(&self, table: &str, view: &str) -> SourceResult<Vec<FieldId>> {
        let t = self.table(table)?;
        match &self.view(t, view)?.fields {
            Some(ids) => Ok(ids.clone()),
            None => self.field_ids(table).await,
        }
    }

    async fn visible_record_ids(&self, table: &str, view: &str) -> SourceResult<Vec<RecordId>> {
        let t = self.table(table)?;
        match &self.view(t, view)?.records {
            Some(ids) => Ok(ids.clone()),
            None => self.record_ids(table).await,
        }
    }

    async fn field_name(&self, table: &str, field: &str) -> SourceResult<String> {
        let t = self.table(table)?;
        let f = t
            .fields
            .iter()
            .find(|f| f.id == field)
            .ok_or_else(|| SourceError::NotFound(format!("field {field}")))?;
        Ok(f.name.clone().unwrap_or_else(|| f.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATASET: &str = r#"{
        "tables": [{
            "id": "t1", "name": "Orders", "active_view": "v1",
            "fields": [
                { "id": "f1", "name": "Customer" },
                { "id": "f2", "name": "Photos", "type": "attachment" },
                { "id": "f3" }
            ],
            "views": [{ "id": "v1", "name": "Grid", "fields": ["f2", "f1"], "records": ["r2"] }],
            "records": [
                { "id": "r1", "cells": { "f1": "Alice", "f2": { "token": "solo", "name": "x.png" } } },
                { "id": "r2", "cells": {
                    "f1": { "text": "Bob" },
                    "f2": [
                        { "token": "a", "name": "a.png", "url": "https://cdn/a" },
                        { "token": "b", "name": "b.pdf" }
                    ]
                } }
            ]
        }]
    }"#;

    #[tokio::test]
    async fn reads_views_and_cells() {
        let src = MemorySource::from_json(DATASET).unwrap();
        assert_eq!(src.visible_field_ids("t1", "v1").await.unwrap(), vec!["f2", "f1"]);
        assert_eq!(src.visible_record_ids("t1", "v1").await.unwrap(), vec!["r2"]);
        assert_eq!(src.cell_string("t1", "f1", "r2").await.unwrap().as_deref(), Some("Bob"));
        assert_eq!(src.cell_string("t1", "f3", "r2").await.unwrap(), None);
        assert_eq!(src.field_name("t1", "f3").await.unwrap(), "f3");
        assert_eq!(src.attachment_field_ids("t1").await.unwrap(), vec!["f2"]);
    }

    #[tokio::test]
    async fn single_attachment_object_is_a_one_item_list() {
        let src = MemorySource::from_json(DATASET).unwrap();
        let items = src.attachments("t1", "f2", "r1").await.unwrap();
        assert_eq!(items, vec![AttachmentItem::new("solo", "x.png")]);
    }

    #[tokio::test]
    async fn urls_follow_token_order() {
        let src = MemorySource::from_json(DATASET).unwrap();
        let urls = src
            .attachment_urls("t1", "f2", "r2", &["b".into(), "a".into(), "zz".into()])
            .await
            .unwrap();
        assert_eq!(urls, vec![None, Some("https://cdn/a".to_string()), None]);
    }
}
