//! Capability-aware wrapper around a [`DataSource`].
//!
//! All fallbacks of the read path live here: missing active table → first
//! table, missing view → unfiltered lists, failed cell reads → empty text,
//! unresolved attachment URLs → one individual retry.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, warn};

use super::{AttachmentItem, DataSource, FieldDescriptor, FieldId, RecordId, SourceCapabilities};
use crate::error::{ExportError, ExportResult, SourceError};
use crate::executor::Tiers;

/// The table, view and ordered ids one export run works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportScope {
    pub table: String,
    pub view: Option<String>,
    pub field_ids: Vec<FieldId>,
    pub record_ids: Vec<RecordId>,
}

pub struct SourceAdapter {
    source: Arc<dyn DataSource>,
    caps: SourceCapabilities,
}

impl SourceAdapter {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        let caps = source.capabilities();
        debug!("data source capabilities: {caps:?}");
        Self { source, caps }
    }

    /// Pick the table to export: the requested one, else the active one,
    /// else the first table of the source.
    pub async fn select_table(&self, requested: Option<&str>) -> ExportResult<String> {
        let tables = self.source.list_tables().await?;

        if let Some(id) = requested {
            return if tables.iter().any(|t| t.id == id) {
                Ok(id.to_string())
            } else {
                Err(SourceError::NotFound(format!("table {id}")).into())
            };
        }

        if self.caps.active_table {
            match self.source.active_table().await {
                Ok(Some(id)) if tables.iter().any(|t| t.id == id) => return Ok(id),
                Ok(_) => debug!("no active table, falling back to the first table"),
                Err(e) => warn!("active table lookup failed ({e}), using the first table"),
            }
        }

        tables
            .into_iter()
            .next()
            .map(|t| t.id)
            .ok_or(ExportError::NoTable)
    }

    /// Pick the view: the requested one if it exists, else the active one.
    /// `None` means the unfiltered table lists are used.
    pub async fn select_view(&self, table: &str, requested: Option<&str>) -> Option<String> {
        if !self.caps.views {
            return None;
        }
        if let Some(id) = requested {
            match self.source.list_views(table).await {
                Ok(views) if views.iter().any(|v| v.id == id) => return Some(id.to_string()),
                Ok(_) => warn!("view {id} not found in table {table}"),
                Err(e) => warn!("listing views of {table} failed: {e}"),
            }
        }
        match self.source.active_view(table).await {
            Ok(view) => view,
            Err(e) => {
                warn!("active view lookup failed ({e}), exporting unfiltered lists");
                None
            }
        }
    }

    /// Resolve table and view, then collect the visible field and record ids.
    pub async fn collect_scope(
        &self,
        requested_table: Option<&str>,
        requested_view: Option<&str>,
    ) -> ExportResult<ExportScope> {
        let table = self.select_table(requested_table).await?;
        let view = self.select_view(&table, requested_view).await;
        let field_ids = self.field_ids(&table, view.as_deref()).await?;
        let record_ids = self.record_ids(&table, view.as_deref()).await?;
        Ok(ExportScope {
            table,
            view,
            field_ids,
            record_ids,
        })
    }

    pub async fn field_ids(&self, table: &str, view: Option<&str>) -> ExportResult<Vec<FieldId>> {
        if let (Some(view), true) = (view, self.caps.view_scoped_lists) {
            match self.source.visible_field_ids(table, view).await {
                Ok(ids) => return Ok(ids),
                Err(e) => warn!("visible fields of view {view} unavailable ({e}), using all fields"),
            }
        }
        Ok(self.source.field_ids(table).await?)
    }

    pub async fn record_ids(&self, table: &str, view: Option<&str>) -> ExportResult<Vec<RecordId>> {
        if let (Some(view), true) = (view, self.caps.view_scoped_lists) {
            match self.source.visible_record_ids(table, view).await {
                Ok(ids) => return Ok(ids),
                Err(e) => warn!("visible records of view {view} unavailable ({e}), using all records"),
            }
        }
        Ok(self.source.record_ids(table).await?)
    }

    /// Display names plus the attachment flag for each field, in field order.
    pub async fn field_descriptors(
        &self,
        table: &str,
        field_ids: &[FieldId],
    ) -> ExportResult<Vec<FieldDescriptor>> {
        let attachment_ids: HashSet<FieldId> = self
            .source
            .attachment_field_ids(table)
            .await?
            .into_iter()
            .collect();
        let names = join_all(field_ids.iter().map(|id| self.field_name(table, id))).await;
        Ok(crate::fields::describe_fields(field_ids, names, &attachment_ids))
    }

    async fn field_name(&self, table: &str, field: &str) -> String {
        if !self.caps.field_names {
            return field.to_string();
        }
        match self.source.field_name(table, field).await {
            Ok(name) => name,
            Err(e) => {
                debug!("name of field {field} unavailable: {e}");
                field.to_string()
            }
        }
    }

    /// Display text of a scalar cell; read failures degrade to empty text.
    pub async fn cell_text(&self, table: &str, field: &str, record: &str) -> String {
        match self.source.cell_string(table, field, record).await {
            Ok(text) => text.unwrap_or_default(),
            Err(e) => {
                warn!("reading cell ({record}, {field}) failed: {e}");
                String::new()
            }
        }
    }

    /// Attachment list of a cell; read failures degrade to an empty list.
    pub async fn attachments(&self, table: &str, field: &str, record: &str) -> Vec<AttachmentItem> {
        match self.source.attachments(table, field, record).await {
            Ok(items) => items,
            Err(e) => {
                warn!("reading attachments ({record}, {field}) failed: {e}");
                Vec::new()
            }
        }
    }

    /// Resolve download URLs for the tokens of one cell in a single batch,
    /// then retry every token the batch left unresolved on its own, once.
    /// Empty tokens are never looked up. The batch and each retry run under
    /// `tiers`, the same windows the fetches of this cell use.
    pub async fn resolve_urls(
        &self,
        table: &str,
        field: &str,
        record: &str,
        tokens: &[String],
        tiers: Tiers<'_>,
    ) -> Vec<Option<String>> {
        let mut urls = vec![None; tokens.len()];
        let lookup: Vec<usize> = (0..tokens.len()).filter(|&i| !tokens[i].is_empty()).collect();
        if lookup.is_empty() {
            return urls;
        }

        let batch: Vec<String> = lookup.iter().map(|&i| tokens[i].clone()).collect();
        match tiers
            .run(self.source.attachment_urls(table, field, record, &batch))
            .await
        {
            Ok(found) => {
                for (&i, url) in lookup.iter().zip(found) {
                    urls[i] = url;
                }
            }
            Err(e) => debug!("batch url resolution for ({record}, {field}) failed: {e}"),
        }

        let missing: Vec<usize> = lookup.into_iter().filter(|&i| urls[i].is_none()).collect();
        if missing.is_empty() {
            return urls;
        }
        let retries = tiers
            .run_all(missing.iter().map(|&i| {
                let token = std::slice::from_ref(&tokens[i]);
                self.source.attachment_urls(table, field, record, token)
            }))
            .await;
        for (i, retry) in missing.into_iter().zip(retries) {
            match retry {
                Ok(found) => urls[i] = found.into_iter().next().flatten(),
                Err(e) => warn!("url for attachment {} unavailable: {e}", tokens[i]),
            }
        }
        urls
    }

    /// Default export base name: `"<table>-<view>"`, or the table name alone.
    pub async fn suggested_file_stem(&self, table: &str, view: Option<&str>) -> Option<String> {
        let tables = self.source.list_tables().await.ok()?;
        let table_name = tables.into_iter().find(|t| t.id == table)?.name;
        let view_name = match (view, self.caps.views) {
            (Some(view), true) => self
                .source
                .list_views(table)
                .await
                .ok()
                .and_then(|views| views.into_iter().find(|v| v.id == view))
                .map(|v| v.name),
            _ => None,
        };
        Some(match view_name {
            Some(v) => format!("{table_name}-{v}"),
            None => table_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceResult;
    use crate::executor::BoundedExecutor;
    use crate::source::{TableInfo, ViewInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Minimal source: no optional capabilities, batch url lookups fail for
    /// more than one token.
    #[derive(Default)]
    struct BareSource {
        url_calls: AtomicUsize,
    }

    #[async_trait]
    impl DataSource for BareSource {
        async fn list_tables(&self) -> SourceResult<Vec<TableInfo>> {
            Ok(vec![
                TableInfo { id: "t1".into(), name: "Orders".into() },
                TableInfo { id: "t2".into(), name: "Items".into() },
            ])
        }
        async fn field_ids(&self, _table: &str) -> SourceResult<Vec<FieldId>> {
            Ok(vec!["f1".into(), "f2".into()])
        }
        async fn record_ids(&self, _table: &str) -> SourceResult<Vec<RecordId>> {
            Ok(vec!["r1".into()])
        }
        async fn attachment_field_ids(&self, _table: &str) -> SourceResult<Vec<FieldId>> {
            Ok(vec!["f2".into()])
        }
        async fn attachments(&self, _t: &str, _f: &str, _r: &str) -> SourceResult<Vec<AttachmentItem>> {
            Err(SourceError::Failed("boom".into()))
        }
        async fn cell_string(&self, _t: &str, _f: &str, _r: &str) -> SourceResult<Option<String>> {
            Err(SourceError::Failed("boom".into()))
        }
        async fn attachment_urls(
            &self,
            _t: &str,
            _f: &str,
            _r: &str,
            tokens: &[String],
        ) -> SourceResult<Vec<Option<String>>> {
            self.url_calls.fetch_add(1, Ordering::SeqCst);
            if tokens.len() > 1 {
                return Err(SourceError::Failed("batch too large".into()));
            }
            Ok(tokens
                .iter()
                .map(|t| (t != "gone").then(|| format!("https://files/{t}")))
                .collect())
        }
        async fn list_views(&self, _table: &str) -> SourceResult<Vec<ViewInfo>> {
            panic!("optional method called without capability");
        }
    }

    #[tokio::test]
    async fn falls_back_to_first_table_without_capabilities() {
        let adapter = SourceAdapter::new(Arc::new(BareSource::default()));
        let scope = adapter.collect_scope(None, Some("v1")).await.unwrap();
        assert_eq!(scope.table, "t1");
        assert_eq!(scope.view, None);
        assert_eq!(scope.field_ids, vec!["f1", "f2"]);
    }

    #[tokio::test]
    async fn unknown_requested_table_is_an_error() {
        let adapter = SourceAdapter::new(Arc::new(BareSource::default()));
        let err = adapter.select_table(Some("nope")).await.unwrap_err();
        assert!(matches!(err, ExportError::Source(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn field_names_default_to_ids() {
        let adapter = SourceAdapter::new(Arc::new(BareSource::default()));
        let fields = adapter
            .field_descriptors("t1", &["f1".to_string(), "f2".to_string()])
            .await
            .unwrap();
        assert_eq!(fields[0].display_name, "f1");
        assert!(!fields[0].is_attachment);
        assert!(fields[1].is_attachment);
    }

    #[tokio::test]
    async fn failed_cell_reads_degrade_to_empty() {
        let adapter = SourceAdapter::new(Arc::new(BareSource::default()));
        assert_eq!(adapter.cell_text("t1", "f1", "r1").await, "");
        assert!(adapter.attachments("t1", "f2", "r1").await.is_empty());
    }

    #[tokio::test]
    async fn failed_batch_is_retried_per_token() {
        let source = Arc::new(BareSource::default());
        let adapter = SourceAdapter::new(source.clone());
        let tokens = vec!["a".to_string(), "gone".to_string(), "b".to_string()];
        let (record, field) = (BoundedExecutor::new(6), BoundedExecutor::new(4));
        let tiers = Tiers { record: &record, field: &field };
        let urls = adapter.resolve_urls("t1", "f2", "r1", &tokens, tiers).await;
        assert_eq!(
            urls,
            vec![
                Some("https://files/a".to_string()),
                None,
                Some("https://files/b".to_string())
            ]
        );
        // one batch call plus exactly one retry per token
        assert_eq!(source.url_calls.load(Ordering::SeqCst), 4);
    }

    /// Fails every batch lookup and tracks how many lookups are in flight.
    #[derive(Default)]
    struct CountingSource {
        active: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DataSource for CountingSource {
        async fn list_tables(&self) -> SourceResult<Vec<TableInfo>> {
            Ok(Vec::new())
        }
        async fn field_ids(&self, _table: &str) -> SourceResult<Vec<FieldId>> {
            Ok(Vec::new())
        }
        async fn record_ids(&self, _table: &str) -> SourceResult<Vec<RecordId>> {
            Ok(Vec::new())
        }
        async fn attachment_field_ids(&self, _table: &str) -> SourceResult<Vec<FieldId>> {
            Ok(Vec::new())
        }
        async fn attachments(&self, _t: &str, _f: &str, _r: &str) -> SourceResult<Vec<AttachmentItem>> {
            Ok(Vec::new())
        }
        async fn cell_string(&self, _t: &str, _f: &str, _r: &str) -> SourceResult<Option<String>> {
            Ok(None)
        }
        async fn attachment_urls(
            &self,
            _t: &str,
            _f: &str,
            _r: &str,
            tokens: &[String],
        ) -> SourceResult<Vec<Option<String>>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().unwrap().extend(tokens.iter().cloned());
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if tokens.len() > 1 {
                return Err(SourceError::Failed("batch unavailable".into()));
            }
            Ok(tokens.iter().map(|t| Some(format!("https://files/{t}"))).collect())
        }
    }

    #[tokio::test]
    async fn url_retries_stay_within_the_field_window() {
        let source = Arc::new(CountingSource::default());
        let adapter = SourceAdapter::new(source.clone());
        let mut tokens: Vec<String> = (0..8).map(|i| format!("tok{i}")).collect();
        tokens.insert(3, String::new());
        tokens.push(String::new());
        let (record, field) = (BoundedExecutor::new(6), BoundedExecutor::new(2));
        let tiers = Tiers { record: &record, field: &field };

        let urls = adapter.resolve_urls("t1", "f2", "r1", &tokens, tiers).await;

        assert_eq!(urls.len(), 10);
        assert_eq!(urls[3], None);
        assert_eq!(urls[9], None);
        assert_eq!(urls[4].as_deref(), Some("https://files/tok3"));
        assert!(urls.iter().filter(|u| u.is_some()).count() == 8);
        let peak = source.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak url lookups {peak}");
        assert!(peak > 1, "retries should interleave");
        assert!(source.seen.lock().unwrap().iter().all(|t| !t.is_empty()));
    }

    #[tokio::test]
    async fn cells_without_tokens_are_never_looked_up() {
        let source = Arc::new(CountingSource::default());
        let adapter = SourceAdapter::new(source.clone());
        let (record, field) = (BoundedExecutor::new(6), BoundedExecutor::new(4));
        let tiers = Tiers { record: &record, field: &field };
        let urls = adapter
            .resolve_urls("t1", "f2", "r1", &[String::new(), String::new()], tiers)
            .await;
        assert_eq!(urls, vec![None, None]);
        assert_eq!(source.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn suggested_stem_uses_table_name() {
        let adapter = SourceAdapter::new(Arc::new(BareSource::default()));
        let stem = adapter.suggested_file_stem("t2", Some("v1")).await;
        assert_eq!(stem.as_deref(), Some("Items"));
    }
}
