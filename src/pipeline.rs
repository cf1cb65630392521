//! Pipeline – collects the table, grows the column plan, resolves
//! attachments, lays rows out and drives a [`DocumentSink`].
//!
//! One generic run serves every format. Sinks that can rewrite header cells
//! are streamed: the header goes out first and new attachment columns are
//! retrofitted the moment they appear. Other sinks get the header only after
//! every record has been resolved, so it already holds every column.

use std::ops::Range;
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info};

use crate::backend::BackendLoader;
use crate::columns::ColumnPlan;
use crate::config::{ExportConfig, ExportFormat};
use crate::error::ExportResult;
use crate::fetch::BlobFetcher;
use crate::fields::{partition, FieldPartition};
use crate::layout::{LayoutEngine, LayoutOptions, LayoutPlan, RowLayout};
use crate::pagination::Paginator;
use crate::progress::{ProgressReporter, ProgressSink};
use crate::resolver::{AttachmentCell, AttachmentResolver, ResolvedCell};
use crate::sink::{create_sink, DocumentSink, SinkCapabilities};
use crate::source::{DataSource, ExportScope, FieldDescriptor, SourceAdapter};

/// Base name used when the caller leaves the file name blank.
pub const DEFAULT_FILE_STEM: &str = "导出";

/// What to export and where the result should be called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub format: ExportFormat,
    /// Base name; the format extension is appended when missing.
    pub file_name: Option<String>,
    pub table_id: Option<String>,
    pub view_id: Option<String>,
    /// Overrides [`ExportConfig::embed_attachments`] when set.
    pub embed_attachments: Option<bool>,
}

impl ExportRequest {
    pub fn new(format: ExportFormat) -> Self {
        Self {
            format,
            file_name: None,
            table_id: None,
            view_id: None,
            embed_attachments: None,
        }
    }
}

/// The finished file.
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub file_name: String,
    pub mime_type: &'static str,
    pub bytes: Vec<u8>,
    /// The layout the file was written with.
    pub layout: LayoutPlan,
}

/// Trimmed `base` with the format extension appended if missing, or the
/// default name when `base` is blank.
pub fn output_file_name(base: Option<&str>, format: ExportFormat) -> String {
    let ext = format.extension();
    let base = base.map(str::trim).filter(|b| !b.is_empty());
    match base {
        Some(b) if b.to_lowercase().ends_with(&format!(".{ext}")) => b.to_string(),
        Some(b) => format!("{b}.{ext}"),
        None => format!("{DEFAULT_FILE_STEM}.{ext}"),
    }
}

/// Everything collected before the first record is resolved.
struct Collected {
    scope: ExportScope,
    fields: Vec<FieldDescriptor>,
    partition: FieldPartition,
}

pub struct ExportPipeline<'a> {
    source: SourceAdapter,
    fetcher: &'a dyn BlobFetcher,
    loader: &'a BackendLoader,
    progress: &'a dyn ProgressSink,
    config: ExportConfig,
}

impl<'a> ExportPipeline<'a> {
    /// Uses the process-wide backend loader and the default configuration.
    pub fn new(
        source: Arc<dyn DataSource>,
        fetcher: &'a dyn BlobFetcher,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            source: SourceAdapter::new(source),
            fetcher,
            loader: BackendLoader::global(),
            progress,
            config: ExportConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_loader(mut self, loader: &'a BackendLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn source(&self) -> &SourceAdapter {
        &self.source
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Run a full export: collect, load the backend, render, finalize.
    ///
    /// Failures are reported on the status channel before being returned;
    /// no artifact exists unless the whole run succeeded.
    pub async fn run(&self, request: &ExportRequest) -> ExportResult<ExportArtifact> {
        self.reporting(request.format, async {
            let collected = self.collect(request).await?;
            let assets = self
                .loader
                .load(request.format, &self.config, self.fetcher)
                .await?;
            self.progress
                .status(&format!("{} backend ready", request.format));
            let sink = create_sink(request.format, &self.config, assets);
            let (bytes, layout) = self.render(request, &collected, sink).await?;
            Ok(ExportArtifact {
                file_name: output_file_name(request.file_name.as_deref(), request.format),
                mime_type: request.format.mime_type(),
                bytes,
                layout,
            })
        })
        .await
    }

    /// Like [`run`](Self::run) but into a caller-provided sink, skipping the
    /// backend loader. Returns the finalized bytes and the layout.
    pub async fn run_with_sink(
        &self,
        request: &ExportRequest,
        sink: Box<dyn DocumentSink>,
    ) -> ExportResult<(Vec<u8>, LayoutPlan)> {
        self.reporting(request.format, async {
            let collected = self.collect(request).await?;
            self.render(request, &collected, sink).await
        })
        .await
    }

    async fn reporting<T>(
        &self,
        format: ExportFormat,
        run: impl std::future::Future<Output = ExportResult<T>>,
    ) -> ExportResult<T> {
        self.progress.status(&format!("Starting {format} export"));
        match run.await {
            Ok(out) => {
                self.progress.status("Export complete");
                info!("{format} export complete");
                Ok(out)
            }
            Err(e) => {
                self.progress.status(&format!("Export failed: {e}"));
                Err(e)
            }
        }
    }

    async fn collect(&self, request: &ExportRequest) -> ExportResult<Collected> {
        let scope = self
            .source
            .collect_scope(request.table_id.as_deref(), request.view_id.as_deref())
            .await?;
        let fields = self
            .source
            .field_descriptors(&scope.table, &scope.field_ids)
            .await?;
        let partition = partition(&fields);
        self.progress.status(&format!(
            "Collected {} fields and {} records",
            fields.len(),
            scope.record_ids.len()
        ));
        debug!(
            "table {} view {:?}: {} scalar, {} attachment fields",
            scope.table,
            scope.view,
            partition.scalar.len(),
            partition.attachment.len()
        );
        Ok(Collected {
            scope,
            fields,
            partition,
        })
    }

    async fn render(
        &self,
        request: &ExportRequest,
        collected: &Collected,
        mut sink: Box<dyn DocumentSink>,
    ) -> ExportResult<(Vec<u8>, LayoutPlan)> {
        let caps = sink.capabilities();
        let measure = sink.measure();
        let opts = LayoutOptions {
            font_size: caps.font_size,
            header_font_size: caps.header_font_size,
            ..LayoutOptions::from(&self.config)
        };
        let engine = LayoutEngine::new(
            measure.as_ref(),
            opts,
            caps.image_bounds,
            caps.image_unit_pt,
        );
        let embed = request
            .embed_attachments
            .unwrap_or(self.config.embed_attachments);
        let resolver = AttachmentResolver::new(
            &self.source,
            self.fetcher,
            &collected.scope.table,
            &caps.accepted_images,
        )
        .with_embedding(embed)
        .with_fetch_timeout(self.config.fetch_timeout());

        let run = RunContext {
            collected,
            resolver,
            engine,
            caps: &caps,
        };
        let layout = if run.caps.retrofit_headers {
            self.render_streaming(&run, sink.as_mut()).await?
        } else {
            self.render_deferred(&run, sink.as_mut()).await?
        };

        self.progress
            .status(&format!("Generating {} file", run.caps.format));
        let bytes = sink.finalize()?;
        Ok((bytes, layout))
    }

    /// Header first, rows written as they are resolved, widths last.
    async fn render_streaming(
        &self,
        run: &RunContext<'_>,
        sink: &mut dyn DocumentSink,
    ) -> ExportResult<LayoutPlan> {
        let mut plan = ColumnPlan::build_initial(&run.collected.fields);
        let headers = plan.headers();
        let header_lines = unwrapped(&headers);
        sink.add_header_row(&headers, &header_lines, run.engine.header_height(&header_lines))?;

        let records = &run.collected.scope.record_ids;
        let sample_rows = run.engine.options().sample_rows;
        let mut samples: Vec<Vec<ResolvedCell>> = Vec::new();
        let mut rows = Vec::with_capacity(records.len());
        let mut reporter = ProgressReporter::start(self.progress, records.len());

        for (i, record) in records.iter().enumerate() {
            let (cells, created) = self.resolve_row(run, &mut plan, record).await;
            for col in created {
                sink.set_header_cell(col, &plan.entries()[col].header)?;
            }
            let layout = run.engine.layout_row(&cells, None, false);
            write_row(sink, i + 1, &cells, &layout)?;
            rows.push(layout);
            if samples.len() < sample_rows {
                samples.push(cells);
            }
            reporter.record_done();
        }

        let headers = plan.headers();
        let mut widths = run
            .engine
            .column_widths(&headers, &samples, run.caps.content_width);
        run.engine.fit_placed_images(&mut widths, &rows);
        for (col, width) in widths.iter().enumerate() {
            sink.set_column_width(col, *width)?;
        }
        let header_lines = unwrapped(&headers);
        let header_height = run.engine.header_height(&header_lines);
        sink.set_row_height(0, header_height)?;

        Ok(LayoutPlan {
            column_widths: widths,
            header_lines,
            header_height,
            rows,
            page_breaks: Vec::new(),
        })
    }

    /// Every record resolved first; then widths, header and rows, with page
    /// breaks for paginated sinks.
    async fn render_deferred(
        &self,
        run: &RunContext<'_>,
        sink: &mut dyn DocumentSink,
    ) -> ExportResult<LayoutPlan> {
        let mut plan = ColumnPlan::build_initial(&run.collected.fields);
        let records = &run.collected.scope.record_ids;
        let mut resolved = Vec::with_capacity(records.len());
        let mut reporter = ProgressReporter::start(self.progress, records.len());
        for record in records {
            let (cells, _) = self.resolve_row(run, &mut plan, record).await;
            resolved.push(cells);
            reporter.record_done();
        }
        for cells in &mut resolved {
            cells.resize(plan.len(), ResolvedCell::Empty);
        }

        let headers = plan.headers();
        let widths = run
            .engine
            .column_widths(&headers, &resolved, run.caps.content_width);
        for (col, width) in widths.iter().enumerate() {
            sink.set_column_width(col, *width)?;
        }
        let header_lines: Vec<Vec<String>> = if run.caps.wraps_text {
            headers
                .iter()
                .zip(&widths)
                .map(|(h, w)| run.engine.wrap_header(h, *w))
                .collect()
        } else {
            unwrapped(&headers)
        };
        let header_height = run.engine.header_height(&header_lines);
        sink.add_header_row(&headers, &header_lines, header_height)?;

        let mut paginator = run
            .caps
            .content_height
            .map(|h| Paginator::new(h, header_height));
        let mut rows = Vec::with_capacity(resolved.len());
        let mut page_breaks = Vec::new();
        for (i, cells) in resolved.iter().enumerate() {
            let layout = run
                .engine
                .layout_row(cells, Some(&widths), run.caps.wraps_text);
            if let Some(p) = paginator.as_mut() {
                if p.place_row(layout.height) {
                    sink.page_break()?;
                    page_breaks.push(i);
                }
            }
            write_row(sink, i + 1, cells, &layout)?;
            rows.push(layout);
        }
        if let Some(p) = &paginator {
            debug!("{} pages", p.page_count());
        }

        Ok(LayoutPlan {
            column_widths: widths,
            header_lines,
            header_height,
            rows,
            page_breaks,
        })
    }

    /// Resolve one record into cells aligned with the (possibly grown) plan.
    /// Also returns the positions of columns this record created.
    async fn resolve_row(
        &self,
        run: &RunContext<'_>,
        plan: &mut ColumnPlan,
        record: &str,
    ) -> (Vec<ResolvedCell>, Range<usize>) {
        let table = run.collected.scope.table.as_str();
        let partition = &run.collected.partition;

        let texts = join_all(
            partition
                .scalar
                .iter()
                .map(|field| self.source.cell_text(table, field, record)),
        )
        .await;
        let lists = join_all(
            partition
                .attachment
                .iter()
                .map(|field| self.source.attachments(table, field, record)),
        )
        .await;

        let attachment_cells: Vec<AttachmentCell> = partition
            .attachment
            .iter()
            .zip(lists)
            .filter(|(_, items)| !items.is_empty())
            .map(|(field, items)| AttachmentCell {
                field_id: field.clone(),
                items,
            })
            .collect();

        // Grow the plan for the longest list before resolving any slot.
        let first_new = plan.len();
        for cell in &attachment_cells {
            let base = run
                .collected
                .fields
                .iter()
                .find(|f| f.id == cell.field_id)
                .map(|f| f.display_name.as_str())
                .unwrap_or(cell.field_id.as_str());
            let growth = plan.ensure_slot(&cell.field_id, cell.items.len() - 1, base);
            if !growth.created.is_empty() {
                debug!(
                    "record {record}: field {} grew to {} slots",
                    cell.field_id,
                    plan.slot_count(&cell.field_id)
                );
            }
        }
        let created = first_new..plan.len();

        let resolved = run.resolver.resolve_record(record, &attachment_cells).await;

        let mut row = vec![ResolvedCell::Empty; plan.len()];
        for (field, text) in partition.scalar.iter().zip(texts) {
            if let Some(col) = plan.index_of(field, None) {
                row[col] = ResolvedCell::Text(text);
            }
        }
        for (cell, results) in attachment_cells.iter().zip(resolved) {
            for (slot, result) in results.into_iter().enumerate() {
                if let Some(col) = plan.index_of(&cell.field_id, Some(slot)) {
                    row[col] = result;
                }
            }
        }
        (row, created)
    }
}

/// Per-run state shared by the render modes.
struct RunContext<'r> {
    collected: &'r Collected,
    resolver: AttachmentResolver<'r>,
    engine: LayoutEngine<'r>,
    caps: &'r SinkCapabilities,
}

fn unwrapped(headers: &[String]) -> Vec<Vec<String>> {
    headers
        .iter()
        .map(|h| h.split('\n').map(str::to_string).collect())
        .collect()
}

/// Register the row, then anchor its images, then fix its height.
fn write_row(
    sink: &mut dyn DocumentSink,
    row: usize,
    cells: &[ResolvedCell],
    layout: &RowLayout,
) -> ExportResult<()> {
    sink.add_data_row(row, &layout.cells)?;
    for (col, (cell, cell_layout)) in cells.iter().zip(&layout.cells).enumerate() {
        if let Some(image) = cell.image() {
            for size in &cell_layout.images {
                sink.place_image(row, col, image, *size)?;
            }
        }
    }
    sink.set_row_height(row, layout.height)
}

/// Export with the process-wide backend loader.
pub async fn run_export(
    source: Arc<dyn DataSource>,
    fetcher: &dyn BlobFetcher,
    request: &ExportRequest,
    config: &ExportConfig,
    progress: &dyn ProgressSink,
) -> ExportResult<ExportArtifact> {
    ExportPipeline::new(source, fetcher, progress)
        .with_config(config.clone())
        .run(request)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_get_the_extension_once() {
        assert_eq!(output_file_name(Some(" report "), ExportFormat::Pdf), "report.pdf");
        assert_eq!(output_file_name(Some("report.XLSX"), ExportFormat::Xlsx), "report.XLSX");
        assert_eq!(output_file_name(Some("report.pdf"), ExportFormat::Docx), "report.pdf.docx");
    }

    #[test]
    fn blank_names_use_the_default() {
        assert_eq!(output_file_name(None, ExportFormat::Xlsx), "导出.xlsx");
        assert_eq!(output_file_name(Some("   "), ExportFormat::Docx), "导出.docx");
    }
}
