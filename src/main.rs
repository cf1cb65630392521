//! tabex – command-line table exporter.
//!
//! Usage:
//!   tabex <dataset.json> [--format xlsx|docx|pdf] [--output NAME]
//!         [--table ID] [--view ID] [--no-attachments]
//!         [--config FILE] [--font FILE]
//!
//! If `--output` is omitted the file is named after the exported table and
//! view (e.g. `Orders-Open.xlsx`) and written to the current directory.

use std::{fs, path::PathBuf, process, sync::Arc};

use clap::Parser;

use table_export::backend::BackendLoader;
use table_export::config::{ExportConfig, ExportFormat};
use table_export::fetch::HttpFetcher;
use table_export::pipeline::{ExportPipeline, ExportRequest};
use table_export::progress::LogProgress;
use table_export::source::MemorySource;

#[derive(Debug, Parser)]
#[command(name = "tabex", version, about = "Export a table to XLSX, DOCX or PDF")]
struct Cli {
    /// Dataset JSON file.
    input: PathBuf,

    /// Output format.
    #[arg(short, long, default_value = "xlsx")]
    format: ExportFormat,

    /// Output file; the format extension is added when missing.
    #[arg(short, long)]
    output: Option<String>,

    /// Table to export (default: the active table).
    #[arg(long)]
    table: Option<String>,

    /// View to export (default: the table's active view).
    #[arg(long)]
    view: Option<String>,

    /// Write attachment file names instead of fetching and embedding them.
    #[arg(long)]
    no_attachments: bool,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TrueType font for PDF output.
    #[arg(long)]
    font: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let json = match fs::read(&cli.input) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error reading '{}': {e}", cli.input.display());
            process::exit(1);
        }
    };
    let source = match MemorySource::from_json_bytes(&json) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error parsing dataset '{}': {e}", cli.input.display());
            process::exit(1);
        }
    };

    let config = match &cli.config {
        Some(path) => match ExportConfig::from_json_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error loading config '{}': {e}", path.display());
                process::exit(1);
            }
        },
        None => ExportConfig::default(),
    };

    if let Some(path) = &cli.font {
        let loaded = fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| BackendLoader::global().preload_font(bytes));
        if let Err(e) = loaded {
            eprintln!("Error loading font '{}': {e}", path.display());
            process::exit(1);
        }
    }

    let fetcher = HttpFetcher::new(config.fetch_timeout());
    let progress = LogProgress;
    let pipeline = ExportPipeline::new(Arc::new(source), &fetcher, &progress).with_config(config);

    let mut request = ExportRequest::new(cli.format);
    request.table_id = cli.table;
    request.view_id = cli.view;
    if cli.no_attachments {
        request.embed_attachments = Some(false);
    }
    request.file_name = match cli.output {
        Some(name) => Some(name),
        None => suggested_stem(&pipeline, &request).await,
    };

    match pipeline.run(&request).await {
        Ok(artifact) => {
            let output = PathBuf::from(&artifact.file_name);
            if let Some(parent) = output.parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = fs::create_dir_all(parent) {
                        eprintln!("Error creating output directory: {e}");
                        process::exit(1);
                    }
                }
            }
            if let Err(e) = fs::write(&output, &artifact.bytes) {
                eprintln!("Error writing '{}': {e}", output.display());
                process::exit(1);
            }
            let rows = artifact.layout.rows.len();
            match cli.format {
                ExportFormat::Pdf => {
                    let pages = artifact.layout.page_breaks.len() + 1;
                    eprintln!(
                        "Wrote '{}' ({} bytes, {} row{}, {} page{})",
                        output.display(),
                        artifact.bytes.len(),
                        rows,
                        if rows == 1 { "" } else { "s" },
                        pages,
                        if pages == 1 { "" } else { "s" }
                    );
                }
                _ => eprintln!(
                    "Wrote '{}' ({} bytes, {} row{})",
                    output.display(),
                    artifact.bytes.len(),
                    rows,
                    if rows == 1 { "" } else { "s" }
                ),
            }
        }
        Err(e) => {
            eprintln!("Error exporting {}: {e}", cli.format);
            process::exit(1);
        }
    }
}

/// `"<table>-<view>"` for the table and view the run will pick.
async fn suggested_stem(pipeline: &ExportPipeline<'_>, request: &ExportRequest) -> Option<String> {
    let source = pipeline.source();
    let table = source.select_table(request.table_id.as_deref()).await.ok()?;
    let view = source.select_view(&table, request.view_id.as_deref()).await;
    source.suggested_file_stem(&table, view.as_deref()).await
}
