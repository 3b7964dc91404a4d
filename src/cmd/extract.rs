//! The `extract` subcommand.

use std::sync::Arc;

use clap::{Args, ValueEnum};

use crate::{
    async_utils::io::{write_jsonl, write_output},
    ocr::{
        Document, DocumentStatus, Extraction, Extractor,
        engines::{EngineOpts, fallback_engine, primary_engine},
        query::{Query, QueryFile, QuerySet},
    },
    page_iter::{PdftocairoRasterizer, RasterizeOptions},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Output formats for the result table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// CSV with a header row.
    #[default]
    Csv,
    /// One JSON object per line.
    Jsonl,
}

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// PDFs and images to process. Rows are written in this order.
    #[clap(value_name = "PATH", required = true)]
    pub input_paths: Vec<PathBuf>,

    /// A TOML or JSON file containing `[[queries]]` with `text` and `alias`.
    #[clap(long = "queries", required_unless_present = "query")]
    pub queries_path: Option<PathBuf>,

    /// A query, written as "ALIAS=TEXT". May be repeated.
    #[clap(short = 'q', long = "query", conflicts_with = "queries_path")]
    pub query: Vec<Query>,

    /// Output path for the result table. Defaults to stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Output format for the result table.
    #[clap(long, value_enum, default_value = "csv")]
    pub format: OutputFormat,

    /// Write a JSONL report describing what happened to each document.
    #[clap(long = "report")]
    pub report_path: Option<PathBuf>,

    /// Write the full text of each document as JSONL.
    #[clap(long = "transcripts")]
    pub transcripts_path: Option<PathBuf>,

    /// Max number of documents (and pages per document) to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    #[clap(flatten)]
    pub rasterize_opts: RasterizeOptions,

    #[clap(flatten)]
    pub engine_opts: EngineOpts,
}

impl ExtractOpts {
    /// Load and validate our queries.
    async fn query_set(&self) -> Result<QuerySet> {
        let queries = match &self.queries_path {
            Some(path) => QueryFile::read(path).await?.queries,
            None => self.query.clone(),
        };
        QuerySet::new(queries).context("invalid queries")
    }
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: &Ui, opts: &ExtractOpts) -> Result<()> {
    // Check our queries before we go to the trouble of configuring AWS.
    let queries = opts.query_set().await?;
    let job_count = opts.job_count.max(1);

    let mut documents = Vec::with_capacity(opts.input_paths.len());
    for path in &opts.input_paths {
        documents.push(Document::read(path).await?);
    }

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "Extracting fields",
            done_msg: "Extracted fields",
        },
        documents.len() as u64,
    );
    let extractor = Extractor::new(
        Arc::new(PdftocairoRasterizer::new(opts.rasterize_opts.clone())),
        primary_engine(&opts.engine_opts, job_count).await?,
        fallback_engine(&opts.engine_opts),
        job_count,
    )
    .with_progress(pb.clone());
    let extraction = extractor.extract(documents, &queries).await;
    pb.finish_using_style();

    let table = match opts.format {
        OutputFormat::Csv => extraction.table.to_csv()?,
        OutputFormat::Jsonl => extraction.table.to_jsonl()?,
    };
    write_output(opts.output_path.as_deref(), &table).await?;

    if let Some(report_path) = &opts.report_path {
        write_jsonl(Some(report_path.as_path()), &extraction.reports).await?;
    }
    if let Some(transcripts_path) = &opts.transcripts_path {
        write_jsonl(Some(transcripts_path.as_path()), &extraction.transcripts).await?;
    }

    display_summary(ui, &extraction);
    Ok(())
}

/// Print a one-line summary of the run.
fn display_summary(ui: &Ui, extraction: &Extraction) {
    let mut summary = format!(
        "{} rows, {} skipped, {} failed in {:.1}s",
        extraction.table.rows().len(),
        extraction.count_status(DocumentStatus::Skipped),
        extraction.count_status(DocumentStatus::Failed),
        extraction.elapsed.as_secs_f64(),
    );
    let cost = extraction.estimated_cost();
    if cost > 0.0 {
        summary.push_str(&format!(", estimated cost ${cost:.2}"));
    }
    ui.display_message("📊", &summary);
}
