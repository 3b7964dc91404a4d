//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    ocr::{DocumentReport, Transcript, query::QueryFile},
    prelude::*,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// A query file, passed with `--queries`.
    QueryFile,
    /// One line of the `--report` output.
    DocumentReport,
    /// One line of the `--transcripts` output.
    Transcript,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::QueryFile => schema_for!(QueryFile),
        SchemaType::DocumentReport => schema_for!(DocumentReport),
        SchemaType::Transcript => schema_for!(Transcript),
    };

    let mut wtr = create_writer(schema_opts.output_path.as_deref()).await?;
    let mut schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    schema_str.push('\n');
    wtr.write_all(schema_str.as_bytes())
        .await
        .context("failed to write schema")?;
    wtr.flush().await.context("failed to flush schema")?;
    Ok(())
}
