//! I/O utilities.
//!
//! Reading configuration files in JSON or TOML, and writing output to either
//! a file or standard output.

use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Does this path look like JSON, based on its extension?
fn is_json_like(path: &Path) -> bool {
    let ext = path.extension().unwrap_or_default();
    ext == "json" || ext == "jsonl"
}

/// Read TOML or JSON from a file. Files ending in `.json` are parsed as JSON,
/// and everything else as TOML.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    // Read all at once because our parsing libraries don't do async I/O.
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    if is_json_like(path) {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write an already-rendered output to a file or standard output.
pub async fn write_output(path: Option<&Path>, data: &[u8]) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    writer
        .write_all(data)
        .await
        .context("Failed to write output")?;
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write a list of records as JSON Lines.
pub async fn write_jsonl<T: Serialize>(path: Option<&Path>, records: &[T]) -> Result<()> {
    let mut data = vec![];
    for record in records {
        serde_json::to_writer(&mut data, record).context("Failed to serialize record")?;
        data.push(b'\n');
    }
    write_output(path, &data).await
}
