//! Tesseract OCR engine, used as a fallback.

use std::path::PathBuf;

use tokio::process::Command;

use super::FallbackOcrEngine;
use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore,
    ocr::errors::FallbackEngineError, page_iter::Page, prelude::*,
};

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractOcrEngine {
    /// The `tesseract` binary to run.
    binary: PathBuf,

    /// Languages to pass with `-l`, if any.
    language: Option<String>,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(binary: PathBuf, language: Option<String>) -> Self {
        Self { binary, language }
    }

    /// Do the actual work, with `anyhow` errors.
    async fn recognize_inner(&self, page: &Page) -> Result<String> {
        let extension = mime_guess::get_mime_extensions_str(&page.mime_type)
            .and_then(|o| o.first())
            .ok_or_else(|| anyhow!("cannot determine extension for {}", page.mime_type))?;

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join(format!("input.{}", extension));
        let output_base = tmpdir.path().join("output");
        tokio::fs::write(&input_path, &page.data)
            .await
            .context("cannot write tesseract input file")?;

        // Run tesseract on the input file. It appends `.txt` to the output
        // name itself.
        let mut cmd = Command::new(&self.binary);
        cmd.arg(&input_path).arg(&output_base);
        if let Some(language) = &self.language {
            cmd.arg("-l").arg(language);
        }
        let output = with_cpu_semaphore(|| async {
            cmd.output()
                .await
                .with_context(|| format!("cannot run {:?}", self.binary.display()))
        })
        .await?;
        check_for_command_failure("tesseract", &output, None)?;

        // Read the output file.
        let text = tokio::fs::read_to_string(output_base.with_extension("txt"))
            .await
            .context("cannot read tesseract output file")?;
        debug!(chars = text.len(), "Tesseract transcribed page");
        Ok(text)
    }
}

#[async_trait]
impl FallbackOcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(mime_type = %page.mime_type))]
    async fn recognize(&self, page: &Page) -> Result<String, FallbackEngineError> {
        self.recognize_inner(page)
            .await
            .map_err(FallbackEngineError::new)
    }
}

/// A fallback engine which always fails, for when no fallback is wanted.
pub struct DisabledFallbackEngine;

#[async_trait]
impl FallbackOcrEngine for DisabledFallbackEngine {
    async fn recognize(&self, _page: &Page) -> Result<String, FallbackEngineError> {
        Err(FallbackEngineError::new(anyhow!(
            "no fallback OCR engine configured"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_page() -> Page {
        Page {
            mime_type: "image/png".to_owned(),
            data: b"\x89PNG\r\n\x1a\n".to_vec(),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_fallback_error() {
        let engine = TesseractOcrEngine::new(
            PathBuf::from("/nonexistent/bin/tesseract"),
            None,
        );
        let err = engine.recognize(&png_page()).await.unwrap_err();
        assert!(err.to_string().contains("cannot run"));
    }

    #[tokio::test]
    async fn unknown_mime_type_is_a_fallback_error() {
        let engine = TesseractOcrEngine::new(PathBuf::from("tesseract"), None);
        let page = Page {
            mime_type: "application/x-unknown".to_owned(),
            data: vec![],
        };
        assert!(engine.recognize(&page).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_tesseract_and_reads_output() {
        use std::os::unix::fs::PermissionsExt as _;

        // A stand-in for `tesseract INPUT OUTPUT_BASE -l LANG`.
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("tesseract");
        std::fs::write(
            &binary,
            "#!/bin/sh\nprintf 'lang=%s\\n' \"$4\" > \"$2.txt\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = TesseractOcrEngine::new(binary, Some("eng".to_owned()));
        let page = Page {
            mime_type: "image/jpeg".to_owned(),
            data: b"\xff\xd8\xff".to_vec(),
        };
        assert_eq!(engine.recognize(&page).await.unwrap(), "lang=eng\n");
    }

    #[tokio::test]
    async fn disabled_engine_always_fails() {
        assert!(DisabledFallbackEngine.recognize(&png_page()).await.is_err());
    }
}
