//! Turn uploaded documents into page images.
//!
//! Images pass through as a single page. PDFs are rendered to PNGs with
//! Poppler's `pdftocairo` CLI tool, one image per page, in page order.

use std::{collections::BTreeMap, sync::LazyLock};

use clap::Args;
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore,
    ocr::errors::RasterizationError, prelude::*,
};

/// The MIME type of a PDF.
pub const PDF_MIME_TYPE: &str = "application/pdf";

/// Image types we can send to OCR engines as-is.
const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/jpg"];

/// A default error regex for checking Poppler output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler prints some recoverable problems as errors.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of Poppler output contain a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// A single page, ready for OCR.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    /// The MIME type of our data. `image/png` for rendered PDF pages.
    pub mime_type: String,
    /// The encoded image.
    pub data: Vec<u8>,
}

/// How should we turn a document into pages?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    /// Rasterize each page.
    Pdf,
    /// Use the file as a single page.
    Image,
}

/// Decide how to handle a MIME type. Returns `None` for unsupported types.
pub fn classify(mime_type: &str) -> Option<DocumentKind> {
    if mime_type == PDF_MIME_TYPE {
        Some(DocumentKind::Pdf)
    } else if SUPPORTED_IMAGE_TYPES.contains(&mime_type) {
        Some(DocumentKind::Image)
    } else {
        None
    }
}

/// The standard spelling of a MIME type we accept. `image/jpg` is common in
/// the wild but unregistered, so tools like `mime_guess` don't know it.
pub fn canonical_mime_type(mime_type: &str) -> &str {
    match mime_type {
        "image/jpg" => "image/jpeg",
        other => other,
    }
}

/// Guess the MIME type of a file, preferring its contents over its name.
pub fn detect_mime_type(path: &Path, data: &[u8]) -> String {
    if let Some(kind) = infer::get(data) {
        return kind.mime_type().to_owned();
    }
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_owned()
}

/// Converts a PDF into an ordered list of page images.
#[async_trait]
pub trait Rasterizer: Send + Sync + 'static {
    /// Render every page of a PDF, in order.
    async fn rasterize(&self, pdf: &[u8]) -> Result<Vec<Page>, RasterizationError>;
}

/// Options for [`PdftocairoRasterizer`].
#[derive(Args, Clone, Debug)]
pub struct RasterizeOptions {
    /// The DPI to use when rendering PDF pages.
    #[clap(long = "dpi", default_value = "200")]
    pub dpi: u32,

    /// The maximum number of pages to process per PDF. Later pages are
    /// ignored, with a warning.
    #[clap(long)]
    pub max_pages: Option<usize>,
}

impl Default for RasterizeOptions {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_pages: None,
        }
    }
}

/// Renders PDFs using `pdfinfo` and `pdftocairo` from `poppler-utils`.
pub struct PdftocairoRasterizer {
    options: RasterizeOptions,
}

impl PdftocairoRasterizer {
    /// Create a new rasterizer.
    pub fn new(options: RasterizeOptions) -> Self {
        Self { options }
    }

    /// Do the actual work, with `anyhow` errors.
    async fn rasterize_inner(&self, pdf: &[u8]) -> Result<Vec<Page>> {
        // Write our input to a temporary directory, where the page images
        // will also go.
        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let input_path = tmpdir.path().join("input.pdf");
        tokio::fs::write(&input_path, pdf)
            .await
            .context("cannot write PDF to temporary file")?;

        let total_pages = get_pdf_page_count(&input_path).await?;
        if total_pages == 0 {
            return Err(anyhow!("PDF has no pages"));
        }

        // Run pdftocairo to convert the PDF to PNG files. It names them
        // `page-01.png` and so on, padding so they sort in page order.
        //
        // We use `with_cpu_semaphore` because `pdftocairo` will use _at least_
        // 100% of a CPU.
        let out_dir = tmpdir.path().join("out");
        tokio::fs::create_dir(&out_dir)
            .await
            .context("cannot create output directory")?;
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png").arg("-r").arg(self.options.dpi.to_string());
        if let Some(max_pages) = self.options.max_pages
            && total_pages > max_pages
        {
            warn!(
                "Only rendering {}/{} pages (because of --max-pages)",
                max_pages, total_pages
            );
            // Poppler page ranges are 1-based and inclusive.
            cmd.arg("-l").arg(max_pages.to_string());
        }
        let output = with_cpu_semaphore(|| async {
            cmd.arg(&input_path)
                .arg(out_dir.join("page"))
                .output()
                .await
                .context("failed to run pdftocairo")
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

        // Read the pages back in sorted order.
        let mut page_paths = vec![];
        let mut entries = tokio::fs::read_dir(&out_dir)
            .await
            .context("failed to read pdftocairo output directory")?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to read pdftocairo output directory")?
        {
            page_paths.push(entry.path());
        }
        page_paths.sort();

        let mut pages = Vec::with_capacity(page_paths.len());
        for path in page_paths {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read page image {:?}", path.display()))?;
            pages.push(Page {
                mime_type: "image/png".to_owned(),
                data,
            });
        }
        if pages.is_empty() {
            return Err(anyhow!("pdftocairo produced no pages"));
        }
        debug!(page_count = pages.len(), total_pages, "Rasterized PDF");
        Ok(pages)
    }
}

#[async_trait]
impl Rasterizer for PdftocairoRasterizer {
    #[instrument(level = "debug", skip_all, fields(bytes = pdf.len(), dpi = self.options.dpi))]
    async fn rasterize(&self, pdf: &[u8]) -> Result<Vec<Page>, RasterizationError> {
        self.rasterize_inner(pdf)
            .await
            .map_err(RasterizationError::new)
    }
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    // Run pdfinfo to get the number of pages. This also rejects files which
    // aren't valid PDFs.
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .context("failed to run pdfinfo")?;
    check_for_command_failure("pdfinfo", &output, None)?;

    // Parse the output of pdfinfo into properties.
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output)
}

/// Find the `Pages:` line in `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            properties.insert(key.trim(), value.trim());
        }
    }
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str
        .parse::<usize>()
        .with_context(|| format!("failed to parse page count {:?}", page_count_str))
}
