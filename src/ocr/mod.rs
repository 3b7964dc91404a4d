//! Query-driven field extraction.
//!
//! For each uploaded document we:
//!
//! 1. Decide from its MIME type whether it's a PDF, an image, or something we
//!    skip.
//! 2. Rasterize PDFs into page images. Images are a single page.
//! 3. Ask the primary query engine every query about each page. If it fails,
//!    transcribe the page with the fallback engine instead.
//! 4. Combine the answers from all pages into one [`FieldMap`] per document,
//!    with later pages overriding earlier ones.
//! 5. Join each page's text lines into a [`Transcript`] of the document.
//!
//! Documents run concurrently, but results come back in upload order.

pub mod blocks;
pub mod engines;
pub mod errors;
pub mod query;
pub mod reconcile;
pub mod table;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{Stream, StreamExt as _, stream};
use indicatif::ProgressBar;
use schemars::JsonSchema;

use self::{
    engines::{FallbackOcrEngine, PrimaryQueryEngine},
    query::QuerySet,
    reconcile::{
        FormDatum, build_field_map, reconcile_fallback, reconcile_primary, transcribe_lines,
    },
    table::{DocumentResult, ResultTable},
};
use crate::{
    page_iter::{
        DocumentKind, Page, Rasterizer, canonical_mime_type, classify, detect_mime_type,
    },
    prelude::*,
};

/// An uploaded document.
#[derive(Clone, Debug)]
pub struct Document {
    /// The name shown in the output table.
    pub filename: String,
    /// The raw file contents.
    pub data: Vec<u8>,
    /// The MIME type, which decides how we process the document.
    pub mime_type: String,
}

impl Document {
    /// Read a document from disk, detecting its MIME type.
    pub async fn read(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {:?}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mime_type = detect_mime_type(path, &data);
        Ok(Self {
            filename,
            data,
            mime_type,
        })
    }
}

/// What happened to a document?
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Every page was answered by the query engine.
    Ok,
    /// At least one page used the fallback engine.
    Degraded,
    /// At least one page failed in both engines, but others produced answers.
    Incomplete,
    /// The document produced no answers because of errors.
    Failed,
    /// The document was processed without errors, but nothing was answered.
    NoAnswers,
    /// The document's type is not supported.
    Skipped,
}

/// A per-document record of what happened, including non-fatal problems.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DocumentReport {
    /// The uploaded file name.
    pub filename: String,

    /// The detected MIME type.
    pub mime_type: String,

    /// The overall result.
    pub status: DocumentStatus,

    /// How many pages we processed.
    pub page_count: usize,

    /// Problems we recovered from, such as falling back to plain OCR.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// Problems that cost us data.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// How much we think the query engine charged, in US dollars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
}

/// The full text of a document, from every page we could read.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Transcript {
    /// The uploaded file name.
    pub filename: String,

    /// One line per text line, pages in order. Pages read by the fallback
    /// engine contribute its raw output.
    pub text: String,
}

/// The result of processing one document.
#[derive(Debug)]
pub struct DocumentOutcome {
    /// The table row, if the document produced any answers.
    pub result: Option<DocumentResult>,
    /// The document text, if any page could be read.
    pub transcript: Option<Transcript>,
    pub report: DocumentReport,
}

/// The result of an extraction run.
#[derive(Debug)]
pub struct Extraction {
    /// One row per document with answers, in upload order.
    pub table: ResultTable,
    /// One report per uploaded document, in upload order.
    pub reports: Vec<DocumentReport>,
    /// One transcript per readable document, in upload order.
    pub transcripts: Vec<Transcript>,
    /// Wall-clock time for the whole run.
    pub elapsed: Duration,
}

impl Extraction {
    /// Assemble document outcomes, which must be in upload order.
    pub fn from_outcomes(
        queries: &QuerySet,
        outcomes: impl IntoIterator<Item = DocumentOutcome>,
        elapsed: Duration,
    ) -> Self {
        let mut table = ResultTable::new(queries.aliases());
        let mut reports = vec![];
        let mut transcripts = vec![];
        for outcome in outcomes {
            if let Some(result) = outcome.result {
                table.push(result);
            }
            transcripts.extend(outcome.transcript);
            reports.push(outcome.report);
        }
        Self {
            table,
            reports,
            transcripts,
            elapsed,
        }
    }

    /// Count reports with a given status.
    pub fn count_status(&self, status: DocumentStatus) -> usize {
        self.reports.iter().filter(|r| r.status == status).count()
    }

    /// Total estimated cost across all documents.
    pub fn estimated_cost(&self) -> f64 {
        self.reports.iter().filter_map(|r| r.estimated_cost).sum()
    }
}

/// What we got from one page.
#[derive(Debug, Default)]
struct PageOutput {
    form_data: Vec<FormDatum>,
    transcript: Option<String>,
    used_fallback: bool,
    warning: Option<String>,
    error: Option<String>,
    estimated_cost: Option<f64>,
}

/// Runs documents through the rasterizer and OCR engines.
///
/// Build one of these per process and reuse it across runs.
pub struct Extractor {
    rasterizer: Arc<dyn Rasterizer>,
    primary: Arc<dyn PrimaryQueryEngine>,
    fallback: Arc<dyn FallbackOcrEngine>,
    concurrency_limit: usize,
    progress: Option<ProgressBar>,
}

impl Extractor {
    /// Create a new extractor. `concurrency_limit` bounds how many documents,
    /// and how many pages of each document, are in flight at once.
    pub fn new(
        rasterizer: Arc<dyn Rasterizer>,
        primary: Arc<dyn PrimaryQueryEngine>,
        fallback: Arc<dyn FallbackOcrEngine>,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            rasterizer,
            primary,
            fallback,
            concurrency_limit: concurrency_limit.max(1),
            progress: None,
        }
    }

    /// Advance `progress` once for each finished document.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Extract fields from every document and build the result table.
    #[instrument(level = "debug", skip_all, fields(documents = documents.len()))]
    pub async fn extract(&self, documents: Vec<Document>, queries: &QuerySet) -> Extraction {
        let started = Instant::now();
        let outcomes = self
            .extract_stream(documents, queries)
            .collect::<Vec<_>>()
            .await;
        Extraction::from_outcomes(queries, outcomes, started.elapsed())
    }

    /// Process documents concurrently, yielding outcomes in upload order.
    fn extract_stream<'a>(
        &'a self,
        documents: Vec<Document>,
        queries: &'a QuerySet,
    ) -> impl Stream<Item = DocumentOutcome> + 'a {
        stream::iter(documents)
            .map(move |document| self.extract_document(document, queries))
            .buffered(self.concurrency_limit)
            .inspect(|_| {
                if let Some(progress) = &self.progress {
                    progress.inc(1);
                }
            })
    }

    /// Process a single document. Never fails: problems are recorded in the
    /// report instead.
    #[instrument(level = "debug", skip_all, fields(filename = %document.filename))]
    async fn extract_document(&self, document: Document, queries: &QuerySet) -> DocumentOutcome {
        let mut report = DocumentReport {
            filename: document.filename.clone(),
            mime_type: document.mime_type.clone(),
            status: DocumentStatus::Ok,
            page_count: 0,
            warnings: vec![],
            errors: vec![],
            estimated_cost: None,
        };

        // Unsupported types are silently left out of the table.
        let Some(kind) = classify(&document.mime_type) else {
            debug!(mime_type = %document.mime_type, "Skipping unsupported document type");
            report.status = DocumentStatus::Skipped;
            return DocumentOutcome {
                result: None,
                transcript: None,
                report,
            };
        };

        let pages = match kind {
            DocumentKind::Image => vec![Page {
                mime_type: canonical_mime_type(&document.mime_type).to_owned(),
                data: document.data,
            }],
            DocumentKind::Pdf => match self.rasterizer.rasterize(&document.data).await {
                Ok(pages) => pages,
                Err(err) => {
                    error!(filename = %document.filename, "{err}");
                    report.errors.push(err.to_string());
                    report.status = DocumentStatus::Failed;
                    return DocumentOutcome {
                        result: None,
                        transcript: None,
                        report,
                    };
                }
            },
        };
        report.page_count = pages.len();

        // Pages run concurrently, but `buffered` returns them in page order,
        // which keeps "last page wins" deterministic.
        let page_outputs = stream::iter(pages.iter().enumerate())
            .map(|(page_idx, page)| self.extract_page(page_idx, page, queries))
            .buffered(self.concurrency_limit)
            .collect::<Vec<_>>()
            .await;

        let mut form_data = vec![];
        let mut page_texts = vec![];
        let mut used_fallback = false;
        let mut failed_pages = 0;
        let mut estimated_cost = None;
        for output in page_outputs {
            form_data.extend(output.form_data);
            page_texts.extend(output.transcript);
            used_fallback |= output.used_fallback;
            report.warnings.extend(output.warning);
            if let Some(error) = output.error {
                failed_pages += 1;
                report.errors.push(error);
            }
            if let Some(cost) = output.estimated_cost {
                *estimated_cost.get_or_insert(0.0) += cost;
            }
        }
        report.estimated_cost = estimated_cost;
        let transcript = (!page_texts.is_empty()).then(|| Transcript {
            filename: document.filename.clone(),
            text: page_texts.concat(),
        });

        if form_data.is_empty() {
            report.status = if report.errors.is_empty() {
                DocumentStatus::NoAnswers
            } else {
                DocumentStatus::Failed
            };
            return DocumentOutcome {
                result: None,
                transcript,
                report,
            };
        }
        report.status = if failed_pages > 0 {
            DocumentStatus::Incomplete
        } else if used_fallback {
            DocumentStatus::Degraded
        } else {
            DocumentStatus::Ok
        };

        let fields = build_field_map(queries, &form_data);
        DocumentOutcome {
            result: Some(DocumentResult {
                filename: document.filename,
                fields,
            }),
            transcript,
            report,
        }
    }

    /// Process a single page, falling back to plain OCR if the query engine
    /// fails.
    #[instrument(level = "debug", skip_all, fields(page = page_idx + 1))]
    async fn extract_page(
        &self,
        page_idx: usize,
        page: &Page,
        queries: &QuerySet,
    ) -> PageOutput {
        let primary_err = match self.primary.analyze(page, queries).await {
            Ok(blocks) => {
                return PageOutput {
                    form_data: reconcile_primary(&blocks),
                    transcript: Some(transcribe_lines(&blocks)),
                    estimated_cost: self.primary.estimated_page_cost(),
                    ..PageOutput::default()
                };
            }
            Err(err) => err,
        };

        let page_number = page_idx + 1;
        warn!("Page {page_number}: {primary_err}; using fallback OCR");
        let warning = format!("page {page_number}: {primary_err}; used fallback OCR");
        match self.fallback.recognize(page).await {
            Ok(text) => PageOutput {
                form_data: reconcile_fallback(&text, queries),
                transcript: Some(text),
                used_fallback: true,
                warning: Some(warning),
                ..PageOutput::default()
            },
            Err(fallback_err) => {
                error!("Page {page_number}: {fallback_err}");
                PageOutput {
                    used_fallback: true,
                    warning: Some(warning),
                    error: Some(format!("page {page_number}: {fallback_err}")),
                    ..PageOutput::default()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{
        engines::fake::{FakeFallback, FakePrimary, FakeRasterizer},
        query::Query,
        table::NOT_FOUND,
    };

    const PNG_MIME: &str = "image/png";
    const PDF_MIME: &str = "application/pdf";

    fn queries(aliases: &[&str]) -> QuerySet {
        QuerySet::new(
            aliases
                .iter()
                .map(|a| Query::new(*a, format!("What is {a}?")))
                .collect(),
        )
        .unwrap()
    }

    fn document(filename: &str, data: &[u8], mime_type: &str) -> Document {
        Document {
            filename: filename.to_owned(),
            data: data.to_vec(),
            mime_type: mime_type.to_owned(),
        }
    }

    fn extractor(
        rasterizer: FakeRasterizer,
        primary: FakePrimary,
        fallback: FakeFallback,
    ) -> Extractor {
        Extractor::new(Arc::new(rasterizer), Arc::new(primary), Arc::new(fallback), 4)
    }

    #[tokio::test]
    async fn primary_answers_become_fields() {
        let extractor = extractor(
            FakeRasterizer::default(),
            FakePrimary::default().with_answers(b"img", &[("A", "Paris", 97.5)]),
            FakeFallback::default(),
        );
        let queries = queries(&["A", "B"]);
        let extraction = extractor
            .extract(vec![document("city.png", b"img", PNG_MIME)], &queries)
            .await;

        let rows = extraction.table.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].filename, "city.png");
        assert_eq!(rows[0].fields.get("A"), Some("Paris --> 97.5"));
        assert_eq!(rows[0].fields.get("B"), Some(NOT_FOUND));
        assert_eq!(rows[0].fields.len(), queries.len());
        assert_eq!(extraction.reports[0].status, DocumentStatus::Ok);
        assert_eq!(extraction.reports[0].estimated_cost, Some(0.01));
    }

    #[tokio::test]
    async fn rows_keep_upload_order() {
        let extractor = extractor(
            FakeRasterizer::default().with_pdf(b"pdf-b", &[b"b1"]),
            FakePrimary::default()
                .with_answers(b"b1", &[("X", "from B", 90.0)])
                .with_answers(b"a1", &[("X", "from A", 80.0)]),
            FakeFallback::default(),
        );
        let extraction = extractor
            .extract(
                vec![
                    document("B.pdf", b"pdf-b", PDF_MIME),
                    document("A.png", b"a1", PNG_MIME),
                ],
                &queries(&["X"]),
            )
            .await;
        let filenames = extraction
            .table
            .rows()
            .iter()
            .map(|r| r.filename.as_str())
            .collect::<Vec<_>>();
        assert_eq!(filenames, vec!["B.pdf", "A.png"]);
    }

    #[tokio::test]
    async fn later_pages_win() {
        let extractor = extractor(
            FakeRasterizer::default().with_pdf(b"pdf", &[b"p1", b"p2", b"p3"]),
            FakePrimary::default()
                .with_answers(b"p1", &[("X", "foo", 90.0), ("Y", "only on one", 70.0)])
                .with_answers(b"p2", &[("X", "bar", 60.0)])
                .with_answers(b"p3", &[]),
            FakeFallback::default(),
        );
        let extraction = extractor
            .extract(vec![document("two.pdf", b"pdf", PDF_MIME)], &queries(&["X", "Y"]))
            .await;
        let fields = &extraction.table.rows()[0].fields;
        assert_eq!(fields.get("X"), Some("bar --> 60.0"));
        assert_eq!(fields.get("Y"), Some("only on one --> 70.0"));
        assert_eq!(extraction.reports[0].page_count, 3);
    }

    #[tokio::test]
    async fn primary_failure_falls_back_to_raw_text() {
        let raw = "ACME Corp\nInvoice 42";
        let extractor = extractor(
            FakeRasterizer::default(),
            FakePrimary::default(),
            FakeFallback::default().with_text(b"scan", raw),
        );
        let extraction = extractor
            .extract(
                vec![document("scan.jpg", b"scan", "image/jpeg")],
                &queries(&["company", "number"]),
            )
            .await;
        let row = &extraction.table.rows()[0];
        assert!(row.fields.iter().all(|(_, value)| value == raw));
        let report = &extraction.reports[0];
        assert_eq!(report.status, DocumentStatus::Degraded);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn unsupported_types_are_skipped_silently() {
        let extractor = extractor(
            FakeRasterizer::default(),
            FakePrimary::default().with_answers(b"img", &[("X", "1", 99.0)]),
            FakeFallback::default(),
        );
        let extraction = extractor
            .extract(
                vec![
                    document("notes.txt", b"img", "text/plain"),
                    document("ok.png", b"img", PNG_MIME),
                ],
                &queries(&["X"]),
            )
            .await;
        assert_eq!(extraction.table.rows().len(), 1);
        assert_eq!(extraction.table.rows()[0].filename, "ok.png");
        assert_eq!(extraction.reports[0].status, DocumentStatus::Skipped);
        assert!(extraction.reports[0].errors.is_empty());
        assert_eq!(extraction.count_status(DocumentStatus::Skipped), 1);
    }

    #[tokio::test]
    async fn bad_pdf_does_not_abort_batch() {
        let extractor = extractor(
            FakeRasterizer::default(),
            FakePrimary::default().with_answers(b"img", &[("X", "1", 99.0)]),
            FakeFallback::default(),
        );
        let extraction = extractor
            .extract(
                vec![
                    document("broken.pdf", b"garbage", PDF_MIME),
                    document("ok.png", b"img", PNG_MIME),
                ],
                &queries(&["X"]),
            )
            .await;
        assert_eq!(extraction.table.rows().len(), 1);
        let broken = &extraction.reports[0];
        assert_eq!(broken.status, DocumentStatus::Failed);
        assert!(broken.errors[0].contains("could not rasterize PDF"));
        assert_eq!(extraction.reports[1].status, DocumentStatus::Ok);
    }

    #[tokio::test]
    async fn double_failure_is_contained_to_its_page() {
        let extractor = extractor(
            FakeRasterizer::default().with_pdf(b"pdf", &[b"good", b"bad"]),
            FakePrimary::default().with_answers(b"good", &[("X", "42", 95.0)]),
            FakeFallback::default(),
        );
        let extraction = extractor
            .extract(vec![document("mixed.pdf", b"pdf", PDF_MIME)], &queries(&["X"]))
            .await;
        assert_eq!(extraction.table.rows()[0].fields.get("X"), Some("42 --> 95.0"));
        let report = &extraction.reports[0];
        assert_eq!(report.status, DocumentStatus::Incomplete);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("page 2:"));
    }

    #[tokio::test]
    async fn document_without_answers_has_no_row() {
        let extractor = extractor(
            FakeRasterizer::default(),
            FakePrimary::default().with_answers(b"blank", &[]),
            FakeFallback::default(),
        );
        let extraction = extractor
            .extract(
                vec![
                    document("blank.png", b"blank", PNG_MIME),
                    document("unreadable.png", b"unreadable", PNG_MIME),
                ],
                &queries(&["X"]),
            )
            .await;
        assert!(extraction.table.rows().is_empty());
        assert_eq!(extraction.reports[0].status, DocumentStatus::NoAnswers);
        assert_eq!(extraction.reports[1].status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn extraction_is_repeatable() {
        let extractor = extractor(
            FakeRasterizer::default().with_pdf(b"pdf", &[b"p1", b"p2"]),
            FakePrimary::default().with_answers(b"p1", &[("X", "a", 50.5)]),
            FakeFallback::default().with_text(b"p2", "raw"),
        );
        let queries = queries(&["X", "Y"]);
        let documents = vec![document("doc.pdf", b"pdf", PDF_MIME)];
        let first = extractor.extract(documents.clone(), &queries).await;
        let second = extractor.extract(documents, &queries).await;
        assert_eq!(first.table, second.table);
        // The fallback text from page 2 overrides page 1's answer.
        assert_eq!(first.table.rows()[0].fields.get("X"), Some("raw"));
    }

    #[tokio::test]
    async fn primary_called_once_per_page() {
        let primary = Arc::new(
            FakePrimary::default()
                .with_answers(b"p1", &[])
                .with_answers(b"p2", &[]),
        );
        let extractor = Extractor::new(
            Arc::new(FakeRasterizer::default().with_pdf(b"pdf", &[b"p1", b"p2"])),
            primary.clone(),
            Arc::new(FakeFallback::default()),
            1,
        );
        extractor
            .extract(vec![document("doc.pdf", b"pdf", PDF_MIME)], &queries(&["X", "Y"]))
            .await;
        assert_eq!(primary.call_count(), 2);
    }

    #[tokio::test]
    async fn transcript_joins_pages_in_order() {
        let extractor = extractor(
            FakeRasterizer::default().with_pdf(b"pdf", &[b"p1", b"p2", b"p3"]),
            FakePrimary::default()
                .with_lines(b"p1", &["INVOICE", "Number: 42"])
                .with_answers(b"p1", &[("number", "42", 95.0)])
                .with_lines(b"p3", &["Total: $10"]),
            FakeFallback::default().with_text(b"p2", "scanned page two\n"),
        );
        let extraction = extractor
            .extract(
                vec![
                    document("invoice.pdf", b"pdf", PDF_MIME),
                    document("notes.txt", b"text", "text/plain"),
                ],
                &queries(&["number"]),
            )
            .await;
        assert_eq!(
            extraction.transcripts,
            vec![Transcript {
                filename: "invoice.pdf".to_owned(),
                text: "INVOICE\nNumber: 42\nscanned page two\nTotal: $10\n".to_owned(),
            }]
        );
    }

    #[tokio::test]
    async fn transcript_kept_without_answers() {
        let extractor = extractor(
            FakeRasterizer::default(),
            FakePrimary::default().with_lines(b"img", &["Nothing to see"]),
            FakeFallback::default(),
        );
        let extraction = extractor
            .extract(vec![document("blank.png", b"img", PNG_MIME)], &queries(&["X"]))
            .await;
        assert!(extraction.table.rows().is_empty());
        assert_eq!(extraction.reports[0].status, DocumentStatus::NoAnswers);
        assert_eq!(extraction.transcripts[0].text, "Nothing to see\n");
    }

    #[tokio::test]
    async fn jpg_pages_reach_fallback_as_jpeg() {
        let fallback = Arc::new(FakeFallback::default().with_text(b"photo", "raw"));
        let extractor = Extractor::new(
            Arc::new(FakeRasterizer::default()),
            Arc::new(FakePrimary::default()),
            fallback.clone(),
            1,
        );
        let extraction = extractor
            .extract(vec![document("photo.jpg", b"photo", "image/jpg")], &queries(&["X"]))
            .await;
        assert_eq!(extraction.reports[0].status, DocumentStatus::Degraded);
        assert_eq!(
            *fallback.mime_types.lock().unwrap(),
            vec!["image/jpeg".to_owned()]
        );
    }
}
