//! OCR engine interfaces.
//!
//! We use two very different engines. The primary engine answers queries
//! directly and returns a block graph. The fallback engine only transcribes
//! text, and is used when the primary engine fails.

use std::sync::Arc;

use clap::{Args, ValueEnum};

use super::{
    blocks::Block,
    errors::{FallbackEngineError, PrimaryEngineError},
    query::QuerySet,
};
use crate::{page_iter::Page, prelude::*, rate_limit::RateLimit};

use self::{
    tesseract::{DisabledFallbackEngine, TesseractOcrEngine},
    textract::TextractQueryEngine,
};

#[cfg(test)]
pub mod fake;
pub mod tesseract;
pub mod textract;

/// A structured query engine: answers a set of queries about one page.
#[async_trait]
pub trait PrimaryQueryEngine: Send + Sync + 'static {
    /// Ask every query about `page` in a single request.
    async fn analyze(
        &self,
        page: &Page,
        queries: &QuerySet,
    ) -> Result<Vec<Block>, PrimaryEngineError>;

    /// Roughly how much does one successful page cost, in US dollars?
    fn estimated_page_cost(&self) -> Option<f64> {
        None
    }
}

/// A plain OCR engine: transcribes all the text on one page.
#[async_trait]
pub trait FallbackOcrEngine: Send + Sync + 'static {
    /// Transcribe `page`.
    async fn recognize(&self, page: &Page) -> Result<String, FallbackEngineError>;
}

/// Which fallback engine should we use?
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum FallbackKind {
    /// Run the `tesseract` CLI tool locally.
    #[default]
    Tesseract,
    /// Don't fall back. Pages the query engine can't handle are lost.
    #[value(name = "none")]
    Disabled,
}

/// Options for configuring our OCR engines.
#[derive(Args, Clone, Debug)]
pub struct EngineOpts {
    /// Limit Textract requests, e.g. "5/s" or "100/m". Defaults to `--jobs`
    /// requests per second.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// The OCR engine to use when Textract fails on a page.
    #[clap(long, value_enum, default_value = "tesseract")]
    pub fallback: FallbackKind,

    /// Path to the `tesseract` binary.
    #[clap(long, env = "TESSERACT_PATH", default_value = "tesseract")]
    pub tesseract_path: PathBuf,

    /// Tesseract language(s), such as "eng" or "eng+fra".
    #[clap(long, env = "TESSERACT_LANG")]
    pub tesseract_lang: Option<String>,
}

/// Create the primary query engine.
pub async fn primary_engine(
    opts: &EngineOpts,
    concurrency_limit: usize,
) -> Result<Arc<dyn PrimaryQueryEngine>> {
    // Without an explicit rate limit, allow one request per second for each
    // job we run in parallel.
    let rate_limit = opts
        .rate_limit
        .clone()
        .unwrap_or_else(|| RateLimit::per_second(concurrency_limit));
    let engine = TextractQueryEngine::new(&rate_limit)
        .await
        .context("could not configure AWS Textract")?;
    Ok(Arc::new(engine))
}

/// Create the fallback OCR engine.
pub fn fallback_engine(opts: &EngineOpts) -> Arc<dyn FallbackOcrEngine> {
    match opts.fallback {
        FallbackKind::Tesseract => Arc::new(TesseractOcrEngine::new(
            opts.tesseract_path.clone(),
            opts.tesseract_lang.clone(),
        )),
        FallbackKind::Disabled => Arc::new(DisabledFallbackEngine),
    }
}
