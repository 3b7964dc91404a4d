//! Scripted engines for unit tests. Pages are identified by their bytes.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use super::{FallbackOcrEngine, PrimaryQueryEngine};
use crate::{
    ocr::{
        blocks::{Block, BlockType, RelationshipType},
        errors::{FallbackEngineError, PrimaryEngineError, RasterizationError},
        query::QuerySet,
    },
    page_iter::{Page, Rasterizer},
    prelude::*,
};

/// Splits known PDFs into known pages. Unknown input fails.
#[derive(Default)]
pub struct FakeRasterizer {
    pub documents: HashMap<Vec<u8>, Vec<Vec<u8>>>,
}

impl FakeRasterizer {
    pub fn with_pdf(mut self, pdf: &[u8], pages: &[&[u8]]) -> Self {
        self.documents
            .insert(pdf.to_vec(), pages.iter().map(|p| p.to_vec()).collect());
        self
    }
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn rasterize(&self, pdf: &[u8]) -> Result<Vec<Page>, RasterizationError> {
        let pages = self
            .documents
            .get(pdf)
            .ok_or_else(|| RasterizationError::new(anyhow!("not a PDF")))?;
        Ok(pages
            .iter()
            .map(|data| Page {
                mime_type: "image/png".to_owned(),
                data: data.clone(),
            })
            .collect())
    }
}

/// Answers queries for known pages. Unknown pages fail.
#[derive(Default)]
pub struct FakePrimary {
    pub pages: HashMap<Vec<u8>, Vec<Block>>,
    pub calls: AtomicUsize,
}

impl FakePrimary {
    /// Answer `alias` on `page` with each `(text, confidence)` given.
    pub fn with_answers(mut self, page: &[u8], answers: &[(&str, &str, f32)]) -> Self {
        let blocks = self.pages.entry(page.to_vec()).or_default();
        for (alias, text, confidence) in answers {
            let n = blocks.len();
            let answer_id = format!("answer-{n}");
            blocks.push(
                Block::new(format!("query-{n}"), BlockType::Query)
                    .with_alias(*alias)
                    .with_relationship(RelationshipType::Answer, [answer_id.clone()]),
            );
            blocks.push(
                Block::new(answer_id, BlockType::QueryResult).with_text(*text, *confidence),
            );
        }
        self
    }

    /// Add `LINE` blocks to `page`.
    pub fn with_lines(mut self, page: &[u8], lines: &[&str]) -> Self {
        let blocks = self.pages.entry(page.to_vec()).or_default();
        for line in lines {
            let id = format!("line-{}", blocks.len());
            blocks.push(Block::new(id, BlockType::Line).with_text(*line, 99.0));
        }
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrimaryQueryEngine for FakePrimary {
    async fn analyze(
        &self,
        page: &Page,
        _queries: &QuerySet,
    ) -> Result<Vec<Block>, PrimaryEngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages
            .get(&page.data)
            .cloned()
            .ok_or_else(|| PrimaryEngineError::new(anyhow!("service unavailable")))
    }

    fn estimated_page_cost(&self) -> Option<f64> {
        Some(0.01)
    }
}

/// Transcribes known pages. Unknown pages fail.
#[derive(Default)]
pub struct FakeFallback {
    pub pages: HashMap<Vec<u8>, String>,
    /// The MIME type of every page we were asked about.
    pub mime_types: Mutex<Vec<String>>,
}

impl FakeFallback {
    pub fn with_text(mut self, page: &[u8], text: &str) -> Self {
        self.pages.insert(page.to_vec(), text.to_owned());
        self
    }
}

#[async_trait]
impl FallbackOcrEngine for FakeFallback {
    async fn recognize(&self, page: &Page) -> Result<String, FallbackEngineError> {
        self.mime_types
            .lock()
            .expect("lock poisoned")
            .push(page.mime_type.clone());
        self.pages
            .get(&page.data)
            .cloned()
            .ok_or_else(|| FallbackEngineError::new(anyhow!("tesseract not installed")))
    }
}
