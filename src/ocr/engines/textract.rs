//! Structured queries using AWS Textract's `AnalyzeDocument` API.

use std::env;

use aws_sdk_textract::{
    error::SdkError,
    operation::analyze_document::AnalyzeDocumentError,
    primitives::Blob,
    types::{self as textract, FeatureType, QueriesConfig},
};
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use leaky_bucket::RateLimiter;

use super::PrimaryQueryEngine;
use crate::{
    aws::load_aws_config,
    ocr::{
        blocks::{Block, BlockType, Relationship, RelationshipType},
        errors::PrimaryEngineError,
        query::QuerySet,
    },
    page_iter::Page,
    prelude::*,
    rate_limit::RateLimit,
    retry::{IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient},
};

/// Our estimated page cost for the Queries feature, at list price.
const ESTIMATED_PAGE_COST: f64 = 0.015;

/// Query engine wrapping the AWS Textract API.
pub struct TextractQueryEngine {
    /// AWS Textract client.
    client: aws_sdk_textract::Client,

    /// A rate limiter to avoid hitting API limits.
    rate_limiter: RateLimiter,

    /// Log full responses at `trace` level.
    debug: bool,
}

impl TextractQueryEngine {
    /// Create a new `textract` engine.
    pub async fn new(rate_limit: &RateLimit) -> Result<Self> {
        let config = load_aws_config().await?;
        let client = aws_sdk_textract::Client::new(&config);
        debug!(%rate_limit, "Created Textract client");
        Ok(Self {
            client,
            rate_limiter: rate_limit.to_rate_limiter(),
            debug: env::var("TEXTRACT_DEBUG").is_ok(),
        })
    }

    /// Make a single `AnalyzeDocument` request.
    async fn analyze_once(
        &self,
        page: &Page,
        queries: &QuerySet,
    ) -> RetryResult<(), (), Vec<Block>, anyhow::Error> {
        // Rate limit the request.
        self.rate_limiter.acquire_one().await;

        let queries_config = try_fatal!(queries_config(queries));
        let document = textract::Document::builder()
            .bytes(Blob::new(page.data.clone()))
            .build();

        let response = try_potentially_transient!(
            self.client
                .analyze_document()
                .document(document)
                .feature_types(FeatureType::Queries)
                .queries_config(queries_config)
                .send()
                .await
        );
        if self.debug {
            trace!("Document response: {response:#?}");
        }

        let blocks = response
            .blocks()
            .iter()
            .filter_map(convert_block)
            .collect::<Vec<_>>();
        debug!(block_count = blocks.len(), "Textract analyzed page");
        retry_result_ok(blocks)
    }
}

#[async_trait]
impl PrimaryQueryEngine for TextractQueryEngine {
    #[instrument(level = "debug", skip_all, fields(queries = queries.len()))]
    async fn analyze(
        &self,
        page: &Page,
        queries: &QuerySet,
    ) -> Result<Vec<Block>, PrimaryEngineError> {
        // If we have a transient failure, back off exponentially. We keep this
        // fairly short, because the fallback engine is waiting.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 100..=10_000,
            re_attempts: 3,
            jitter_ratio: 0.2,
        };

        let result = self
            .analyze_once(page, queries)
            .await
            .retry_with_async(|_| async { self.analyze_once(page, queries).await })
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "Textract succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                warn!(
                    "Textract failed after {} retries with error {fatal_error:?}. Previous transient failures: [{}]",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            });

        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => Err(PrimaryEngineError::new(error)),
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => {
                Err(PrimaryEngineError::new(fatal_error))
            }
        }
    }

    fn estimated_page_cost(&self) -> Option<f64> {
        Some(ESTIMATED_PAGE_COST)
    }
}

/// Build the Textract form of our queries.
fn queries_config(queries: &QuerySet) -> Result<QueriesConfig> {
    let queries = queries
        .queries()
        .iter()
        .map(|query| {
            textract::Query::builder()
                .text(&query.text)
                .alias(&query.alias)
                .build()
                .with_context(|| format!("invalid Textract query {:?}", query.alias))
        })
        .collect::<Result<Vec<_>>>()?;
    QueriesConfig::builder()
        .set_queries(Some(queries))
        .build()
        .context("invalid Textract queries config")
}

/// Convert a Textract block into our own [`Block`]. Blocks without an ID
/// can't be referenced, so we drop them.
fn convert_block(block: &textract::Block) -> Option<Block> {
    let id = block.id()?;
    let block_type = match block.block_type() {
        Some(textract::BlockType::Query) => BlockType::Query,
        Some(textract::BlockType::QueryResult) => BlockType::QueryResult,
        Some(textract::BlockType::Line) => BlockType::Line,
        Some(other) => BlockType::Other(other.as_str().to_owned()),
        None => BlockType::Other("UNKNOWN".to_owned()),
    };
    let mut converted = Block::new(id, block_type);
    converted.alias = block.query().and_then(|q| q.alias()).map(str::to_owned);
    converted.text = block.text().map(str::to_owned);
    converted.confidence = block.confidence();
    converted.relationships = block
        .relationships()
        .iter()
        .map(|relationship| Relationship {
            kind: match relationship.r#type() {
                Some(textract::RelationshipType::Answer) => RelationshipType::Answer,
                Some(textract::RelationshipType::Child) => RelationshipType::Child,
                Some(other) => RelationshipType::Other(other.as_str().to_owned()),
                None => RelationshipType::Other("UNKNOWN".to_owned()),
            },
            ids: relationship.ids().to_vec(),
        })
        .collect();
    Some(converted)
}

impl IsKnownTransient for SdkError<AnalyzeDocumentError> {
    fn is_known_transient(&self) -> bool {
        match self {
            SdkError::TimeoutError(_) => true,
            SdkError::DispatchFailure(dispatch) => {
                dispatch.is_io() || dispatch.is_timeout()
            }
            SdkError::ResponseError(response) => {
                response.raw().status().is_known_transient()
            }
            SdkError::ServiceError(service_err) => service_err.err().is_known_transient(),
            _ => false,
        }
    }
}

impl IsKnownTransient for AnalyzeDocumentError {
    fn is_known_transient(&self) -> bool {
        matches!(
            self,
            AnalyzeDocumentError::InternalServerError(_)
                | AnalyzeDocumentError::ProvisionedThroughputExceededException(_)
                | AnalyzeDocumentError::ThrottlingException(_)
        )
    }
}
