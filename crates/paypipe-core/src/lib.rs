//! Backend-agnostic types, traits, and pipeline logic for discovering,
//! cost-filtering, and settling pay-per-call marketplace endpoints.
//!
//! Network IO lives behind the [`Marketplace`] and [`TermGenerator`] traits;
//! implementations are provided by `paypipe-local`.

use serde_json::Value;

pub mod endpoint;
pub mod money;
pub mod pipeline;
pub mod request;

pub use endpoint::{EndpointInfo, EndpointRef, EndpointUrl, FailureRecord, QuerySchema};
pub use money::{crypto_to_usd, PriceOracle, StaticPriceTable};
pub use pipeline::{
    run_pipeline, summarize, CostFilter, EndpointSearcher, FilterOutcome, PipelineConfig,
    RunReport, RunSummary, SearchOutcome, SettleOutcome, SettlementEngine, SettlementResult,
    ViableEndpoint, MAX_SEARCH_TERMS,
};
pub use request::{Method, RequestBuilder, RequestOptions};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Term generation failed. This is the only error that aborts a run.
    #[error("term generation failed: {0}")]
    Generation(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("metadata fetch failed: {0}")]
    Metadata(String),
    #[error("payment failed: {0}")]
    Payment(String),
    #[error("paid call failed: {0}")]
    Settlement(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Turns a free-text developer query into search terms.
///
/// Implementations may return more than [`MAX_SEARCH_TERMS`] terms; the
/// pipeline truncates. A response that cannot be shaped into terms must be
/// reported as [`Error::Generation`].
#[async_trait::async_trait]
pub trait TermGenerator: Send + Sync {
    async fn generate_terms(&self, query: &str) -> Result<Vec<String>>;
}

/// The response body of a paid call, plus an optional settlement receipt.
#[derive(Debug, Clone)]
pub struct PaidResponse {
    pub data: Value,
    pub receipt: Option<PaymentReceipt>,
}

/// On-chain settlement details reported back by the marketplace, when present.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PaymentReceipt {
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
}

/// The narrow marketplace surface the pipeline consumes.
///
/// `info` is a free metadata read; `pay_and_fetch` triggers an on-chain
/// payment as a precondition for receiving the response body. Credentials are
/// held by the implementation and treated as opaque capability tokens.
#[async_trait::async_trait]
pub trait Marketplace: Send + Sync {
    async fn info(&self, url: &EndpointUrl) -> Result<EndpointInfo>;
    async fn pay_and_fetch(&self, url: &EndpointUrl, options: &RequestOptions)
        -> Result<PaidResponse>;
}
