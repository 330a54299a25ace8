//! Local (reqwest) implementations for paypipe.
//!
//! `market` talks to the pay-per-call marketplace (metadata reads and paid
//! calls gated by an `X-Payment` header); `openai_compat` talks to any
//! OpenAI-compatible chat-completions API for term generation and result
//! analysis. All configuration comes from the environment via `from_env`
//! constructors.

pub mod market;
pub mod openai_compat;

pub use market::{
    fetch_info, market_base_url_from_env, search_url_from_env, Credentials, MarketplaceClient,
};
pub use openai_compat::{summarize_results, LlmTermGenerator, OpenAiCompatClient};
