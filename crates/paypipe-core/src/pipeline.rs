//! The discovery -> filter -> settle pipeline.
//!
//! Data flows strictly left to right: query -> terms -> candidate URLs ->
//! deduplicated set -> cost-filtered list -> top-K selection -> settled
//! results plus a failure log -> summary. Each phase owns its accumulating
//! collections and hands them off; nothing is shared across phases.
//!
//! Search and metadata reads fan out with bounded, order-preserving
//! concurrency. Settlement is strictly sequential: every settlement is a real
//! monetary transaction, so no call starts before the previous one resolved.

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::endpoint::{EndpointInfo, EndpointRef, EndpointUrl, FailureRecord};
use crate::money::{crypto_to_usd, PriceOracle};
use crate::request::{RequestBuilder, RequestOptions};
use crate::{Error, Marketplace, PaymentReceipt, Result, TermGenerator};

/// Hard cap on search terms per query. Generators may return more; the
/// pipeline truncates to the first entries before any search starts.
pub const MAX_SEARCH_TERMS: usize = 3;

const MAX_PARALLEL_CAP: usize = 16;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The marketplace's own (paid) search endpoint.
    pub search_url: EndpointUrl,
    pub budget_usd: f64,
    /// How many viable endpoints to settle, in discovery order.
    pub top_k: usize,
    /// Bound for the search and metadata fan-out stages.
    pub max_parallel: usize,
    pub fast_mode: bool,
}

impl PipelineConfig {
    pub fn new(search_url: EndpointUrl) -> Self {
        Self {
            search_url,
            budget_usd: 0.30,
            top_k: 2,
            max_parallel: 4,
            fast_mode: true,
        }
    }
}

/// An `EndpointInfo` whose converted cost passed the budget check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViableEndpoint {
    pub url: EndpointUrl,
    pub cost_usd: f64,
    pub info: EndpointInfo,
}

/// One settled endpoint and the data its paid call returned. Failures are
/// only ever in the failure list, never here.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementResult {
    pub endpoint: ViableEndpoint,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<PaymentReceipt>,
}

#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub candidates: Vec<EndpointUrl>,
    pub failures: Vec<FailureRecord>,
}

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub viable: Vec<ViableEndpoint>,
    pub failures: Vec<FailureRecord>,
}

#[derive(Debug, Default)]
pub struct SettleOutcome {
    pub results: Vec<SettlementResult>,
    pub failures: Vec<FailureRecord>,
}

#[derive(Debug, Deserialize)]
struct SearchResultsBody {
    #[serde(default)]
    endpoints: Vec<EndpointRef>,
}

/// Executes one paid search per term and deduplicates the hits into an
/// ordered candidate set.
pub struct EndpointSearcher<'a> {
    market: &'a dyn Marketplace,
    search_url: &'a EndpointUrl,
    fast_mode: bool,
    max_parallel: usize,
}

impl<'a> EndpointSearcher<'a> {
    pub fn new(market: &'a dyn Marketplace, config: &'a PipelineConfig) -> Self {
        Self {
            market,
            search_url: &config.search_url,
            fast_mode: config.fast_mode,
            max_parallel: config.max_parallel,
        }
    }

    async fn search_term(&self, term: &str) -> Result<Vec<EndpointRef>> {
        let options = RequestOptions::post(json!({ "query": term }), self.fast_mode);
        let resp = self.market.pay_and_fetch(self.search_url, &options).await?;
        let body: SearchResultsBody = serde_json::from_value(resp.data)
            .map_err(|e| Error::Search(format!("bad search response shape: {e}")))?;
        Ok(body.endpoints)
    }

    /// One paid search per term; a failed term is recorded and never aborts
    /// the remaining terms. Candidates keep first-seen order; re-adding an
    /// existing URL is a no-op.
    pub async fn search(&self, terms: &[String]) -> SearchOutcome {
        let max_parallel = self.max_parallel.clamp(1, MAX_PARALLEL_CAP);
        let outcomes = stream::iter(
            terms
                .iter()
                .map(|term| async move { (term.as_str(), self.search_term(term).await) }),
        )
        .buffered(max_parallel)
        .collect::<Vec<_>>()
        .await;

        let mut out = SearchOutcome::default();
        for (term, outcome) in outcomes {
            match outcome {
                Ok(refs) => {
                    debug!(term, results = refs.len(), "search term resolved");
                    for r in refs {
                        match EndpointUrl::new(
                            self.search_url.base(),
                            &r.namespace,
                            &r.endpoint_name,
                        ) {
                            Ok(u) => {
                                if !out.candidates.contains(&u) {
                                    out.candidates.push(u);
                                }
                            }
                            Err(e) => out.failures.push(FailureRecord::new(
                                self.search_url,
                                format!("term {term:?}: {e}"),
                            )),
                        }
                    }
                }
                Err(e) => {
                    warn!(term, error = %e, "search term failed");
                    out.failures.push(FailureRecord::new(
                        self.search_url,
                        format!("term {term:?}: {e}"),
                    ));
                }
            }
        }
        out
    }
}

/// Fetches metadata per candidate and keeps the ones the budget can cover.
pub struct CostFilter<'a> {
    market: &'a dyn Marketplace,
    oracle: &'a dyn PriceOracle,
    max_parallel: usize,
}

impl<'a> CostFilter<'a> {
    pub fn new(
        market: &'a dyn Marketplace,
        oracle: &'a dyn PriceOracle,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            market,
            oracle,
            max_parallel: config.max_parallel,
        }
    }

    /// Metadata reads fan out bounded and order-preserving, so `viable`
    /// keeps discovery order. A candidate that costs more than the budget is
    /// dropped silently; "too expensive" is not a failure. The boundary is
    /// inclusive: `cost_usd == budget` passes.
    pub async fn filter(&self, candidates: &[EndpointUrl], budget_usd: f64) -> FilterOutcome {
        let max_parallel = self.max_parallel.clamp(1, MAX_PARALLEL_CAP);
        let fetched = stream::iter(
            candidates
                .iter()
                .map(|url| async move { (url, self.market.info(url).await) }),
        )
        .buffered(max_parallel)
        .collect::<Vec<_>>()
        .await;

        let mut out = FilterOutcome::default();
        for (url, outcome) in fetched {
            let info = match outcome {
                Ok(info) => info,
                Err(e) => {
                    warn!(url = %url, error = %e, "info fetch failed");
                    out.failures.push(FailureRecord::new(url, e));
                    continue;
                }
            };
            let cost_usd =
                match crypto_to_usd(&info.required_amount, &info.chain, self.oracle) {
                    Ok(cost) => cost,
                    Err(e) => {
                        out.failures.push(FailureRecord::new(url, e));
                        continue;
                    }
                };
            if cost_usd <= budget_usd {
                debug!(url = %url, cost_usd, "endpoint within budget");
                out.viable.push(ViableEndpoint {
                    url: url.clone(),
                    cost_usd,
                    info,
                });
            } else {
                debug!(url = %url, cost_usd, budget_usd, "skipped: cost exceeds budget");
            }
        }
        out
    }
}

/// Performs the paid call for the selected endpoints, one at a time.
pub struct SettlementEngine<'a> {
    market: &'a dyn Marketplace,
    builder: &'a RequestBuilder,
}

impl<'a> SettlementEngine<'a> {
    pub fn new(market: &'a dyn Marketplace, builder: &'a RequestBuilder) -> Self {
        Self { market, builder }
    }

    /// Settles the first `top_k` endpoints in discovery order. Each endpoint
    /// is attempted exactly once, no retry; every attempt lands in exactly
    /// one of `results` or `failures`.
    pub async fn settle(&self, viable: &[ViableEndpoint], top_k: usize) -> SettleOutcome {
        let mut out = SettleOutcome::default();
        for ep in viable.iter().take(top_k) {
            let options = self.builder.build(&ep.info);
            match self.market.pay_and_fetch(&ep.url, &options).await {
                Ok(resp) if resp.data.is_null() => {
                    warn!(url = %ep.url, "settlement returned no data");
                    out.failures
                        .push(FailureRecord::new(&ep.url, "settlement returned no data"));
                }
                Ok(resp) => {
                    info!(url = %ep.url, cost_usd = ep.cost_usd, "settled");
                    out.results.push(SettlementResult {
                        endpoint: ep.clone(),
                        data: resp.data,
                        receipt: resp.receipt,
                    });
                }
                Err(e) => {
                    warn!(url = %ep.url, error = %e, "settlement failed");
                    out.failures.push(FailureRecord::new(&ep.url, e));
                }
            }
        }
        out
    }
}

/// Aggregate totals for reporting.
///
/// `total_cost_usd` sums the full viable list, not just the settled top-K:
/// "what was affordable" and "what was purchased" are reported independently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub viable_count: usize,
    pub total_cost_usd: f64,
    pub failure_count: usize,
}

pub fn summarize(viable: &[ViableEndpoint], failures: &[FailureRecord]) -> RunSummary {
    RunSummary {
        viable_count: viable.len(),
        total_cost_usd: viable.iter().map(|v| v.cost_usd).sum(),
        failure_count: failures.len(),
    }
}

/// Everything one pipeline run produced.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub query: String,
    pub terms: Vec<String>,
    pub candidates: Vec<EndpointUrl>,
    pub viable: Vec<ViableEndpoint>,
    pub results: Vec<SettlementResult>,
    pub failures: Vec<FailureRecord>,
    pub summary: RunSummary,
}

fn effective_terms(raw: Vec<String>) -> Vec<String> {
    raw.into_iter()
        .take(MAX_SEARCH_TERMS)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Runs the whole pipeline. Only term generation is fatal; every other
/// failure is folded into the report and the run completes with whatever
/// partial results it accumulated.
pub async fn run_pipeline(
    terms_source: &dyn TermGenerator,
    market: &dyn Marketplace,
    oracle: &dyn PriceOracle,
    builder: &RequestBuilder,
    config: &PipelineConfig,
    query: &str,
) -> Result<RunReport> {
    if query.trim().is_empty() {
        return Err(Error::Generation("query must be non-empty".to_string()));
    }

    let terms = effective_terms(terms_source.generate_terms(query).await?);
    if terms.is_empty() {
        return Err(Error::Generation(
            "model produced no usable search terms".to_string(),
        ));
    }
    info!(?terms, "generated search terms");

    let search = EndpointSearcher::new(market, config).search(&terms).await;
    info!(
        candidates = search.candidates.len(),
        failures = search.failures.len(),
        "search complete"
    );

    let filter = CostFilter::new(market, oracle, config)
        .filter(&search.candidates, config.budget_usd)
        .await;
    info!(
        viable = filter.viable.len(),
        budget_usd = config.budget_usd,
        "cost filter complete"
    );

    let settle = SettlementEngine::new(market, builder)
        .settle(&filter.viable, config.top_k)
        .await;

    let mut failures = search.failures;
    failures.extend(filter.failures);
    failures.extend(settle.failures);

    let summary = summarize(&filter.viable, &failures);
    Ok(RunReport {
        query: query.to_string(),
        terms,
        candidates: search.candidates,
        viable: filter.viable,
        results: settle.results,
        failures,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::QuerySchema;
    use crate::PaidResponse;
    use crate::money::StaticPriceTable;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    const BASE: &str = "https://market.test";

    struct StaticTerms(Vec<&'static str>);

    #[async_trait::async_trait]
    impl TermGenerator for StaticTerms {
        async fn generate_terms(&self, _query: &str) -> Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    struct ProseTerms;

    #[async_trait::async_trait]
    impl TermGenerator for ProseTerms {
        async fn generate_terms(&self, _query: &str) -> Result<Vec<String>> {
            Err(Error::Generation("model returned prose, not terms".to_string()))
        }
    }

    #[derive(Default)]
    struct MockMarket {
        search_hits: HashMap<String, Vec<(&'static str, &'static str)>>,
        failing_terms: HashSet<String>,
        infos: HashMap<String, EndpointInfo>,
        failing_info: HashSet<String>,
        failing_settle: HashSet<String>,
        null_settle: HashSet<String>,
        searched_terms: Mutex<Vec<String>>,
        settled_urls: Mutex<Vec<String>>,
    }

    impl MockMarket {
        fn with_search(mut self, term: &str, hits: &[(&'static str, &'static str)]) -> Self {
            self.search_hits.insert(term.to_string(), hits.to_vec());
            self
        }

        fn with_failing_term(mut self, term: &str) -> Self {
            self.failing_terms.insert(term.to_string());
            self
        }

        fn with_info(mut self, info: EndpointInfo) -> Self {
            let url = EndpointUrl::new(BASE, &info.namespace, &info.endpoint_name).unwrap();
            self.infos.insert(url.to_string(), info);
            self
        }

        fn with_failing_info(mut self, ns: &str, name: &str) -> Self {
            let url = EndpointUrl::new(BASE, ns, name).unwrap();
            self.failing_info.insert(url.to_string());
            self
        }

        fn with_failing_settle(mut self, ns: &str, name: &str) -> Self {
            let url = EndpointUrl::new(BASE, ns, name).unwrap();
            self.failing_settle.insert(url.to_string());
            self
        }

        fn with_null_settle(mut self, ns: &str, name: &str) -> Self {
            let url = EndpointUrl::new(BASE, ns, name).unwrap();
            self.null_settle.insert(url.to_string());
            self
        }
    }

    #[async_trait::async_trait]
    impl Marketplace for MockMarket {
        async fn info(&self, url: &EndpointUrl) -> Result<EndpointInfo> {
            let key = url.to_string();
            if self.failing_info.contains(&key) {
                return Err(Error::Metadata("info fetch: HTTP 500".to_string()));
            }
            self.infos
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::Metadata(format!("no info for {key}")))
        }

        async fn pay_and_fetch(
            &self,
            url: &EndpointUrl,
            options: &RequestOptions,
        ) -> Result<PaidResponse> {
            if url.name() == "endpoint-search" {
                let term = options
                    .body
                    .as_ref()
                    .and_then(|b| b.get("query"))
                    .and_then(|q| q.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.searched_terms.lock().unwrap().push(term.clone());
                if self.failing_terms.contains(&term) {
                    return Err(Error::Search("connection reset".to_string()));
                }
                let hits = self.search_hits.get(&term).cloned().unwrap_or_default();
                let endpoints: Vec<Value> = hits
                    .into_iter()
                    .map(|(ns, name)| json!({ "namespace": ns, "endpointName": name }))
                    .collect();
                return Ok(PaidResponse {
                    data: json!({ "endpoints": endpoints }),
                    receipt: None,
                });
            }

            let key = url.to_string();
            self.settled_urls.lock().unwrap().push(key.clone());
            if self.failing_settle.contains(&key) {
                return Err(Error::Settlement("HTTP 502".to_string()));
            }
            if self.null_settle.contains(&key) {
                return Ok(PaidResponse {
                    data: Value::Null,
                    receipt: None,
                });
            }
            Ok(PaidResponse {
                data: json!({ "from": url.name(), "echo": options.body }),
                receipt: Some(PaymentReceipt {
                    transaction: Some("0xabc".to_string()),
                    network: Some("base".to_string()),
                }),
            })
        }
    }

    fn info(ns: &str, name: &str, chain: &str, amount: &str) -> EndpointInfo {
        EndpointInfo {
            namespace: ns.to_string(),
            endpoint_name: name.to_string(),
            url: Some(format!("{BASE}/api/endpoints/{ns}/{name}")),
            description: Some(format!("{name} endpoint")),
            chain: chain.to_string(),
            required_amount: amount.to_string(),
            http_method: "GET".to_string(),
            query_schema: None,
        }
    }

    fn config() -> PipelineConfig {
        let search_url = EndpointUrl::new(BASE, "apinowfun", "endpoint-search").unwrap();
        PipelineConfig::new(search_url)
    }

    fn urls(candidates: &[EndpointUrl]) -> Vec<String> {
        candidates.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn search_dedupes_across_terms_preserving_discovery_order() {
        let market = MockMarket::default()
            .with_search("a", &[("ns", "posts"), ("ns", "users")])
            .with_search("b", &[("ns", "users"), ("ns2", "sdk"), ("ns", "posts")]);
        let cfg = config();
        let terms = vec!["a".to_string(), "b".to_string()];

        let out = EndpointSearcher::new(&market, &cfg).search(&terms).await;

        assert!(out.failures.is_empty());
        assert_eq!(
            urls(&out.candidates),
            vec![
                format!("{BASE}/api/endpoints/ns/posts"),
                format!("{BASE}/api/endpoints/ns/users"),
                format!("{BASE}/api/endpoints/ns2/sdk"),
            ]
        );
    }

    #[tokio::test]
    async fn failed_term_never_aborts_remaining_terms() {
        let market = MockMarket::default()
            .with_search("posts", &[("ns", "posts")])
            .with_failing_term("ycombinator")
            .with_search("sdk-example", &[("ns2", "sdk")]);
        let cfg = config();
        let terms = vec![
            "posts".to_string(),
            "ycombinator".to_string(),
            "sdk-example".to_string(),
        ];

        let out = EndpointSearcher::new(&market, &cfg).search(&terms).await;

        assert_eq!(out.candidates.len(), 2);
        assert_eq!(out.failures.len(), 1);
        assert!(out.failures[0].error.contains("ycombinator"));
        assert_eq!(
            market.searched_terms.lock().unwrap().len(),
            3,
            "all terms must still be searched"
        );
    }

    #[tokio::test]
    async fn terms_are_truncated_to_three_before_search_begins() {
        let market = MockMarket::default().with_search("t1", &[("ns", "posts")]);
        let oracle = StaticPriceTable::default();
        let builder = RequestBuilder::new();
        let cfg = config();
        let gen = StaticTerms(vec!["t1", "t2", "t3", "t4", "t5"]);

        let report = run_pipeline(&gen, &market, &oracle, &builder, &cfg, "find endpoints")
            .await
            .unwrap();

        assert_eq!(report.terms, vec!["t1", "t2", "t3"]);
        let searched = market.searched_terms.lock().unwrap();
        assert_eq!(searched.len(), 3);
        assert!(!searched.contains(&"t4".to_string()));
    }

    #[tokio::test]
    async fn budget_boundary_is_inclusive_and_rejection_is_silent() {
        // 2 sol -> $200 exactly on the $200 budget; 2.1 sol -> $210, over it.
        let market = MockMarket::default()
            .with_info(info("ns", "exact", "sol", "2"))
            .with_info(info("ns", "over", "sol", "2.1"));
        let cfg = config();
        let oracle = StaticPriceTable::default();
        let candidates = vec![
            EndpointUrl::new(BASE, "ns", "exact").unwrap(),
            EndpointUrl::new(BASE, "ns", "over").unwrap(),
        ];

        let out = CostFilter::new(&market, &oracle, &cfg)
            .filter(&candidates, 200.0)
            .await;

        assert_eq!(out.viable.len(), 1);
        assert_eq!(out.viable[0].info.endpoint_name, "exact");
        assert_eq!(out.viable[0].cost_usd, 200.0);
        assert!(out.failures.is_empty(), "too expensive is not a failure");
    }

    #[tokio::test]
    async fn metadata_failures_are_recorded_and_other_candidates_proceed() {
        let market = MockMarket::default()
            .with_failing_info("ns", "broken")
            .with_info(info("ns2", "sdk", "base", "0.0002"));
        let cfg = config();
        let oracle = StaticPriceTable::default();
        let candidates = vec![
            EndpointUrl::new(BASE, "ns", "broken").unwrap(),
            EndpointUrl::new(BASE, "ns2", "sdk").unwrap(),
        ];

        let out = CostFilter::new(&market, &oracle, &cfg)
            .filter(&candidates, 1.0)
            .await;

        assert_eq!(out.viable.len(), 1);
        assert_eq!(out.failures.len(), 1);
        assert!(out.failures[0].url.contains("ns/broken"));
    }

    #[tokio::test]
    async fn unknown_chain_is_priced_as_eth_and_rejected_over_budget() {
        // 5 doge at the eth price is $15,000; a $100 budget cannot cover it.
        let market = MockMarket::default().with_info(info("ns", "memecoin", "doge", "5"));
        let cfg = config();
        let oracle = StaticPriceTable::default();
        let candidates = vec![EndpointUrl::new(BASE, "ns", "memecoin").unwrap()];

        let out = CostFilter::new(&market, &oracle, &cfg)
            .filter(&candidates, 100.0)
            .await;

        assert!(out.viable.is_empty());
        assert!(out.failures.is_empty());
    }

    #[tokio::test]
    async fn viable_order_follows_discovery_order_not_cost() {
        let market = MockMarket::default()
            .with_info(info("ns", "pricey", "eth", "0.0003"))
            .with_info(info("ns", "cheap", "eth", "0.0001"));
        let cfg = config();
        let oracle = StaticPriceTable::default();
        let candidates = vec![
            EndpointUrl::new(BASE, "ns", "pricey").unwrap(),
            EndpointUrl::new(BASE, "ns", "cheap").unwrap(),
        ];

        let out = CostFilter::new(&market, &oracle, &cfg)
            .filter(&candidates, 5.0)
            .await;

        let names: Vec<&str> = out.viable.iter().map(|v| v.info.endpoint_name.as_str()).collect();
        assert_eq!(names, vec!["pricey", "cheap"]);
    }

    fn viable(market: &MockMarket, names: &[&str]) -> Vec<ViableEndpoint> {
        names
            .iter()
            .map(|name| {
                let url = EndpointUrl::new(BASE, "ns", name).unwrap();
                let info = market
                    .infos
                    .get(&url.to_string())
                    .cloned()
                    .unwrap_or_else(|| info("ns", name, "eth", "0.0001"));
                ViableEndpoint {
                    url,
                    cost_usd: 0.30,
                    info,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn settlement_attempts_partition_into_results_and_failures() {
        let market = MockMarket::default().with_failing_settle("ns", "b");
        let builder = RequestBuilder::new();
        let list = viable(&market, &["a", "b", "c"]);

        let out = SettlementEngine::new(&market, &builder)
            .settle(&list, 2)
            .await;

        assert_eq!(out.results.len() + out.failures.len(), 2);
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.failures.len(), 1);
        // Discovery order, one attempt each, third endpoint untouched.
        let settled = market.settled_urls.lock().unwrap();
        assert_eq!(
            settled.as_slice(),
            &[
                format!("{BASE}/api/endpoints/ns/a"),
                format!("{BASE}/api/endpoints/ns/b"),
            ]
        );
    }

    #[tokio::test]
    async fn top_k_larger_than_viable_settles_everything_once() {
        let market = MockMarket::default();
        let builder = RequestBuilder::new();
        let list = viable(&market, &["a"]);

        let out = SettlementEngine::new(&market, &builder).settle(&list, 5).await;

        assert_eq!(out.results.len(), 1);
        assert!(out.failures.is_empty());
        assert_eq!(market.settled_urls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn null_settlement_data_is_a_failure() {
        let market = MockMarket::default().with_null_settle("ns", "a");
        let builder = RequestBuilder::new();
        let list = viable(&market, &["a"]);

        let out = SettlementEngine::new(&market, &builder).settle(&list, 1).await;

        assert!(out.results.is_empty());
        assert_eq!(out.failures.len(), 1);
        assert!(out.failures[0].error.contains("no data"));
    }

    #[tokio::test]
    async fn post_settlement_sends_the_synthesized_body() {
        let mut post = info("ns", "chat", "base", "0.0001");
        post.http_method = "POST".to_string();
        post.query_schema = Some(QuerySchema {
            properties: serde_json::Map::new(),
            required: vec!["message".to_string()],
        });
        let market = MockMarket::default().with_info(post);
        let builder = RequestBuilder::new().now_epoch_s(7);
        let list = viable(&market, &["chat"]);

        let out = SettlementEngine::new(&market, &builder).settle(&list, 1).await;

        assert_eq!(out.results.len(), 1);
        assert_eq!(
            out.results[0].data["echo"]["message"],
            json!("Hello! Please provide a brief introduction.")
        );
    }

    #[tokio::test]
    async fn summary_totals_cover_the_full_viable_list_not_just_top_k() {
        let market = MockMarket::default()
            .with_search("t", &[("ns", "a"), ("ns", "b"), ("ns", "c")])
            .with_info(info("ns", "a", "eth", "0.0001"))
            .with_info(info("ns", "b", "eth", "0.0001"))
            .with_info(info("ns", "c", "eth", "0.0001"));
        let oracle = StaticPriceTable::default();
        let builder = RequestBuilder::new();
        let mut cfg = config();
        cfg.top_k = 1;
        cfg.budget_usd = 1.0;
        let gen = StaticTerms(vec!["t"]);

        let report = run_pipeline(&gen, &market, &oracle, &builder, &cfg, "q")
            .await
            .unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.summary.viable_count, 3);
        assert!((report.summary.total_cost_usd - 0.90).abs() < 1e-9);
        assert_eq!(report.summary.failure_count, 0);
    }

    #[tokio::test]
    async fn affordable_endpoint_survives_while_expensive_one_is_dropped() {
        // posts costs 0.001 eth ($3.00), sdk costs 0.0002 eth ($0.60).
        let market = MockMarket::default()
            .with_search("posts", &[("ns", "posts")])
            .with_search("ycombinator", &[])
            .with_search("sdk-example", &[("ns2", "sdk")])
            .with_info(info("ns", "posts", "eth", "0.001"))
            .with_info(info("ns2", "sdk", "eth", "0.0002"));
        let oracle = StaticPriceTable::default();
        let builder = RequestBuilder::new();
        let mut cfg = config();
        cfg.budget_usd = 1.0;
        let gen = StaticTerms(vec!["posts", "ycombinator", "sdk-example"]);

        let report = run_pipeline(&gen, &market, &oracle, &builder, &cfg, "q")
            .await
            .unwrap();

        assert_eq!(report.candidates.len(), 2);
        assert_eq!(report.viable.len(), 1);
        assert_eq!(report.viable[0].info.endpoint_name, "sdk");
        assert!((report.viable[0].cost_usd - 0.60).abs() < 1e-9);
        assert_eq!(report.results.len(), 1);
    }

    #[tokio::test]
    async fn generation_failure_is_fatal() {
        let market = MockMarket::default();
        let oracle = StaticPriceTable::default();
        let builder = RequestBuilder::new();
        let cfg = config();

        let err = run_pipeline(&ProseTerms, &market, &oracle, &builder, &cfg, "q")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Generation(_)));
        assert!(market.searched_terms.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_query_is_rejected_before_the_model_is_called() {
        let market = MockMarket::default();
        let oracle = StaticPriceTable::default();
        let builder = RequestBuilder::new();
        let cfg = config();

        let err = run_pipeline(&StaticTerms(vec!["t"]), &market, &oracle, &builder, &cfg, "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }

    #[tokio::test]
    async fn whitespace_only_terms_are_dropped_and_all_blank_is_fatal() {
        let market = MockMarket::default();
        let oracle = StaticPriceTable::default();
        let builder = RequestBuilder::new();
        let cfg = config();

        let err = run_pipeline(
            &StaticTerms(vec!["  ", "", "\t"]),
            &market,
            &oracle,
            &builder,
            &cfg,
            "q",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }
}
