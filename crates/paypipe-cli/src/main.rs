use std::process::ExitCode;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::warn;

use paypipe_core::{
    run_pipeline, EndpointUrl, PipelineConfig, RequestBuilder, StaticPriceTable,
};
use paypipe_local::{
    fetch_info, search_url_from_env, summarize_results, LlmTermGenerator, MarketplaceClient,
    OpenAiCompatClient,
};

mod envelope;
use envelope::{code_for, error_envelope, ErrorCode};

#[derive(Parser, Debug)]
#[command(name = "paypipe")]
#[command(about = "Discover, cost-filter, and settle pay-per-call marketplace endpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full discovery -> filter -> settle pipeline for a query (json).
    Run(RunCmd),
    /// Fetch one endpoint's metadata and its USD cost (json; free, no payment).
    Info(InfoCmd),
    /// Pay for a single endpoint and print the returned data (json).
    Buy(BuyCmd),
    /// Diagnose configuration issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct RunCmd {
    /// Free-text developer query to find endpoints for.
    #[arg(long)]
    query: String,
    /// Maximum USD cost per endpoint; the budget the run filters against.
    #[arg(long, default_value_t = 0.30)]
    budget_usd: f64,
    /// How many viable endpoints to settle, in discovery order.
    #[arg(long, default_value_t = 2)]
    top_k: usize,
    /// Bound for the search/metadata fan-out stages.
    #[arg(long, default_value_t = 4)]
    max_parallel: usize,
    /// Authorize payment on the first request instead of negotiating a 402.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    fast_mode: bool,
    /// Ask the model for a short narrative over the settled results.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    analyze: bool,
    /// Model override for the term generator (else PAYPIPE_OPENAI_COMPAT_MODEL).
    #[arg(long)]
    model: Option<String>,
    /// Per-call timeout (ms).
    #[arg(long, default_value_t = 20_000)]
    timeout_ms: u64,
    /// Override "now" for deterministic outputs.
    #[arg(long)]
    now_epoch_s: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct InfoCmd {
    /// Canonical endpoint URL ({base}/api/endpoints/{namespace}/{endpointName}).
    #[arg(long)]
    url: String,
    #[arg(long, default_value_t = 20_000)]
    timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct BuyCmd {
    /// Canonical endpoint URL ({base}/api/endpoints/{namespace}/{endpointName}).
    #[arg(long)]
    url: String,
    /// Authorize payment on the first request instead of negotiating a 402.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    fast_mode: bool,
    #[arg(long, default_value_t = 20_000)]
    timeout_ms: u64,
    /// Override "now" for deterministic outputs.
    #[arg(long)]
    now_epoch_s: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn price_table_from_env() -> paypipe_core::Result<StaticPriceTable> {
    match std::env::var("PAYPIPE_PRICE_TABLE") {
        Ok(spec) if !spec.trim().is_empty() => StaticPriceTable::from_spec(&spec),
        _ => Ok(StaticPriceTable::default()),
    }
}

fn emit(payload: &Value) -> Result<ExitCode> {
    println!("{}", serde_json::to_string(payload)?);
    let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_cmd(args: RunCmd) -> Result<ExitCode> {
    const KIND: &str = "pipeline_run";
    let t0 = Instant::now();

    if args.query.trim().is_empty() {
        return emit(&error_envelope(
            KIND,
            ErrorCode::InvalidParams,
            "query must be non-empty",
            "Pass a non-empty --query string.",
        ));
    }
    let oracle = match price_table_from_env() {
        Ok(oracle) => oracle,
        Err(e) => {
            return emit(&error_envelope(
                KIND,
                ErrorCode::NotConfigured,
                e.to_string(),
                "Fix PAYPIPE_PRICE_TABLE (comma-separated chain=usd pairs).",
            ))
        }
    };

    let http = reqwest::Client::new();
    let market = match MarketplaceClient::from_env(http.clone()) {
        Ok(market) => market.timeout_ms(args.timeout_ms),
        Err(e) => {
            return emit(&error_envelope(
                KIND,
                ErrorCode::NotConfigured,
                e.to_string(),
                "Set PAYPIPE_ETH_PRIVATE_KEY and PAYPIPE_ETH_RPC_URL.",
            ))
        }
    };
    let search_url = match search_url_from_env() {
        Ok(url) => url,
        Err(e) => {
            return emit(&error_envelope(
                KIND,
                ErrorCode::NotConfigured,
                e.to_string(),
                "Fix PAYPIPE_MARKET_BASE_URL / PAYPIPE_SEARCH_NAMESPACE / PAYPIPE_SEARCH_ENDPOINT.",
            ))
        }
    };
    let llm = match OpenAiCompatClient::from_env(http, args.model.clone()) {
        Ok(llm) => llm,
        Err(e) => {
            return emit(&error_envelope(
                KIND,
                ErrorCode::NotConfigured,
                e.to_string(),
                "Set PAYPIPE_OPENAI_COMPAT_BASE_URL and PAYPIPE_OPENAI_COMPAT_MODEL.",
            ))
        }
    };
    let generator = LlmTermGenerator::new(llm.clone()).timeout_ms(args.timeout_ms);

    let mut builder = RequestBuilder::new().fast_mode(args.fast_mode);
    if let Some(now) = args.now_epoch_s {
        builder = builder.now_epoch_s(now);
    }
    let config = PipelineConfig {
        search_url,
        budget_usd: args.budget_usd,
        top_k: args.top_k,
        max_parallel: args.max_parallel,
        fast_mode: args.fast_mode,
    };

    let report = match run_pipeline(&generator, &market, &oracle, &builder, &config, &args.query)
        .await
    {
        Ok(report) => report,
        Err(e) => {
            return emit(&error_envelope(
                KIND,
                code_for(&e),
                e.to_string(),
                "Term generation is fatal; check the model configuration and retry.",
            ))
        }
    };

    let analysis = if args.analyze && !report.results.is_empty() {
        match summarize_results(&llm, &report.results, args.timeout_ms).await {
            Ok(text) => json!(text),
            Err(e) => {
                // Best-effort: a failed narrative never fails the run.
                warn!(error = %e, "result analysis failed");
                Value::Null
            }
        }
    } else {
        Value::Null
    };

    emit(&json!({
        "schema_version": 1,
        "kind": KIND,
        "ok": true,
        "query": report.query,
        "terms": report.terms,
        "candidates": report.candidates,
        "viable": report.viable,
        "results": report.results,
        "failures": report.failures,
        "summary": report.summary,
        "analysis": analysis,
        "elapsed_ms": t0.elapsed().as_millis() as u64,
    }))
}

async fn info_cmd(args: InfoCmd) -> Result<ExitCode> {
    const KIND: &str = "endpoint_info";
    let url = match EndpointUrl::parse(&args.url) {
        Ok(url) => url,
        Err(e) => {
            return emit(&error_envelope(
                KIND,
                ErrorCode::InvalidUrl,
                e.to_string(),
                "Pass a canonical {base}/api/endpoints/{namespace}/{endpointName} url.",
            ))
        }
    };
    let oracle = match price_table_from_env() {
        Ok(oracle) => oracle,
        Err(e) => {
            return emit(&error_envelope(
                KIND,
                ErrorCode::NotConfigured,
                e.to_string(),
                "Fix PAYPIPE_PRICE_TABLE (comma-separated chain=usd pairs).",
            ))
        }
    };

    let http = reqwest::Client::new();
    match fetch_info(&http, &url, args.timeout_ms).await {
        Ok(info) => {
            let cost_usd =
                paypipe_core::crypto_to_usd(&info.required_amount, &info.chain, &oracle).ok();
            emit(&json!({
                "schema_version": 1,
                "kind": KIND,
                "ok": true,
                "url": url,
                "info": info,
                "costUsd": cost_usd,
            }))
        }
        Err(e) => emit(&error_envelope(
            KIND,
            code_for(&e),
            e.to_string(),
            "Check the endpoint url and marketplace availability.",
        )),
    }
}

async fn buy_cmd(args: BuyCmd) -> Result<ExitCode> {
    const KIND: &str = "endpoint_buy";
    let url = match EndpointUrl::parse(&args.url) {
        Ok(url) => url,
        Err(e) => {
            return emit(&error_envelope(
                KIND,
                ErrorCode::InvalidUrl,
                e.to_string(),
                "Pass a canonical {base}/api/endpoints/{namespace}/{endpointName} url.",
            ))
        }
    };

    let http = reqwest::Client::new();
    let market = match MarketplaceClient::from_env(http.clone()) {
        Ok(market) => market.timeout_ms(args.timeout_ms),
        Err(e) => {
            return emit(&error_envelope(
                KIND,
                ErrorCode::NotConfigured,
                e.to_string(),
                "Set PAYPIPE_ETH_PRIVATE_KEY and PAYPIPE_ETH_RPC_URL.",
            ))
        }
    };

    // Metadata first: the method and schema decide what the paid call sends.
    let info = match fetch_info(&http, &url, args.timeout_ms).await {
        Ok(info) => info,
        Err(e) => {
            return emit(&error_envelope(
                KIND,
                code_for(&e),
                e.to_string(),
                "Check the endpoint url and marketplace availability.",
            ))
        }
    };
    let mut builder = RequestBuilder::new().fast_mode(args.fast_mode);
    if let Some(now) = args.now_epoch_s {
        builder = builder.now_epoch_s(now);
    }
    let options = builder.build(&info);

    use paypipe_core::Marketplace as _;
    match market.pay_and_fetch(&url, &options).await {
        Ok(resp) => emit(&json!({
            "schema_version": 1,
            "kind": KIND,
            "ok": true,
            "url": url,
            "request": options,
            "data": resp.data,
            "receipt": resp.receipt,
        })),
        Err(e) => emit(&error_envelope(
            KIND,
            code_for(&e),
            e.to_string(),
            "The paid call failed; nothing was returned. Check credentials and funding.",
        )),
    }
}

fn doctor_cmd(args: DoctorCmd) -> Result<ExitCode> {
    fn has_env(k: &str) -> bool {
        std::env::var(k).ok().is_some_and(|v| !v.trim().is_empty())
    }

    // Env presence (booleans only; never print values).
    let credentials_configured = (has_env("PAYPIPE_ETH_PRIVATE_KEY") || has_env("ETH_PRIVATE_KEY"))
        && (has_env("PAYPIPE_ETH_RPC_URL") || has_env("ETH_RPC_URL"));
    let llm_configured =
        has_env("PAYPIPE_OPENAI_COMPAT_BASE_URL") && has_env("PAYPIPE_OPENAI_COMPAT_MODEL");
    let search_url = search_url_from_env();
    let price_table = price_table_from_env();

    let checks = vec![
        json!({
            "name": "credentials_configured",
            "ok": credentials_configured,
            "message": if credentials_configured { "payment credentials are set" } else { "payment credentials are missing" },
            "hint": if credentials_configured { "" } else { "Set PAYPIPE_ETH_PRIVATE_KEY and PAYPIPE_ETH_RPC_URL (or the bare ETH_* variants)." },
        }),
        json!({
            "name": "llm_configured",
            "ok": llm_configured,
            "message": if llm_configured { "term-generation model is set" } else { "term-generation model is missing" },
            "hint": if llm_configured { "" } else { "Set PAYPIPE_OPENAI_COMPAT_BASE_URL and PAYPIPE_OPENAI_COMPAT_MODEL." },
        }),
        json!({
            "name": "search_url_valid",
            "ok": search_url.is_ok(),
            "message": match &search_url {
                Ok(url) => format!("search endpoint is {url}"),
                Err(e) => e.to_string(),
            },
            "hint": if search_url.is_ok() { "".to_string() } else { "Fix PAYPIPE_MARKET_BASE_URL / PAYPIPE_SEARCH_NAMESPACE / PAYPIPE_SEARCH_ENDPOINT.".to_string() },
        }),
        json!({
            "name": "price_table_parses",
            "ok": price_table.is_ok(),
            "message": match &price_table {
                Ok(_) => "price table parses".to_string(),
                Err(e) => e.to_string(),
            },
            "hint": if price_table.is_ok() { "" } else { "Fix PAYPIPE_PRICE_TABLE (comma-separated chain=usd pairs)." },
        }),
    ];
    let ok = checks
        .iter()
        .all(|c| c["ok"].as_bool().unwrap_or(false));

    let payload = json!({
        "schema_version": 1,
        "kind": "doctor",
        "ok": ok,
        "checks": checks,
    });
    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            for c in payload["checks"].as_array().unwrap_or(&Vec::new()) {
                let mark = if c["ok"].as_bool().unwrap_or(false) {
                    "ok"
                } else {
                    "FAIL"
                };
                println!("{:4} {} - {}", mark, c["name"], c["message"]);
            }
        }
        _ => println!("{}", serde_json::to_string(&payload)?),
    }
    // Doctor is a diagnostic report, not a failing command.
    Ok(ExitCode::SUCCESS)
}

fn version_cmd(args: VersionCmd) -> Result<ExitCode> {
    let v = json!({
        "schema_version": 1,
        "kind": "version",
        "ok": true,
        "name": "paypipe",
        "version": env!("CARGO_PKG_VERSION"),
    });
    match args.output.to_ascii_lowercase().as_str() {
        "text" => println!("paypipe {}", env!("CARGO_PKG_VERSION")),
        _ => println!("{v}"),
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Stdout carries exactly one JSON envelope; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_cmd(args).await,
        Commands::Info(args) => info_cmd(args).await,
        Commands::Buy(args) => buy_cmd(args).await,
        Commands::Doctor(args) => doctor_cmd(args),
        Commands::Version(args) => version_cmd(args),
    }
}
