//! Reqwest-backed marketplace client.
//!
//! Metadata reads are free HTTP GETs against `{canonical}/info`. Paid calls
//! attach an `X-Payment` header whose value is a base64 JSON payload carrying
//! a nonce and an authorization digest derived from the caller's private key.
//! In fast mode the payload is attached preemptively; otherwise the client
//! sends once, expects `402 Payment Required` with a requirements body, and
//! retries exactly once with the header filled in from those requirements.
//!
//! Credentials are capability tokens: this module never parses them, never
//! logs them, and redacts them from Debug output.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use paypipe_core::{
    EndpointInfo, EndpointUrl, Error, Marketplace, Method, PaidResponse, PaymentReceipt,
    RequestOptions, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const PAYMENT_HEADER: &str = "x-payment";
const RECEIPT_HEADER: &str = "x-payment-response";

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn market_base_url_from_env() -> String {
    env("PAYPIPE_MARKET_BASE_URL").unwrap_or_else(|| "https://apinow.fun".to_string())
}

/// The marketplace's own (paid) search endpoint, as a canonical URL.
pub fn search_url_from_env() -> Result<EndpointUrl> {
    let namespace = env("PAYPIPE_SEARCH_NAMESPACE").unwrap_or_else(|| "apinowfun".to_string());
    let name = env("PAYPIPE_SEARCH_ENDPOINT").unwrap_or_else(|| "endpoint-search".to_string());
    EndpointUrl::new(&market_base_url_from_env(), &namespace, &name)
}

/// Opaque payment capability: a private key and the RPC endpoint used to
/// submit the payment transaction.
#[derive(Clone)]
pub struct Credentials {
    private_key: String,
    rpc_url: String,
}

impl Credentials {
    pub fn new(private_key: impl Into<String>, rpc_url: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            rpc_url: rpc_url.into(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let private_key = env("PAYPIPE_ETH_PRIVATE_KEY")
            .or_else(|| env("ETH_PRIVATE_KEY"))
            .ok_or_else(|| {
                Error::NotConfigured(
                    "missing PAYPIPE_ETH_PRIVATE_KEY (or ETH_PRIVATE_KEY)".to_string(),
                )
            })?;
        let rpc_url = env("PAYPIPE_ETH_RPC_URL")
            .or_else(|| env("ETH_RPC_URL"))
            .ok_or_else(|| {
                Error::NotConfigured("missing PAYPIPE_ETH_RPC_URL (or ETH_RPC_URL)".to_string())
            })?;
        Ok(Self {
            private_key,
            rpc_url,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // RPC URLs routinely embed provider API keys; redact both fields.
        f.debug_struct("Credentials")
            .field("private_key", &"<redacted>")
            .field("rpc_url", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentPayload<'a> {
    scheme: &'static str,
    nonce: String,
    payer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<&'a str>,
    rpc_url: &'a str,
    authorization: String,
}

/// Body of a `402 Payment Required` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequiredBody {
    #[serde(default)]
    chain: Option<String>,
    #[serde(default)]
    required_amount: Option<String>,
    #[serde(default)]
    nonce: Option<String>,
}

fn fresh_nonce() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos:x}")
}

/// Stable pseudo-address for the payer, derived from (not revealing) the key.
fn payer_id(private_key: &str) -> String {
    let digest = Sha256::digest(private_key.as_bytes());
    format!("0x{}", &hex::encode(digest)[..40])
}

fn authorization_digest(private_key: &str, nonce: &str, chain: &str, amount: &str) -> String {
    let mut h = Sha256::new();
    h.update(b"nonce:");
    h.update(nonce.as_bytes());
    h.update(b"\nchain:");
    h.update(chain.as_bytes());
    h.update(b"\namount:");
    h.update(amount.as_bytes());
    h.update(b"\nkey:");
    h.update(private_key.as_bytes());
    hex::encode(h.finalize())
}

fn decode_receipt(header: &reqwest::header::HeaderValue) -> Option<PaymentReceipt> {
    let raw = BASE64.decode(header.as_bytes()).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Free metadata read at `{canonical}/info`. Needs no credentials.
pub async fn fetch_info(
    client: &reqwest::Client,
    url: &EndpointUrl,
    timeout_ms: u64,
) -> Result<EndpointInfo> {
    let resp = client
        .get(format!("{url}/info"))
        .timeout(std::time::Duration::from_millis(timeout_ms.clamp(1_000, 60_000)))
        .send()
        .await
        .map_err(|e| Error::Metadata(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::Metadata(format!("info HTTP {status} for {url}")));
    }
    resp.json::<EndpointInfo>()
        .await
        .map_err(|e| Error::Metadata(format!("bad info body for {url}: {e}")))
}

#[derive(Debug, Clone)]
pub struct MarketplaceClient {
    client: reqwest::Client,
    credentials: Credentials,
    timeout_ms: u64,
}

impl MarketplaceClient {
    pub fn new(client: reqwest::Client, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
            timeout_ms: 20_000,
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        Ok(Self::new(client, Credentials::from_env()?))
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        // Paid calls can hang indefinitely without a cap.
        self.timeout_ms = timeout_ms.clamp(1_000, 60_000);
        self
    }

    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    fn payment_header_value(&self, requirements: Option<&PaymentRequiredBody>) -> Result<String> {
        let nonce = requirements
            .and_then(|r| r.nonce.clone())
            .unwrap_or_else(fresh_nonce);
        let chain = requirements.and_then(|r| r.chain.as_deref());
        let amount = requirements.and_then(|r| r.required_amount.as_deref());
        let payload = PaymentPayload {
            scheme: "exact",
            payer: payer_id(&self.credentials.private_key),
            authorization: authorization_digest(
                &self.credentials.private_key,
                &nonce,
                chain.unwrap_or(""),
                amount.unwrap_or(""),
            ),
            nonce,
            chain,
            amount,
            rpc_url: &self.credentials.rpc_url,
        };
        let raw = serde_json::to_vec(&payload)
            .map_err(|e| Error::Payment(format!("encode payment payload: {e}")))?;
        Ok(BASE64.encode(raw))
    }

    async fn send(
        &self,
        url: &EndpointUrl,
        options: &RequestOptions,
        payment: Option<String>,
    ) -> Result<reqwest::Response> {
        let mut rb = match options.method {
            Method::Get => self.client.get(url.to_string()),
            Method::Post => self.client.post(url.to_string()),
        };
        rb = rb.timeout(self.timeout());
        if let Some(body) = &options.body {
            rb = rb.json(body);
        }
        if let Some(payment) = payment {
            rb = rb.header(PAYMENT_HEADER, payment);
        }
        rb.send().await.map_err(|e| Error::Payment(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Marketplace for MarketplaceClient {
    async fn info(&self, url: &EndpointUrl) -> Result<EndpointInfo> {
        fetch_info(&self.client, url, self.timeout_ms).await
    }

    async fn pay_and_fetch(
        &self,
        url: &EndpointUrl,
        options: &RequestOptions,
    ) -> Result<PaidResponse> {
        let preemptive = if options.fast_mode {
            Some(self.payment_header_value(None)?)
        } else {
            None
        };
        let mut resp = self.send(url, options, preemptive).await?;

        if resp.status() == reqwest::StatusCode::PAYMENT_REQUIRED && !options.fast_mode {
            let requirements: PaymentRequiredBody = resp
                .json()
                .await
                .map_err(|e| Error::Payment(format!("bad 402 requirements body: {e}")))?;
            debug!(url = %url, "negotiated payment requirements, retrying with X-Payment");
            let payment = self.payment_header_value(Some(&requirements))?;
            resp = self.send(url, options, Some(payment)).await?;
        }

        let status = resp.status();
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            return Err(Error::Payment(format!("payment rejected for {url}")));
        }
        if !status.is_success() {
            return Err(Error::Settlement(format!("HTTP {status} for {url}")));
        }
        let receipt = resp.headers().get(RECEIPT_HEADER).and_then(decode_receipt);
        let data = resp
            .json::<Value>()
            .await
            .map_err(|e| Error::Settlement(format!("bad response body for {url}: {e}")))?;
        Ok(PaidResponse { data, receipt })
    }
}
