//! OpenAI-compatible chat-completions client.
//!
//! Used twice per run: once to turn the developer query into search terms
//! (JSON mode, fatal on a malformed response) and optionally once more to
//! produce a short narrative over the settled results (best-effort).

use paypipe_core::{Error, Result, SettlementResult, TermGenerator};
use serde::{Deserialize, Serialize};

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn base_url_from_env() -> Option<String> {
    env("PAYPIPE_OPENAI_COMPAT_BASE_URL")
}

fn api_key_from_env() -> Option<String> {
    env("PAYPIPE_OPENAI_COMPAT_API_KEY")
}

fn model_from_env() -> Option<String> {
    env("PAYPIPE_OPENAI_COMPAT_MODEL")
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
        }
    }

    pub fn from_env(client: reqwest::Client, model_override: Option<String>) -> Result<Self> {
        let base_url = base_url_from_env().ok_or_else(|| {
            Error::NotConfigured("missing PAYPIPE_OPENAI_COMPAT_BASE_URL".to_string())
        })?;
        let api_key = api_key_from_env();
        let model = model_override.or_else(model_from_env).ok_or_else(|| {
            Error::NotConfigured(
                "missing model (set --model or PAYPIPE_OPENAI_COMPAT_MODEL)".to_string(),
            )
        })?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn send_chat(
        &self,
        system: &str,
        user: &str,
        timeout_ms: u64,
        json_object: bool,
    ) -> Result<String> {
        let req = ChatCompletionsRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            response_format: json_object.then(|| ResponseFormat {
                kind: "json_object".to_string(),
            }),
            stream: Some(false),
        };

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("chat.completions HTTP {status}")));
        }

        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        Ok(parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    /// Plain chat round; returns the first choice's content.
    pub async fn chat(&self, system: &str, user: &str, timeout_ms: u64) -> Result<String> {
        self.send_chat(system, user, timeout_ms, false).await
    }

    /// Chat round constrained to a JSON-object response.
    pub async fn chat_json(&self, system: &str, user: &str, timeout_ms: u64) -> Result<String> {
        self.send_chat(system, user, timeout_ms, true).await
    }
}

const TERMS_SYSTEM_PROMPT: &str = "You are a technical API search expert. Generate exactly 3 \
specific search terms and return them as a JSON object with a \"terms\" array. For example: \
{\"terms\": [\"term1\", \"term2\", \"term3\"]}";

const ANALYST_SYSTEM_PROMPT: &str = "You are a technical API analyst. Provide concise, technical \
summaries focusing on data structure and utility.";

#[derive(Debug, Deserialize)]
struct TermsBody {
    terms: Vec<String>,
}

fn parse_terms(content: &str) -> Result<Vec<String>> {
    let parsed: TermsBody = serde_json::from_str(content).map_err(|e| {
        Error::Generation(format!(
            "model response is not a {{\"terms\": [...]}} object: {e}"
        ))
    })?;
    Ok(parsed.terms)
}

/// Generates search terms by asking the model for a JSON `terms` array.
/// Any transport or shape problem is a [`Error::Generation`]: there are no
/// fallback terms.
#[derive(Debug, Clone)]
pub struct LlmTermGenerator {
    client: OpenAiCompatClient,
    timeout_ms: u64,
}

impl LlmTermGenerator {
    pub fn new(client: OpenAiCompatClient) -> Self {
        Self {
            client,
            timeout_ms: 30_000,
        }
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms.clamp(1_000, 120_000);
        self
    }
}

#[async_trait::async_trait]
impl TermGenerator for LlmTermGenerator {
    async fn generate_terms(&self, query: &str) -> Result<Vec<String>> {
        let content = self
            .client
            .chat_json(TERMS_SYSTEM_PROMPT, query, self.timeout_ms)
            .await
            .map_err(|e| Error::Generation(e.to_string()))?;
        parse_terms(&content)
    }
}

/// Second LLM round: a short narrative over the settled results. Failures
/// here never fail the run; callers treat this as best-effort.
pub async fn summarize_results(
    client: &OpenAiCompatClient,
    results: &[SettlementResult],
    timeout_ms: u64,
) -> Result<String> {
    let mut sections = Vec::with_capacity(results.len());
    for r in results {
        sections.push(format!(
            "Endpoint: {}\nDescription: {}\nData: {}",
            r.endpoint.info.endpoint_name,
            r.endpoint.info.description.as_deref().unwrap_or("(none)"),
            serde_json::to_string_pretty(&r.data).unwrap_or_else(|_| "(unprintable)".to_string()),
        ));
    }
    let user = format!(
        "Analyze these API endpoints and their data:\n{}\n\nProvide a brief technical summary of \
         the endpoints and their data.",
        sections.join("\n\n")
    );
    client.chat(ANALYST_SYSTEM_PROMPT, &user, timeout_ms).await
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: String,
}
