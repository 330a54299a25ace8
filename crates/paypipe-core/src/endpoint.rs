//! Endpoint identity and metadata types.
//!
//! [`EndpointUrl`] is the single source of truth for the canonical
//! `{base}/api/endpoints/{namespace}/{endpointName}` shape. Search-time
//! deduplication and settlement-time request construction both go through it,
//! so the two can never disagree on a byte.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Canonical identity of a marketplace endpoint.
///
/// Equality and hashing are structural over `(base, namespace, name)`, not
/// over a rendered string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EndpointUrl {
    base: String,
    namespace: String,
    name: String,
}

impl EndpointUrl {
    pub fn new(base: &str, namespace: &str, name: &str) -> Result<Self> {
        let base = base.trim().trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&base)
            .map_err(|e| Error::InvalidUrl(format!("bad marketplace base {base:?}: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::InvalidUrl(format!(
                "marketplace base must be http(s), got {base:?}"
            )));
        }
        let namespace = namespace.trim();
        let name = name.trim();
        if namespace.is_empty() || name.is_empty() {
            return Err(Error::InvalidUrl(
                "namespace and endpoint name must be non-empty".to_string(),
            ));
        }
        if namespace.contains('/') || name.contains('/') {
            return Err(Error::InvalidUrl(format!(
                "namespace/name must not contain '/': {namespace:?}/{name:?}"
            )));
        }
        Ok(Self {
            base,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Parses a canonical endpoint URL back into its parts.
    pub fn parse(s: &str) -> Result<Self> {
        let parsed = url::Url::parse(s.trim())
            .map_err(|e| Error::InvalidUrl(format!("{s:?}: {e}")))?;
        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|it| it.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        match segments.as_slice() {
            ["api", "endpoints", namespace, name] => {
                let mut base = parsed.clone();
                base.set_path("");
                base.set_query(None);
                base.set_fragment(None);
                Self::new(base.as_str(), namespace, name)
            }
            _ => Err(Error::InvalidUrl(format!(
                "{s:?} is not a canonical /api/endpoints/{{namespace}}/{{endpointName}} url"
            ))),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/api/endpoints/{}/{}",
            self.base, self.namespace, self.name
        )
    }
}

impl From<EndpointUrl> for String {
    fn from(u: EndpointUrl) -> Self {
        u.to_string()
    }
}

impl TryFrom<String> for EndpointUrl {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&s).map_err(|e| e.to_string())
    }
}

/// A `(namespace, endpointName)` pair as returned by the search endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRef {
    pub namespace: String,
    pub endpoint_name: String,
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// Endpoint metadata as reported by the marketplace; immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    pub namespace: String,
    pub endpoint_name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub chain: String,
    /// Decimal string in the chain's native unit, e.g. `"0.0002"`.
    pub required_amount: String,
    #[serde(default = "default_http_method")]
    pub http_method: String,
    #[serde(default)]
    pub query_schema: Option<QuerySchema>,
}

impl EndpointInfo {
    pub fn is_post(&self) -> bool {
        self.http_method.eq_ignore_ascii_case("POST")
    }
}

/// The subset of JSON Schema the marketplace declares for POST bodies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuerySchema {
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// One failed candidate, term, or settlement. Failures are accumulated,
/// never dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub url: String,
    pub error: String,
}

impl FailureRecord {
    pub fn new(url: impl ToString, error: impl ToString) -> Self {
        Self {
            url: url.to_string(),
            error: error.to_string(),
        }
    }
}
