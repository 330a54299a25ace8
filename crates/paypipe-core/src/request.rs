//! Schema-driven request construction for paid calls.
//!
//! The builder synthesizes a minimal valid body for POST endpoints from the
//! schema's `required` list. Known field names resolve through a strategy
//! table (field name -> generator), so new schemas can be supported by
//! registering rules instead of editing this module. The synthesis is a
//! stand-in for real argument inference and will not satisfy arbitrary
//! schemas.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};

use crate::endpoint::EndpointInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

/// What a single paid call should send.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOptions {
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Skip the 402 preflight and authorize payment on the first request.
    pub fast_mode: bool,
}

impl RequestOptions {
    pub fn get(fast_mode: bool) -> Self {
        Self {
            method: Method::Get,
            body: None,
            fast_mode,
        }
    }

    pub fn post(body: Value, fast_mode: bool) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            fast_mode,
        }
    }
}

/// Generator for one field's sample value. Receives the builder's epoch
/// seconds so time-derived values stay deterministic under test.
pub type FieldValueFn = Box<dyn Fn(u64) -> Value + Send + Sync>;

pub struct RequestBuilder {
    rules: BTreeMap<String, FieldValueFn>,
    fast_mode: bool,
    now_epoch_s: Option<u64>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        let mut b = Self {
            rules: BTreeMap::new(),
            fast_mode: true,
            now_epoch_s: None,
        };
        b = b.rule("message", |_| {
            json!("Hello! Please provide a brief introduction.")
        });
        b = b.rule("apiChatId", |now| json!(format!("test-{now}")));
        b
    }
}

impl std::fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .field("fast_mode", &self.fast_mode)
            .field("now_epoch_s", &self.now_epoch_s)
            .finish()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the generator for one field name.
    pub fn rule(
        mut self,
        field: impl Into<String>,
        f: impl Fn(u64) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.rules.insert(field.into(), Box::new(f));
        self
    }

    pub fn fast_mode(mut self, fast_mode: bool) -> Self {
        self.fast_mode = fast_mode;
        self
    }

    /// Override "now" for deterministic outputs.
    pub fn now_epoch_s(mut self, now: u64) -> Self {
        self.now_epoch_s = Some(now);
        self
    }

    fn now(&self) -> u64 {
        self.now_epoch_s.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })
    }

    /// Builds the request for one endpoint.
    ///
    /// Non-POST endpoints and POST endpoints without a schema get a GET with
    /// no body. Otherwise every name in `query_schema.required` gets exactly
    /// one value; properties not listed as required are never populated.
    pub fn build(&self, info: &EndpointInfo) -> RequestOptions {
        let Some(schema) = info.query_schema.as_ref().filter(|_| info.is_post()) else {
            return RequestOptions::get(self.fast_mode);
        };

        let now = self.now();
        let mut body = serde_json::Map::new();
        for field in &schema.required {
            let value = match self.rules.get(field) {
                Some(f) => f(now),
                None => json!(format!("sample-{field}")),
            };
            body.insert(field.clone(), value);
        }
        RequestOptions::post(Value::Object(body), self.fast_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::QuerySchema;

    fn post_info(required: &[&str]) -> EndpointInfo {
        let mut properties = serde_json::Map::new();
        for f in required {
            properties.insert((*f).to_string(), json!({ "type": "string" }));
        }
        properties.insert("optionalNote".to_string(), json!({ "type": "string" }));
        EndpointInfo {
            namespace: "ns".to_string(),
            endpoint_name: "chat".to_string(),
            url: None,
            description: None,
            chain: "base".to_string(),
            required_amount: "0.0001".to_string(),
            http_method: "POST".to_string(),
            query_schema: Some(QuerySchema {
                properties,
                required: required.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }

    #[test]
    fn get_endpoint_gets_no_body() {
        let mut info = post_info(&["message"]);
        info.http_method = "GET".to_string();
        let opts = RequestBuilder::new().build(&info);
        assert_eq!(opts.method, Method::Get);
        assert!(opts.body.is_none());
    }

    #[test]
    fn post_without_schema_degrades_to_get() {
        let mut info = post_info(&[]);
        info.query_schema = None;
        let opts = RequestBuilder::new().build(&info);
        assert_eq!(opts.method, Method::Get);
        assert!(opts.body.is_none());
    }

    #[test]
    fn required_fields_get_exactly_one_value_each() {
        let info = post_info(&["message", "apiChatId", "topic"]);
        let opts = RequestBuilder::new().now_epoch_s(1_700_000_000).build(&info);
        assert_eq!(opts.method, Method::Post);
        let body = opts.body.unwrap();
        let obj = body.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(
            obj["message"],
            json!("Hello! Please provide a brief introduction.")
        );
        assert_eq!(obj["apiChatId"], json!("test-1700000000"));
        assert_eq!(obj["topic"], json!("sample-topic"));
    }

    #[test]
    fn optional_properties_are_never_populated() {
        let info = post_info(&["message"]);
        let opts = RequestBuilder::new().build(&info);
        let body = opts.body.unwrap();
        let obj = body.as_object().unwrap();
        assert_eq!(obj.keys().collect::<Vec<_>>(), vec!["message"]);
    }

    #[test]
    fn custom_rules_override_the_defaults() {
        let info = post_info(&["message", "userId"]);
        let opts = RequestBuilder::new()
            .rule("message", |_| json!("ping"))
            .rule("userId", |now| json!(format!("u{now}")))
            .now_epoch_s(42)
            .build(&info);
        let body = opts.body.unwrap();
        assert_eq!(body["message"], json!("ping"));
        assert_eq!(body["userId"], json!("u42"));
    }

    #[test]
    fn fast_mode_flag_carries_through() {
        let mut info = post_info(&[]);
        info.query_schema = None;
        let opts = RequestBuilder::new().fast_mode(false).build(&info);
        assert!(!opts.fast_mode);
    }
}
