//! Stable JSON envelope pieces shared by every subcommand.

use serde::Serialize;

#[derive(Clone, Copy, Debug)]
pub(crate) enum ErrorCode {
    InvalidParams,
    InvalidUrl,
    NotConfigured,
    GenerationFailed,
    MarketError,
    LlmError,
    UnexpectedError,
}

impl ErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "invalid_params",
            Self::InvalidUrl => "invalid_url",
            Self::NotConfigured => "not_configured",
            Self::GenerationFailed => "generation_failed",
            Self::MarketError => "market_error",
            Self::LlmError => "llm_error",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub(crate) fn retryable(self) -> bool {
        match self {
            Self::MarketError | Self::LlmError => true,
            // Configuration + invalid input are not retryable without changing something.
            Self::InvalidParams
            | Self::InvalidUrl
            | Self::NotConfigured
            | Self::GenerationFailed
            | Self::UnexpectedError => false,
        }
    }
}

pub(crate) fn code_for(err: &paypipe_core::Error) -> ErrorCode {
    use paypipe_core::Error;
    match err {
        Error::InvalidUrl(_) => ErrorCode::InvalidUrl,
        Error::Generation(_) => ErrorCode::GenerationFailed,
        Error::Llm(_) => ErrorCode::LlmError,
        Error::NotConfigured(_) => ErrorCode::NotConfigured,
        Error::Search(_) | Error::Metadata(_) | Error::Payment(_) | Error::Settlement(_) => {
            ErrorCode::MarketError
        }
    }
}

pub(crate) fn error_obj(
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: String,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: hint.to_string(),
        retryable: code.retryable(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": hint.to_string(),
            "retryable": code.retryable()
        }),
    }
}

pub(crate) fn error_envelope(
    kind: &str,
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
) -> serde_json::Value {
    serde_json::json!({
        "schema_version": 1,
        "kind": kind,
        "ok": false,
        "error": error_obj(code, message, hint),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn error_obj_has_stable_shape(msg in any::<String>(), hint in any::<String>()) {
            let v = error_obj(ErrorCode::MarketError, &msg, &hint);
            prop_assert_eq!(v["code"].as_str(), Some("market_error"));
            prop_assert_eq!(v["message"].as_str(), Some(msg.as_str()));
            prop_assert_eq!(v["hint"].as_str(), Some(hint.as_str()));
            prop_assert_eq!(v["retryable"].as_bool(), Some(true));
        }
    }

    #[test]
    fn generation_failures_are_not_retryable() {
        let err = paypipe_core::Error::Generation("prose".to_string());
        let code = code_for(&err);
        assert_eq!(code.as_str(), "generation_failed");
        assert!(!code.retryable());
    }

    #[test]
    fn market_failures_are_retryable() {
        let err = paypipe_core::Error::Settlement("HTTP 502".to_string());
        assert!(code_for(&err).retryable());
    }
}
