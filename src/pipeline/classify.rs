use std::any::Any;

use serde::Serialize;
use thiserror::Error;

use crate::provider::{ProviderError, ProviderErrorKind};

/// Stable, user-facing failure taxonomy. Classification only names the
/// reason; every classified failure is refunded identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    Timeout,
    ContentPolicy,
    RateLimited,
    AuthError,
    InvalidImage,
    GenerationError,
    Unknown,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::ContentPolicy => "CONTENT_POLICY",
            Self::RateLimited => "RATE_LIMITED",
            Self::AuthError => "AUTH_ERROR",
            Self::InvalidImage => "INVALID_IMAGE",
            Self::GenerationError => "GENERATION_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFailure {
    pub code: FailureCode,
    pub message: String,
}

/// A failed executor step, carried to the classifier with its origin intact.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    Input(String),

    #[error("{0}")]
    Metadata(String),

    #[error("{0}")]
    Upload(String),
}

pub fn classify(error: &ExecutionError) -> ClassifiedFailure {
    match error {
        ExecutionError::Provider(provider) => classify_provider(provider),
        ExecutionError::Input(message)
        | ExecutionError::Metadata(message)
        | ExecutionError::Upload(message) => classify_text(message),
    }
}

/// Structured kinds from the provider client map directly; only free-text
/// upstream failures fall through to the substring taxonomy.
fn classify_provider(error: &ProviderError) -> ClassifiedFailure {
    let code = match error.kind {
        ProviderErrorKind::Timeout => FailureCode::Timeout,
        ProviderErrorKind::ContentPolicy => FailureCode::ContentPolicy,
        ProviderErrorKind::RateLimited => FailureCode::RateLimited,
        ProviderErrorKind::Auth => FailureCode::AuthError,
        ProviderErrorKind::Upstream => return classify_text(error.message.as_str()),
    };
    ClassifiedFailure {
        code,
        message: error.message.clone(),
    }
}

/// Ordered substring taxonomy; more specific categories before generic ones.
/// Unmatched messages pass through verbatim as GENERATION_ERROR.
pub fn classify_text(message: &str) -> ClassifiedFailure {
    let lower = message.to_lowercase();

    let code = if lower.contains("timeout") || lower.contains("timed out") {
        FailureCode::Timeout
    } else if lower.contains("content") && (lower.contains("policy") || lower.contains("blocked")) {
        FailureCode::ContentPolicy
    } else if lower.contains("rate") || lower.contains("quota") || lower.contains("429") {
        FailureCode::RateLimited
    } else if lower.contains("api key") || lower.contains("unauthorized") || lower.contains("401") {
        FailureCode::AuthError
    } else if lower.contains("image") && (lower.contains("invalid") || lower.contains("corrupt")) {
        FailureCode::InvalidImage
    } else {
        FailureCode::GenerationError
    };

    ClassifiedFailure {
        code,
        message: String::from(message),
    }
}

/// Panic payloads with a string message are classified like any other text;
/// anything else carries no usable structure and reports UNKNOWN.
pub fn classify_panic(payload: &(dyn Any + Send)) -> ClassifiedFailure {
    if let Some(message) = payload.downcast_ref::<String>() {
        return classify_text(message.as_str());
    }
    if let Some(message) = payload.downcast_ref::<&str>() {
        return classify_text(message);
    }
    ClassifiedFailure {
        code: FailureCode::Unknown,
        message: String::from("unstructured failure during job execution"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_text_is_classified() {
        let failure = classify_text("Request timed out");
        assert_eq!(failure.code, FailureCode::Timeout);
        assert_eq!(failure.message, "Request timed out");
    }

    #[test]
    fn rate_limit_text_is_classified() {
        assert_eq!(
            classify_text("429 Too Many Requests").code,
            FailureCode::RateLimited
        );
        assert_eq!(
            classify_text("monthly quota exceeded").code,
            FailureCode::RateLimited
        );
    }

    #[test]
    fn content_policy_requires_both_terms() {
        assert_eq!(
            classify_text("content policy: blocked").code,
            FailureCode::ContentPolicy
        );
        assert_eq!(
            classify_text("policy violation").code,
            FailureCode::GenerationError
        );
    }

    #[test]
    fn auth_and_invalid_image_texts_are_classified() {
        assert_eq!(
            classify_text("401 Unauthorized").code,
            FailureCode::AuthError
        );
        assert_eq!(
            classify_text("missing api key").code,
            FailureCode::AuthError
        );
        assert_eq!(
            classify_text("invalid image data: corrupt header").code,
            FailureCode::InvalidImage
        );
    }

    #[test]
    fn more_specific_categories_win_over_generic_ones() {
        // "timed out" beats the rate-limit match that "429" would produce.
        assert_eq!(
            classify_text("429 gateway timed out").code,
            FailureCode::Timeout
        );
    }

    #[test]
    fn unmatched_text_passes_through_verbatim() {
        let failure = classify_text("provider exploded mysteriously");
        assert_eq!(failure.code, FailureCode::GenerationError);
        assert_eq!(failure.message, "provider exploded mysteriously");
    }

    #[test]
    fn structured_provider_kinds_bypass_substring_matching() {
        let error = ExecutionError::Provider(ProviderError {
            kind: ProviderErrorKind::ContentPolicy,
            message: String::from("request rejected"),
        });
        assert_eq!(classify(&error).code, FailureCode::ContentPolicy);

        let upstream = ExecutionError::Provider(ProviderError {
            kind: ProviderErrorKind::Upstream,
            message: String::from("upstream timeout"),
        });
        assert_eq!(classify(&upstream).code, FailureCode::Timeout);
    }

    #[test]
    fn non_string_panic_payload_is_unknown() {
        let payload: Box<dyn Any + Send> = Box::new(42_u32);
        let failure = classify_panic(payload.as_ref());
        assert_eq!(failure.code, FailureCode::Unknown);

        let text: Box<dyn Any + Send> = Box::new(String::from("worker timed out"));
        assert_eq!(classify_panic(text.as_ref()).code, FailureCode::Timeout);
    }
}
