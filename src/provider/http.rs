use std::time::Duration;

use base64::Engine;
use serde_json::json;

use super::{GenerationProvider, GenerationRequest, ProviderError, ProviderErrorKind};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl HttpProviderConfig {
    pub fn from_env() -> Self {
        let base_url = std::env::var("ATELIER_PROVIDER_BASE_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| String::from("http://127.0.0.1:9797"));
        let api_key = std::env::var("ATELIER_PROVIDER_API_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let timeout = parse_timeout_secs(std::env::var("ATELIER_PROVIDER_TIMEOUT_SECS").ok());
        Self {
            base_url,
            api_key,
            timeout,
        }
    }
}

fn parse_timeout_secs(raw: Option<String>) -> Duration {
    raw.as_deref()
        .map(str::trim)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
}

/// Blocking client for a JSON image-generation endpoint. Clients are built
/// per call because callers run on blocking worker threads, not the async
/// runtime.
#[derive(Debug, Clone)]
pub struct HttpGenerationProvider {
    config: HttpProviderConfig,
}

impl HttpGenerationProvider {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(HttpProviderConfig::from_env())
    }

    fn post_for_image(&self, path: &str, body: serde_json::Value) -> Result<Vec<u8>, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.config.timeout)
            .build()
            .map_err(|e| ProviderError::upstream(format!("provider client setup failed: {e}")))?;

        let mut request = client
            .post(format!("{}{}", self.config.base_url, path))
            .json(&body);
        if let Some(api_key) = self.config.api_key.as_deref() {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().map_err(map_transport_error)?;
        let status = response.status().as_u16();
        if status >= 400 {
            let body_text = response.text().unwrap_or_default();
            return Err(map_status_error(status, body_text.as_str()));
        }

        let bytes = response
            .bytes()
            .map_err(|e| ProviderError::upstream(format!("provider response unreadable: {e}")))?;
        if bytes.is_empty() {
            return Err(ProviderError::upstream("provider returned an empty body"));
        }
        Ok(bytes.to_vec())
    }
}

impl GenerationProvider for HttpGenerationProvider {
    fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, ProviderError> {
        self.post_for_image(
            "/v1/images/generate",
            json!({
                "prompt": request.prompt,
                "size": request.size,
            }),
        )
    }

    fn modify(
        &self,
        request: &GenerationRequest,
        input: &[u8],
        input_mime: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(input);
        self.post_for_image(
            "/v1/images/modify",
            json!({
                "prompt": request.prompt,
                "size": request.size,
                "input_b64": encoded,
                "input_mime": input_mime,
            }),
        )
    }
}

fn map_transport_error(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        return ProviderError {
            kind: ProviderErrorKind::Timeout,
            message: format!("provider request timed out: {error}"),
        };
    }
    ProviderError::upstream(format!("provider request failed: {error}"))
}

fn map_status_error(status: u16, body: &str) -> ProviderError {
    let summary = first_non_empty_line(body);
    match status {
        401 | 403 => ProviderError {
            kind: ProviderErrorKind::Auth,
            message: format!("provider rejected credentials ({status}): {summary}"),
        },
        408 | 504 => ProviderError {
            kind: ProviderErrorKind::Timeout,
            message: format!("provider timed out ({status}): {summary}"),
        },
        429 => ProviderError {
            kind: ProviderErrorKind::RateLimited,
            message: format!("provider rate limited (429): {summary}"),
        },
        400 | 422 if mentions_content_policy(body) => ProviderError {
            kind: ProviderErrorKind::ContentPolicy,
            message: format!("provider blocked the request ({status}): {summary}"),
        },
        _ => ProviderError::upstream(format!("provider error ({status}): {summary}")),
    }
}

fn mentions_content_policy(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("content") && (lower.contains("policy") || lower.contains("blocked"))
}

fn first_non_empty_line(body: &str) -> &str {
    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no detail")
}
