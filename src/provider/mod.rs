pub mod http;

use thiserror::Error;

pub use http::{HttpGenerationProvider, HttpProviderConfig};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub size: Option<String>,
}

/// Failure kinds the provider client can establish from transport and status
/// information. Upstream carries free text the classifier matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    Timeout,
    ContentPolicy,
    RateLimited,
    Auth,
    Upstream,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Upstream,
            message: message.into(),
        }
    }
}

/// Seam to the external generation service. Implementations block; callers
/// run them on blocking worker threads.
pub trait GenerationProvider: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, ProviderError>;

    fn modify(
        &self,
        request: &GenerationRequest,
        input: &[u8],
        input_mime: &str,
    ) -> Result<Vec<u8>, ProviderError>;
}
