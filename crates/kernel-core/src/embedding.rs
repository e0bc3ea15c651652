use crate::error::KernelError;

/// Pluggable embedding backend for `semantic_search`, in the shape of the
/// reference stack's `SettlementConnector`: a small synchronous trait object the
/// engine calls out to rather than owning the implementation itself. The real
/// embedding model call is out of scope for this kernel.
pub trait EmbeddingClient: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f64>, KernelError>;
}

/// Default client wired in when nothing else is configured. Always fails, so
/// `semantic_search` fails fast with `UpstreamUnavailable` rather than silently
/// returning no results.
pub struct UnavailableEmbeddingClient;

impl EmbeddingClient for UnavailableEmbeddingClient {
    fn embed(&self, _text: &str) -> Result<Vec<f64>, KernelError> {
        Err(KernelError::UpstreamUnavailable(
            "no embedding backend configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_client_fails_fast() {
        let client = UnavailableEmbeddingClient;
        let result = client.embed("query text");
        assert!(matches!(result, Err(KernelError::UpstreamUnavailable(_))));
    }
}
