use async_trait::async_trait;

use crate::llm::error::GenerationError;

/// What a generator call needs beyond the prompt. `base_url` and `model`
/// override the generator's own defaults when set.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

/// Text generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Free-form completion for `prompt`.
    async fn generate(&self, prompt: &str, credentials: &Credentials) -> Result<String, GenerationError>;

    /// Completion constrained to a JSON object. The raw text is returned; the
    /// caller parses it.
    async fn generate_json(
        &self,
        prompt: &str,
        credentials: &Credentials,
    ) -> Result<String, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_key() {
        let creds = Credentials::new("sk-secret");
        let shown = format!("{creds:?}");
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("redacted"));
    }
}
