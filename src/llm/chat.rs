/// OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GeneratorConfig;
use crate::llm::error::GenerationError;
use crate::llm::generator::{Credentials, Generator};

const SYSTEM_PROMPT: &str =
    "You are a careful world-building assistant. Follow the requested format exactly.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// `POST {base_url}/chat/completions` with a bearer key.
pub struct ChatCompletionsGenerator {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl ChatCompletionsGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self, GenerationError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::InvalidRequest(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout,
        })
    }

    async fn complete(
        &self,
        prompt: &str,
        credentials: &Credentials,
        json: bool,
    ) -> Result<String, GenerationError> {
        let base_url = credentials
            .base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .unwrap_or(&self.base_url);
        let model = credentials.model.as_deref().unwrap_or(&self.model);

        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            response_format: json.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        debug!(model, json, prompt_chars = prompt.len(), "calling chat completions");

        let response = self
            .client
            .post(format!("{base_url}/chat/completions"))
            .bearer_auth(&credentials.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "chat completions request rejected");
            return Err(GenerationError::from_status(status.as_u16(), body, retry_after));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;

        extract_content(body)
    }

    fn transport_error(&self, e: reqwest::Error) -> GenerationError {
        if e.is_timeout() {
            GenerationError::Timeout(self.timeout)
        } else {
            GenerationError::Network(e.to_string())
        }
    }
}

fn extract_content(body: ChatResponse) -> Result<String, GenerationError> {
    let content = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GenerationError::MalformedResponse("no choices".to_string()))?
        .message
        .content
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(content)
}

#[async_trait]
impl Generator for ChatCompletionsGenerator {
    async fn generate(&self, prompt: &str, credentials: &Credentials) -> Result<String, GenerationError> {
        self.complete(prompt, credentials, false).await
    }

    async fn generate_json(
        &self,
        prompt: &str,
        credentials: &Credentials,
    ) -> Result<String, GenerationError> {
        self.complete(prompt, credentials, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<String, GenerationError> {
        extract_content(serde_json::from_str(raw).unwrap())
    }

    #[test]
    fn request_shape() {
        let request = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.5,
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][0]["role"], "user");

        let plain = ChatRequest {
            response_format: None,
            ..request
        };
        let value = serde_json::to_value(&plain).unwrap();
        assert!(value.get("response_format").is_none());
    }

    #[test]
    fn content_extraction() {
        assert_eq!(
            parse(r#"{"choices":[{"message":{"role":"assistant","content":"Hello"}}]}"#).unwrap(),
            "Hello"
        );
        assert!(matches!(
            parse(r#"{"choices":[]}"#),
            Err(GenerationError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse(r#"{"choices":[{"message":{"content":"   "}}]}"#),
            Err(GenerationError::EmptyResponse)
        ));
        assert!(matches!(
            parse(r#"{"choices":[{"message":{"content":null}}]}"#),
            Err(GenerationError::EmptyResponse)
        ));
    }

    #[test]
    fn base_url_is_normalized() {
        let config = GeneratorConfig {
            base_url: "https://llm.example/v1/".to_string(),
            ..GeneratorConfig::default()
        };
        let generator = ChatCompletionsGenerator::new(&config).unwrap();
        assert_eq!(generator.base_url, "https://llm.example/v1");
    }
}
