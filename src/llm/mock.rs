/// Scripted generator for tests and offline runs.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::llm::error::GenerationError;
use crate::llm::generator::{Credentials, Generator};

/// One pre-programmed reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(GenerationError),
    /// Wait, then give the inner reply.
    Delay(Duration, Box<ScriptedReply>),
}

/// Record of one call made against the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCall {
    pub prompt: String,
    pub json: bool,
    pub api_key: String,
}

/// Replies are consumed in order, shared by `generate` and `generate_json`.
/// An exhausted script answers with a network error.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.push(ScriptedReply::Text(text.into()));
        self
    }

    pub fn with_error(self, error: GenerationError) -> Self {
        self.push(ScriptedReply::Error(error));
        self
    }

    pub fn with_delay(self, delay: Duration, text: impl Into<String>) -> Self {
        self.push(ScriptedReply::Delay(
            delay,
            Box::new(ScriptedReply::Text(text.into())),
        ));
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }

    async fn answer(
        &self,
        prompt: &str,
        credentials: &Credentials,
        json: bool,
    ) -> Result<String, GenerationError> {
        self.calls.lock().push(ScriptedCall {
            prompt: prompt.to_string(),
            json,
            api_key: credentials.api_key.clone(),
        });
        let reply = self.replies.lock().pop_front();

        let mut current = match reply {
            Some(reply) => reply,
            None => {
                return Err(GenerationError::Network(
                    "scripted generator has no reply left".to_string(),
                ))
            }
        };
        loop {
            match current {
                ScriptedReply::Text(text) => return Ok(text),
                ScriptedReply::Error(e) => return Err(e),
                ScriptedReply::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    current = *inner;
                }
            }
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, credentials: &Credentials) -> Result<String, GenerationError> {
        self.answer(prompt, credentials, false).await
    }

    async fn generate_json(
        &self,
        prompt: &str,
        credentials: &Credentials,
    ) -> Result<String, GenerationError> {
        self.answer(prompt, credentials, true).await
    }
}
