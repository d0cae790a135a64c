use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{
    backend::{http_client, map_http_error, map_transport_error, BackendError, ChatBackend},
    config::ConfigSource,
    models::{Role, Turn},
};

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    client: reqwest::Client,
    config: Arc<dyn ConfigSource>,
    model: String,
    max_tokens: u32,
}

impl AnthropicBackend {
    pub const CREDENTIAL: &'static str = "ANTHROPIC_API_KEY";

    pub fn new(
        model: &str,
        max_tokens: u32,
        config: Arc<dyn ConfigSource>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            client: http_client(timeout)?,
            config,
            model: model.to_owned(),
            max_tokens,
        })
    }
}

#[async_trait]
impl ChatBackend for AnthropicBackend {
    fn id(&self) -> &str {
        "claude"
    }

    async fn chat(&self, conversation: &[Turn], system: &str) -> Result<String, BackendError> {
        let api_key = self
            .config
            .var(Self::CREDENTIAL)
            .ok_or_else(|| BackendError::MissingCredential(Self::CREDENTIAL.to_owned()))?;

        // The Messages API takes the system instruction out of band.
        let messages = conversation
            .iter()
            .filter(|turn| turn.role != Role::System)
            .map(|turn| json!({"role": turn.role.as_str(), "content": turn.content}))
            .collect::<Vec<_>>();
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": messages,
        });

        let response = self
            .client
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(map_http_error(
                response.status(),
                response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown backend error".to_owned()),
            ));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

        Ok(parsed
            .content
            .first()
            .and_then(|block| block.text.as_deref())
            .unwrap_or_default()
            .trim()
            .to_owned())
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}
