use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{
    backend::{http_client, map_http_error, map_transport_error, BackendError, ChatBackend},
    config::ConfigSource,
    models::Turn,
};

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiBackend {
    client: reqwest::Client,
    config: Arc<dyn ConfigSource>,
    model: String,
    max_tokens: u32,
}

impl GeminiBackend {
    pub const CREDENTIAL: &'static str = "GEMINI_API_KEY";

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

/// Gemini receives the whole exchange as one labelled prompt.
fn flatten_prompt(conversation: &[Turn], system: &str) -> String {
    let system = (!system.is_empty()).then(|| system.to_owned());
    system
        .into_iter()
        .chain(
            conversation
                .iter()
                .map(|turn| format!("{}: {}", turn.role.as_str(), turn.content)),
        )
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl ChatBackend for GeminiBackend {
    fn id(&self) -> &str {
        "gemini"
    }

    async fn chat(&self, conversation: &[Turn], system: &str) -> Result<String, BackendError> {
        let api_key = self
            .config
            .var(Self::CREDENTIAL)
            .ok_or_else(|| BackendError::MissingCredential(Self::CREDENTIAL.to_owned()))?;

        let payload = json!({
            "contents": [{"parts": [{"text": flatten_prompt(conversation, system)}]}],
            "generationConfig": {"maxOutputTokens": self.max_tokens},
        });

        let response = self
            .client
            .post(format!("{GEMINI_BASE}/models/{}:generateContent", self.model))
            .header("x-goog-api-key", api_key)
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

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();

        Ok(text.trim().to_owned())
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::flatten_prompt;
    use crate::models::Turn;

    #[test]
    fn prompt_labels_each_turn() {
        let prompt = flatten_prompt(&[Turn::user("why?"), Turn::assistant("because")], "judge");
        assert_eq!(prompt, "judge\n\nuser: why?\n\nassistant: because");
    }
}
