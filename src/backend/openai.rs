use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    backend::{
        fan_out_models, http_client, map_http_error, map_transport_error, BackendError,
        ChatBackend, DeltaStream, GroupBackend, GroupModel,
    },
    config::{read_list, ConfigSource},
    models::{BackendResponse, Turn},
};

pub const OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const XAI_BASE: &str = "https://api.x.ai/v1";
pub const MOONSHOT_BASE: &str = "https://api.moonshot.cn/v1";
pub const OPENROUTER_BASE: &str = "https://openrouter.ai/api/v1";
pub const GROQ_BASE: &str = "https://api.groq.com/openai/v1";

/// Chat-completions client for any OpenAI-compatible endpoint.
///
/// The bearer token is read from `config` on every request.
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    config: Arc<dyn ConfigSource>,
    credential: String,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: &str,
        credential: &str,
        config: Arc<dyn ConfigSource>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_owned(),
            config,
            credential: credential.to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn api_key(&self) -> Result<String, BackendError> {
        self.config
            .var(&self.credential)
            .ok_or_else(|| BackendError::MissingCredential(self.credential.clone()))
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, BackendError> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(api_key)
            .json(payload)
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

        Ok(response)
    }

    pub async fn complete(
        &self,
        model: &str,
        conversation: &[Turn],
        system: &str,
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        let payload = json!({
            "model": model,
            "messages": wire_messages(conversation, system),
            "max_tokens": max_tokens,
            "stream": false
        });

        let parsed: ChatResponse = self
            .post(&payload)
            .await?
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

        let choice = parsed.choices.first().ok_or_else(|| {
            BackendError::InvalidResponse("missing choices in response".to_owned())
        })?;

        Ok(choice
            .message
            .content
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_owned())
    }

    pub async fn stream(
        &self,
        model: &str,
        conversation: &[Turn],
        system: &str,
        max_tokens: u32,
    ) -> Result<DeltaStream, BackendError> {
        let payload = json!({
            "model": model,
            "messages": wire_messages(conversation, system),
            "max_tokens": max_tokens,
            "stream": true
        });

        let upstream = self.post(&payload).await?.bytes_stream();
        debug!(base_url = %self.base_url, model, "stream prepared");
        Ok(sse_deltas(upstream, map_transport_error))
    }
}

/// One parsed server-sent-events line of a chat-completions stream.
#[derive(Debug)]
enum SseLine {
    Skip,
    Delta { content: Option<String>, finished: bool },
    Done,
    Invalid(String),
}

fn parse_sse_line(line: &[u8]) -> SseLine {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line.trim(),
        Err(error) => return SseLine::Invalid(error.to_string()),
    };
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    let parsed: StreamResponse = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(error) => return SseLine::Invalid(error.to_string()),
    };
    let Some(choice) = parsed.choices.into_iter().next() else {
        return SseLine::Skip;
    };
    SseLine::Delta {
        content: choice.delta.content.filter(|content| !content.is_empty()),
        finished: choice.finish_reason.is_some(),
    }
}

/// Splits raw bytes into lines before decoding, so characters cut across chunks survive.
fn sse_deltas<S, B, E>(upstream: S, map_error: fn(E) -> BackendError) -> DeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
{
    let mut upstream = upstream.boxed();

    let stream = async_stream::stream! {
        let mut buffer = Vec::<u8>::new();
        'read: loop {
            let exhausted = match upstream.next().await {
                Some(Ok(chunk)) => {
                    buffer.extend_from_slice(chunk.as_ref());
                    false
                }
                Some(Err(error)) => {
                    yield Err(map_error(error));
                    break;
                }
                None => {
                    // Flush a final line sent without a newline.
                    buffer.push(b'\n');
                    true
                }
            };

            while let Some(index) = buffer.iter().position(|byte| *byte == b'\n') {
                let line = buffer.drain(..=index).collect::<Vec<u8>>();
                match parse_sse_line(&line) {
                    SseLine::Skip => {}
                    SseLine::Done => break 'read,
                    SseLine::Invalid(message) => {
                        yield Err(BackendError::InvalidResponse(message));
                        break 'read;
                    }
                    SseLine::Delta { content, finished } => {
                        if let Some(content) = content {
                            yield Ok(content);
                        }
                        if finished {
                            break 'read;
                        }
                    }
                }
            }

            if exhausted {
                break;
            }
        }
    };

    stream.boxed()
}

/// OpenAI wire messages: the system instruction first, then the turns in order.
fn wire_messages(conversation: &[Turn], system: &str) -> Vec<Value> {
    let system = (!system.is_empty()).then(|| json!({"role": "system", "content": system}));
    system
        .into_iter()
        .chain(
            conversation
                .iter()
                .map(|turn| json!({"role": turn.role.as_str(), "content": turn.content})),
        )
        .collect()
}

/// One provider, one fixed model.
pub struct OpenAiCompatBackend {
    id: String,
    model: String,
    max_tokens: u32,
    client: OpenAiCompatClient,
}

impl OpenAiCompatBackend {
    pub fn new(id: &str, model: &str, max_tokens: u32, client: OpenAiCompatClient) -> Self {
        Self {
            id: id.to_owned(),
            model: model.to_owned(),
            max_tokens,
            client,
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, conversation: &[Turn], system: &str) -> Result<String, BackendError> {
        self.client
            .complete(&self.model, conversation, system, self.max_tokens)
            .await
    }
}

/// One key, many models: the model list comes from `models_var` when set.
pub struct OpenAiCompatGroup {
    id: String,
    models_var: String,
    default_models: Vec<String>,
    slug_ids: bool,
    max_tokens: u32,
    stream_max_tokens: u32,
    client: OpenAiCompatClient,
    config: Arc<dyn ConfigSource>,
}

impl OpenAiCompatGroup {
    pub fn new(
        id: &str,
        models_var: &str,
        default_models: &[&str],
        slug_ids: bool,
        max_tokens: u32,
        client: OpenAiCompatClient,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            id: id.to_owned(),
            models_var: models_var.to_owned(),
            default_models: default_models.iter().map(|model| (*model).to_owned()).collect(),
            slug_ids,
            max_tokens,
            stream_max_tokens: max_tokens,
            client,
            config,
        }
    }

    /// Token cap for streamed answers when it differs from the non-streaming one.
    pub fn with_stream_max_tokens(mut self, max_tokens: u32) -> Self {
        self.stream_max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl GroupBackend for OpenAiCompatGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn models(&self) -> Vec<GroupModel> {
        read_list(self.config.as_ref(), &self.models_var)
            .unwrap_or_else(|| self.default_models.clone())
            .into_iter()
            .map(|model| {
                if self.slug_ids {
                    GroupModel::slugged(model)
                } else {
                    GroupModel::verbatim(model)
                }
            })
            .collect()
    }

    async fn chat_models(
        &self,
        models: &[GroupModel],
        conversation: &[Turn],
        system: &str,
        deadline: Option<Duration>,
    ) -> Result<Vec<BackendResponse>, BackendError> {
        self.client.api_key()?;
        Ok(fan_out_models(models, deadline, |model| async move {
            self.client
                .complete(&model.upstream, conversation, system, self.max_tokens)
                .await
        })
        .await)
    }

    async fn stream_model(
        &self,
        model: &GroupModel,
        conversation: &[Turn],
        system: &str,
    ) -> Result<DeltaStream, BackendError> {
        self.client
            .stream(&model.upstream, conversation, system, self.stream_max_tokens)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
