pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod openai;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{future::join_all, stream::BoxStream};
use reqwest::StatusCode;
use thiserror::Error;

use crate::models::{BackendResponse, Turn};

/// Incremental text deltas of one model, in generation order. End of stream means success.
pub type DeltaStream = BoxStream<'static, Result<String, BackendError>>;

/// A provider that answers one conversation with one text.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;
    async fn chat(&self, conversation: &[Turn], system: &str) -> Result<String, BackendError>;
}

/// A provider that serves several models under one credential.
#[async_trait]
pub trait GroupBackend: Send + Sync {
    /// Stable identifier used when the whole group fails.
    fn id(&self) -> &str;

    /// Currently configured models, in configured order.
    fn models(&self) -> Vec<GroupModel>;

    /// Answers with one response per requested model, in the order given. `deadline` bounds
    /// each model on its own, so one slow model cannot discard the others' answers.
    async fn chat_models(
        &self,
        models: &[GroupModel],
        conversation: &[Turn],
        system: &str,
        deadline: Option<Duration>,
    ) -> Result<Vec<BackendResponse>, BackendError>;

    async fn stream_model(
        &self,
        model: &GroupModel,
        conversation: &[Turn],
        system: &str,
    ) -> Result<DeltaStream, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupModel {
    /// Identifier sent upstream.
    pub upstream: String,
    /// Identifier reported in responses and matched against selections.
    pub id: String,
}

impl GroupModel {
    /// `vendor/model-name` is reported as `model-name`. A trailing slash leaves nothing to
    /// select by, so such names are reported whole.
    pub fn slugged(upstream: impl Into<String>) -> Self {
        let upstream = upstream.into();
        let id = match upstream.rsplit('/').next() {
            Some(slug) if !slug.is_empty() => slug.to_owned(),
            _ => upstream.clone(),
        };
        Self { upstream, id }
    }

    pub fn verbatim(upstream: impl Into<String>) -> Self {
        let upstream = upstream.into();
        Self {
            id: upstream.clone(),
            upstream,
        }
    }
}

#[derive(Clone)]
pub enum Backend {
    Single(Arc<dyn ChatBackend>),
    Group(Arc<dyn GroupBackend>),
}

impl Backend {
    pub fn id(&self) -> &str {
        match self {
            Backend::Single(backend) => backend.id(),
            Backend::Group(group) => group.id(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("missing credential {0}")]
    MissingCredential(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
}

/// Bounds `call` by `deadline`, reporting expiry as [`BackendError::Timeout`].
pub async fn call_with_deadline<T, F>(deadline: Option<Duration>, call: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    let Some(deadline) = deadline else {
        return call.await;
    };

    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(format!(
            "no response within {}s",
            deadline.as_secs_f64()
        ))),
    }
}

/// Runs `call` for every model concurrently, each bounded by `deadline`. A failing or
/// late model becomes its own error response.
pub async fn fan_out_models<F, Fut>(
    models: &[GroupModel],
    deadline: Option<Duration>,
    call: F,
) -> Vec<BackendResponse>
where
    F: Fn(GroupModel) -> Fut,
    Fut: Future<Output = Result<String, BackendError>>,
{
    let calls = models.iter().cloned().map(|model| {
        let id = model.id.clone();
        let pending = call_with_deadline(deadline, call(model));
        async move {
            match pending.await {
                Ok(content) => BackendResponse::success(id, content),
                Err(error) => BackendResponse::failure(id, error.to_string()),
            }
        }
    });

    join_all(calls).await
}

pub(crate) fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Unavailable(format!("rate limited: {trimmed}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Timeout(format!("upstream timeout: {trimmed}"))
        }
        _ => BackendError::InvalidResponse(format!("status {}: {trimmed}", status.as_u16())),
    }
}

pub(crate) fn map_transport_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::Unavailable(error.to_string())
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, BackendError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|error| BackendError::Unavailable(format!("failed to build HTTP client: {error}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn slugged_models_report_last_segment() {
        let model = GroupModel::slugged("openai/gpt-4o-mini");
        assert_eq!(model.upstream, "openai/gpt-4o-mini");
        assert_eq!(model.id, "gpt-4o-mini");

        let plain = GroupModel::slugged("llama-3.1-8b-instant");
        assert_eq!(plain.id, "llama-3.1-8b-instant");

        let vendor_only = GroupModel::slugged("openai/");
        assert_eq!(vendor_only.id, "openai/");
    }

    #[tokio::test]
    async fn deadline_turns_slow_calls_into_timeouts() {
        let result: Result<(), BackendError> =
            call_with_deadline(Some(Duration::from_millis(20)), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BackendError::Timeout(_))));
    }

    #[tokio::test]
    async fn fan_out_keeps_model_order_and_isolates_errors() {
        let models = vec![GroupModel::verbatim("a"), GroupModel::verbatim("b")];
        let responses = fan_out_models(&models, None, |model| async move {
            if model.id == "a" {
                Err(BackendError::Unavailable("down".to_owned()))
            } else {
                Ok(format!("hello from {}", model.id))
            }
        })
        .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].backend_id, "a");
        assert!(responses[0].is_error());
        assert_eq!(responses[1], BackendResponse::success("b", "hello from b"));
    }

    #[tokio::test]
    async fn fan_out_deadline_only_fails_the_late_model() {
        let models = vec![
            GroupModel::verbatim("fast"),
            GroupModel::verbatim("hung"),
        ];
        let responses = fan_out_models(&models, Some(Duration::from_millis(50)), |model| async move {
            if model.id == "hung" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(format!("{} answered", model.id))
        })
        .await;

        assert_eq!(responses[0], BackendResponse::success("fast", "fast answered"));
        assert_eq!(responses[1].backend_id, "hung");
        assert!(responses[1]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("timeout")));
    }
}
