use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{
    backend::{
        fan_out_models, BackendError, ChatBackend, DeltaStream, GroupBackend, GroupModel,
    },
    models::{BackendResponse, Role, Turn},
};

#[derive(Debug, Clone)]
enum Failure {
    Error(String),
    Panic,
}

/// In-process single backend that echoes the latest user turn.
#[derive(Debug)]
pub struct MockBackend {
    id: String,
    delay: Duration,
    failure: Option<Failure>,
    calls: AtomicUsize,
}

impl MockBackend {
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            delay: Duration::ZERO,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(Failure::Error(message.into()));
        self
    }

    pub fn panicking(mut self) -> Self {
        self.failure = Some(Failure::Panic);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, conversation: &[Turn], _system: &str) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        match &self.failure {
            Some(Failure::Error(message)) => Err(BackendError::Unavailable(message.clone())),
            Some(Failure::Panic) => panic!("mock backend {} panicked", self.id),
            None => Ok(render_response(&self.id, conversation)),
        }
    }
}

/// In-process group backend. Streams emit a configurable number of deltas per model.
#[derive(Debug)]
pub struct MockGroup {
    id: String,
    models: Vec<GroupModel>,
    delay: Duration,
    token_delay: Duration,
    group_failure: Option<Failure>,
    failing_models: HashSet<String>,
    slow_models: HashMap<String, Duration>,
    deltas: HashMap<String, usize>,
    calls: AtomicUsize,
    streams: AtomicUsize,
}

impl MockGroup {
    /// Models are reported by the last segment of their upstream name.
    pub fn new(id: impl Into<String>, upstream_models: &[&str]) -> Self {
        Self {
            id: id.into(),
            models: upstream_models
                .iter()
                .map(|model| GroupModel::slugged(*model))
                .collect(),
            delay: Duration::ZERO,
            token_delay: Duration::from_millis(1),
            group_failure: None,
            failing_models: HashSet::new(),
            slow_models: HashMap::new(),
            deltas: HashMap::new(),
            calls: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.group_failure = Some(Failure::Error(message.into()));
        self
    }

    pub fn panicking(mut self) -> Self {
        self.group_failure = Some(Failure::Panic);
        self
    }

    pub fn failing_model(mut self, model_id: impl Into<String>) -> Self {
        self.failing_models.insert(model_id.into());
        self
    }

    /// Delays only `model_id`'s answer; the group itself responds at once.
    pub fn slow_model(mut self, model_id: impl Into<String>, delay: Duration) -> Self {
        self.slow_models.insert(model_id.into(), delay);
        self
    }

    /// Number of deltas `model_id` streams before finishing (default 3).
    pub fn with_deltas(mut self, model_id: impl Into<String>, count: usize) -> Self {
        self.deltas.insert(model_id.into(), count);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    fn check_group(&self) -> Result<(), BackendError> {
        match &self.group_failure {
            Some(Failure::Error(message)) => Err(BackendError::Unavailable(message.clone())),
            Some(Failure::Panic) => panic!("mock group {} panicked", self.id),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GroupBackend for MockGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn models(&self) -> Vec<GroupModel> {
        self.models.clone()
    }

    async fn chat_models(
        &self,
        models: &[GroupModel],
        conversation: &[Turn],
        _system: &str,
        deadline: Option<Duration>,
    ) -> Result<Vec<BackendResponse>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.check_group()?;

        Ok(fan_out_models(models, deadline, |model| async move {
            if let Some(delay) = self.slow_models.get(&model.id) {
                sleep(*delay).await;
            }
            if self.failing_models.contains(&model.id) {
                Err(BackendError::InvalidResponse(format!("{} refused", model.id)))
            } else {
                Ok(render_response(&model.id, conversation))
            }
        })
        .await)
    }

    async fn stream_model(
        &self,
        model: &GroupModel,
        _conversation: &[Turn],
        _system: &str,
    ) -> Result<DeltaStream, BackendError> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        self.check_group()?;

        let count = self.deltas.get(&model.id).copied().unwrap_or(3);
        let fails = self.failing_models.contains(&model.id);
        let model_id = model.id.clone();
        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for index in 0..count {
                if tx.send(Ok(format!("{model_id}-{index} "))).await.is_err() {
                    return;
                }
                sleep(delay).await;
            }

            if fails {
                let _ = tx
                    .send(Err(BackendError::Unavailable(format!("{model_id} dropped"))))
                    .await;
            }
        });

        debug!(group = %self.id, model = %model.id, "stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }
}

fn render_response(backend_id: &str, conversation: &[Turn]) -> String {
    let prompt = conversation
        .iter()
        .rev()
        .find(|turn| turn.role == Role::User)
        .map(|turn| turn.content.as_str())
        .unwrap_or("hello");

    format!("{backend_id} says: {prompt}")
}
