use std::{sync::Arc, time::Duration};

use futures_util::{
    stream::{self, BoxStream},
    StreamExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{call_with_deadline, BackendError, GroupBackend, GroupModel},
    config::DebateSettings,
    metrics::AppMetrics,
    models::{ModelSelection, StreamEvent, Turn},
    registry::BackendRegistry,
};

pub type EventStream = BoxStream<'static, StreamEvent>;

const EVENT_BUFFER: usize = 64;

/// Streaming fan-out over every model of every active group.
///
/// Each model is one producer that emits its deltas followed by exactly one terminal event.
/// The merged stream ends once all producers have reported a terminal event. Nothing here
/// touches the response cache.
pub struct StreamMultiplexer {
    registry: Arc<BackendRegistry>,
    settings: DebateSettings,
    metrics: Arc<AppMetrics>,
}

impl StreamMultiplexer {
    pub fn new(
        registry: Arc<BackendRegistry>,
        settings: DebateSettings,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            registry,
            settings,
            metrics,
        }
    }

    /// Producers start on the first poll. Backends without streaming contribute nothing.
    pub fn stream(
        &self,
        conversation: Vec<Turn>,
        system: Option<String>,
        selection: &ModelSelection,
    ) -> EventStream {
        let producers = self
            .registry
            .active_groups()
            .into_iter()
            .flat_map(|group| {
                group
                    .models()
                    .into_iter()
                    .filter(|model| selection.allows(&model.id))
                    .map(move |model| (group.clone(), model))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        if producers.is_empty() {
            debug!("no streaming-capable backend selected");
            return stream::empty().boxed();
        }

        let stream_id = Uuid::new_v4();
        let expected = producers.len();
        let system: Arc<str> = system
            .filter(|system| !system.trim().is_empty())
            .unwrap_or_else(|| self.settings.default_system.clone())
            .into();
        let conversation: Arc<[Turn]> = conversation.into();
        let deadline = self.settings.backend_timeout;
        let metrics = self.metrics.clone();

        let events = async_stream::stream! {
            let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
            for (group, model) in producers {
                spawn_producer(group, model, conversation.clone(), system.clone(), deadline, tx.clone());
            }
            drop(tx);
            info!(%stream_id, producers = expected, "stream started");

            let mut finished = 0;
            while finished < expected {
                let Some(event) = rx.recv().await else {
                    warn!(%stream_id, finished, expected, "producers vanished before finishing");
                    break;
                };
                if event.is_terminal() {
                    finished += 1;
                }
                if let StreamEvent::Error { backend_id, error } = &event {
                    metrics.observe_backend_error(backend_id);
                    warn!(%stream_id, backend = %backend_id, error = %error, "producer failed");
                }
                metrics.observe_stream_event(event.kind());
                yield event;
            }

            info!(%stream_id, "stream completed");
        };

        events.boxed()
    }
}

/// Runs one producer and guarantees its terminal event, even if the producer panics.
fn spawn_producer(
    group: Arc<dyn GroupBackend>,
    model: GroupModel,
    conversation: Arc<[Turn]>,
    system: Arc<str>,
    deadline: Option<Duration>,
    tx: mpsc::Sender<StreamEvent>,
) {
    tokio::spawn(async move {
        let backend_id = model.id.clone();
        let worker = tokio::spawn(forward_deltas(
            group,
            model,
            conversation,
            system,
            deadline,
            tx.clone(),
        ));

        let terminal = match worker.await {
            Ok(Ok(())) => StreamEvent::done(&backend_id),
            Ok(Err(error)) => StreamEvent::error(&backend_id, error.to_string()),
            Err(error) => StreamEvent::error(&backend_id, format!("producer task failed: {error}")),
        };
        // A closed channel means the consumer went away.
        let _ = tx.send(terminal).await;
    });
}

async fn forward_deltas(
    group: Arc<dyn GroupBackend>,
    model: GroupModel,
    conversation: Arc<[Turn]>,
    system: Arc<str>,
    deadline: Option<Duration>,
    tx: mpsc::Sender<StreamEvent>,
) -> Result<(), BackendError> {
    call_with_deadline(deadline, async {
        let mut deltas = group.stream_model(&model, &conversation, &system).await?;
        while let Some(next) = deltas.next().await {
            let delta = next?;
            if delta.is_empty() {
                continue;
            }
            if tx.send(StreamEvent::delta(&model.id, delta)).await.is_err() {
                debug!(backend = %model.id, "consumer dropped, stopping producer");
                return Ok(());
            }
        }
        Ok::<(), BackendError>(())
    })
    .await
}
