use std::{sync::Arc, time::Instant};

use futures_util::future::join_all;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{call_with_deadline, Backend, BackendError, GroupModel},
    cache::{CacheKey, ResponseCache},
    coalescing::{CoalesceOutcome, RoundCoalescer},
    config::DebateSettings,
    metrics::AppMetrics,
    models::{BackendResponse, ModelSelection, Turn},
    registry::BackendRegistry,
};

/// Id of the synthetic response returned when no backend has a credential.
pub const SYSTEM_BACKEND_ID: &str = "system";

const GROUP_DEADLINE_FACTOR: u32 = 2;

type TaskResult = Result<Vec<BackendResponse>, BackendError>;

/// What one spawned backend task produced.
#[derive(Debug)]
enum TaskOutcome {
    Ok(Vec<BackendResponse>),
    Fault(String),
}

impl TaskOutcome {
    fn from_join(result: Result<TaskResult, JoinError>) -> Self {
        match result {
            Ok(Ok(responses)) => Self::Ok(responses),
            Ok(Err(error)) => Self::Fault(error.to_string()),
            Err(error) => Self::Fault(format!("backend task failed: {error}")),
        }
    }

    fn into_responses(self, backend_id: &str) -> Vec<BackendResponse> {
        match self {
            Self::Ok(responses) => responses,
            Self::Fault(message) => vec![BackendResponse::failure(backend_id, message)],
        }
    }
}

struct RoundTask {
    /// Reported when the task faults; a group's own id since its models are unknown then.
    backend_id: String,
    handle: JoinHandle<TaskResult>,
}

/// Non-streaming fan-out: one response per selected backend, served from cache when fresh.
pub struct RoundDispatcher {
    registry: Arc<BackendRegistry>,
    cache: Arc<ResponseCache>,
    coalescer: RoundCoalescer,
    settings: DebateSettings,
    metrics: Arc<AppMetrics>,
}

impl RoundDispatcher {
    pub fn new(
        registry: Arc<BackendRegistry>,
        cache: Arc<ResponseCache>,
        settings: DebateSettings,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            registry,
            cache,
            coalescer: RoundCoalescer::default(),
            settings,
            metrics,
        }
    }

    /// Never fails: backend faults come back as error responses, and a missing configuration
    /// as a single response from [`SYSTEM_BACKEND_ID`].
    pub async fn run(
        &self,
        conversation: Vec<Turn>,
        system: Option<String>,
        selection: &ModelSelection,
    ) -> Vec<BackendResponse> {
        if !self.registry.has_any_credential() {
            warn!("round requested with no backend credentials configured");
            return vec![BackendResponse::failure(
                SYSTEM_BACKEND_ID,
                self.registry.missing_credentials_message(),
            )];
        }

        let system: Arc<str> = system
            .filter(|system| !system.trim().is_empty())
            .unwrap_or_else(|| self.settings.default_system.clone())
            .into();
        let conversation: Arc<[Turn]> = conversation.into();

        let Some(key) = CacheKey::for_request(&system, &conversation, selection) else {
            self.metrics.observe_cache("skip");
            return self.fan_out(conversation, system, selection).await;
        };

        if let Some(cached) = self.cache.lookup(&key).await {
            debug!(fingerprint = %key.as_str(), "round served from cache");
            self.metrics.observe_cache("hit");
            return cached;
        }

        let (responses, outcome) = self
            .coalescer
            .execute_or_join(key.as_str(), || {
                self.fan_out(conversation.clone(), system.clone(), selection)
            })
            .await;

        match outcome {
            CoalesceOutcome::Leader => {
                self.metrics.observe_cache("miss");
                self.cache.store(&key, &responses).await;
            }
            CoalesceOutcome::Joined => self.metrics.observe_cache("joined"),
        }

        responses
    }

    async fn fan_out(
        &self,
        conversation: Arc<[Turn]>,
        system: Arc<str>,
        selection: &ModelSelection,
    ) -> Vec<BackendResponse> {
        let round_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = self.settings.backend_timeout;
        // Groups bound each model themselves; this only stops a group stuck outside its fan-out.
        let group_deadline = deadline.map(|deadline| deadline * GROUP_DEADLINE_FACTOR);
        let mut tasks = Vec::new();

        for backend in self.registry.active_backends() {
            match backend {
                Backend::Group(group) => {
                    let models = group
                        .models()
                        .into_iter()
                        .filter(|model| selection.allows(&model.id))
                        .collect::<Vec<GroupModel>>();
                    if models.is_empty() {
                        continue;
                    }

                    let backend_id = group.id().to_owned();
                    let conversation = conversation.clone();
                    let system = system.clone();
                    let handle = tokio::spawn(async move {
                        call_with_deadline(
                            group_deadline,
                            group.chat_models(&models, &conversation, &system, deadline),
                        )
                        .await
                    });
                    tasks.push(RoundTask { backend_id, handle });
                }
                Backend::Single(single) => {
                    if !selection.allows(single.id()) {
                        continue;
                    }

                    let backend_id = single.id().to_owned();
                    let id = backend_id.clone();
                    let conversation = conversation.clone();
                    let system = system.clone();
                    let handle = tokio::spawn(async move {
                        let content =
                            call_with_deadline(deadline, single.chat(&conversation, &system))
                                .await?;
                        Ok::<_, BackendError>(vec![BackendResponse::success(id, content)])
                    });
                    tasks.push(RoundTask { backend_id, handle });
                }
            }
        }

        info!(%round_id, tasks = tasks.len(), turns = conversation.len(), "round started");

        let (backend_ids, handles): (Vec<String>, Vec<_>) = tasks
            .into_iter()
            .map(|task| (task.backend_id, task.handle))
            .unzip();
        let outcomes = join_all(handles).await;

        let responses = backend_ids
            .iter()
            .zip(outcomes)
            .flat_map(|(backend_id, result)| {
                TaskOutcome::from_join(result).into_responses(backend_id)
            })
            .collect::<Vec<_>>();

        for response in responses.iter().filter(|response| response.is_error()) {
            self.metrics.observe_backend_error(&response.backend_id);
            warn!(
                %round_id,
                backend = %response.backend_id,
                error = response.error.as_deref().unwrap_or_default(),
                "backend failed"
            );
        }

        info!(
            %round_id,
            responses = responses.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "round completed"
        );

        responses
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        backend::mock::{MockBackend, MockGroup},
        cache::{CacheConfig, ManualClock},
        config::StaticConfig,
    };

    struct Harness {
        config: Arc<StaticConfig>,
        clock: Arc<ManualClock>,
        dispatcher: RoundDispatcher,
    }

    fn harness(registry: impl FnOnce(Arc<StaticConfig>) -> BackendRegistry) -> Harness {
        let config = Arc::new(StaticConfig::new());
        let clock = Arc::new(ManualClock::new());
        let cache = ResponseCache::memory_with_clock(CacheConfig::default(), clock.clone());
        let dispatcher = RoundDispatcher::new(
            Arc::new(registry(config.clone())),
            Arc::new(cache),
            DebateSettings::default(),
            Arc::new(AppMetrics::new()),
        );
        Harness {
            config,
            clock,
            dispatcher,
        }
    }

    fn hello() -> Vec<Turn> {
        vec![Turn::user("Is Rust fun?")]
    }

    fn ids(responses: &[BackendResponse]) -> Vec<&str> {
        responses
            .iter()
            .map(|response| response.backend_id.as_str())
            .collect()
    }

    #[tokio::test]
    async fn no_credentials_yields_single_system_error() {
        let chatgpt = Arc::new(MockBackend::named("chatgpt"));
        let harness = harness(|config| {
            BackendRegistry::new(config).with_single("OPENAI_API_KEY", chatgpt.clone())
        });

        let responses = harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].backend_id, SYSTEM_BACKEND_ID);
        assert!(responses[0]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("OPENAI_API_KEY")));
        assert_eq!(chatgpt.calls(), 0);
    }

    #[tokio::test]
    async fn identical_round_within_ttl_is_served_from_cache() {
        let grok = Arc::new(MockBackend::named("grok"));
        let group = Arc::new(MockGroup::new("groq", &["llama-3.1-8b-instant"]));
        let harness = harness(|config| {
            BackendRegistry::new(config)
                .with_group("GROQ_API_KEY", group.clone())
                .with_single("XAI_API_KEY", grok.clone())
        });
        harness.config.set("GROQ_API_KEY", "gsk");
        harness.config.set("XAI_API_KEY", "xai");

        let first = harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;
        harness.clock.advance(Duration::from_secs(120));
        let second = harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;

        assert_eq!(first, second);
        assert_eq!(ids(&first), vec!["llama-3.1-8b-instant", "grok"]);
        assert_eq!(grok.calls(), 1);
        assert_eq!(group.calls(), 1);
    }

    #[tokio::test]
    async fn expired_entry_triggers_fresh_round() {
        let grok = Arc::new(MockBackend::named("grok"));
        let harness =
            harness(|config| BackendRegistry::new(config).with_single("XAI_API_KEY", grok.clone()));
        harness.config.set("XAI_API_KEY", "xai");

        harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;
        harness.clock.advance(Duration::from_secs(300));
        harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;
        harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;

        assert_eq!(grok.calls(), 2);
    }

    #[tokio::test]
    async fn different_system_instruction_is_not_a_cache_hit() {
        let grok = Arc::new(MockBackend::named("grok"));
        let harness =
            harness(|config| BackendRegistry::new(config).with_single("XAI_API_KEY", grok.clone()));
        harness.config.set("XAI_API_KEY", "xai");

        harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;
        harness
            .dispatcher
            .run(hello(), Some("Argue the opposite.".to_owned()), &ModelSelection::all())
            .await;

        assert_eq!(grok.calls(), 2);
    }

    #[tokio::test]
    async fn failing_backend_is_isolated_and_does_not_delay_others() {
        let delay = Duration::from_millis(200);
        let harness = harness(|config| {
            BackendRegistry::new(config)
                .with_single("OPENAI_API_KEY", Arc::new(MockBackend::named("chatgpt").with_delay(delay)))
                .with_single(
                    "XAI_API_KEY",
                    Arc::new(MockBackend::named("grok").with_delay(delay).failing("upstream 500")),
                )
                .with_single("MOONSHOT_API_KEY", Arc::new(MockBackend::named("kimi").with_delay(delay)))
        });
        for key in ["OPENAI_API_KEY", "XAI_API_KEY", "MOONSHOT_API_KEY"] {
            harness.config.set(key, "key");
        }

        let started = Instant::now();
        let responses = harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;
        let elapsed = started.elapsed();

        assert_eq!(ids(&responses), vec!["chatgpt", "grok", "kimi"]);
        assert!(!responses[0].is_error());
        assert!(responses[1]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("upstream 500")));
        assert!(responses[1].content.is_empty());
        assert!(!responses[2].is_error());
        assert!(elapsed < delay * 2, "round took {elapsed:?}");
    }

    #[tokio::test]
    async fn panicking_backend_becomes_error_response() {
        let harness = harness(|config| {
            BackendRegistry::new(config)
                .with_single("OPENAI_API_KEY", Arc::new(MockBackend::named("chatgpt").panicking()))
                .with_single("XAI_API_KEY", Arc::new(MockBackend::named("grok")))
        });
        harness.config.set("OPENAI_API_KEY", "key");
        harness.config.set("XAI_API_KEY", "key");

        let responses = harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;

        assert_eq!(ids(&responses), vec!["chatgpt", "grok"]);
        assert!(responses[0].is_error());
        assert_eq!(responses[1].content, "grok says: Is Rust fun?");
    }

    #[tokio::test]
    async fn slow_backend_hits_deadline() {
        let config = Arc::new(StaticConfig::new().with("XAI_API_KEY", "key"));
        let registry = BackendRegistry::new(config).with_single(
            "XAI_API_KEY",
            Arc::new(MockBackend::named("grok").with_delay(Duration::from_secs(30))),
        );
        let settings = DebateSettings {
            backend_timeout: Some(Duration::from_millis(50)),
            ..DebateSettings::default()
        };
        let dispatcher = RoundDispatcher::new(
            Arc::new(registry),
            Arc::new(ResponseCache::memory(CacheConfig::default())),
            settings,
            Arc::new(AppMetrics::new()),
        );

        let responses = dispatcher.run(hello(), None, &ModelSelection::all()).await;

        assert_eq!(responses.len(), 1);
        assert!(responses[0]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("timeout")));
    }

    #[tokio::test]
    async fn selection_filters_in_registry_order() {
        let harness = harness(|config| {
            ["chatgpt", "gemini", "grok", "kimi", "claude"]
                .into_iter()
                .fold(BackendRegistry::new(config), |registry, id| {
                    registry.with_single(
                        &format!("{}_KEY", id.to_uppercase()),
                        Arc::new(MockBackend::named(id)),
                    )
                })
        });
        for id in ["CHATGPT", "GEMINI", "GROK", "KIMI", "CLAUDE"] {
            harness.config.set(&format!("{id}_KEY"), "key");
        }

        let selection =
            ModelSelection::from_ids(Some(vec!["claude".to_owned(), "gemini".to_owned()]));
        let responses = harness.dispatcher.run(hello(), None, &selection).await;
        assert_eq!(ids(&responses), vec!["gemini", "claude"]);

        harness.config.remove("CLAUDE_KEY");
        let responses = harness
            .dispatcher
            .run(vec![Turn::user("again")], None, &selection)
            .await;
        assert_eq!(ids(&responses), vec!["gemini"]);
    }

    #[tokio::test]
    async fn group_failure_yields_one_error_under_group_id() {
        let harness = harness(|config| {
            BackendRegistry::new(config)
                .with_group(
                    "OPENROUTER_API_KEY",
                    Arc::new(
                        MockGroup::new("openrouter", &["openai/gpt-4o-mini", "x-ai/grok-3"])
                            .failing("invalid key"),
                    ),
                )
                .with_single("OPENAI_API_KEY", Arc::new(MockBackend::named("chatgpt")))
        });
        harness.config.set("OPENROUTER_API_KEY", "key");
        harness.config.set("OPENAI_API_KEY", "key");

        let responses = harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;

        assert_eq!(ids(&responses), vec!["openrouter", "chatgpt"]);
        assert!(responses[0].is_error());
        assert!(!responses[1].is_error());
    }

    #[tokio::test]
    async fn groups_come_first_with_per_model_results() {
        let groq = Arc::new(
            MockGroup::new("groq", &["llama-3.3-70b-versatile", "llama-3.1-8b-instant"])
                .failing_model("llama-3.1-8b-instant"),
        );
        let openrouter = Arc::new(MockGroup::new(
            "openrouter",
            &["openai/gpt-4o-mini", "moonshotai/kimi-k2"],
        ));
        let harness = harness(|config| {
            BackendRegistry::new(config)
                .with_group("OPENROUTER_API_KEY", openrouter.clone())
                .with_group("GROQ_API_KEY", groq.clone())
                .with_single("OPENAI_API_KEY", Arc::new(MockBackend::named("chatgpt")))
        });
        for key in ["OPENROUTER_API_KEY", "GROQ_API_KEY", "OPENAI_API_KEY"] {
            harness.config.set(key, "key");
        }

        let responses = harness
            .dispatcher
            .run(hello(), None, &ModelSelection::all())
            .await;

        assert_eq!(
            ids(&responses),
            vec![
                "gpt-4o-mini",
                "kimi-k2",
                "llama-3.3-70b-versatile",
                "llama-3.1-8b-instant",
                "chatgpt"
            ]
        );
        assert!(responses[3].is_error());
        assert_eq!(responses.iter().filter(|r| r.is_error()).count(), 1);

        let selection = ModelSelection::from_ids(Some(vec!["chatgpt".to_owned()]));
        let responses = harness.dispatcher.run(hello(), None, &selection).await;
        assert_eq!(ids(&responses), vec!["chatgpt"]);
        assert_eq!(groq.calls(), 1);
        assert_eq!(openrouter.calls(), 1);
    }

    #[tokio::test]
    async fn hung_group_model_times_out_alone() {
        let config = Arc::new(StaticConfig::new().with("OPENROUTER_API_KEY", "key"));
        let registry = BackendRegistry::new(config).with_group(
            "OPENROUTER_API_KEY",
            Arc::new(
                MockGroup::new("openrouter", &["a/fast-a", "b/fast-b", "c/hung"])
                    .slow_model("hung", Duration::from_secs(30)),
            ),
        );
        let settings = DebateSettings {
            backend_timeout: Some(Duration::from_millis(100)),
            ..DebateSettings::default()
        };
        let dispatcher = RoundDispatcher::new(
            Arc::new(registry),
            Arc::new(ResponseCache::memory(CacheConfig::default())),
            settings,
            Arc::new(AppMetrics::new()),
        );

        let started = Instant::now();
        let responses = dispatcher.run(hello(), None, &ModelSelection::all()).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ids(&responses), vec!["fast-a", "fast-b", "hung"]);
        assert_eq!(responses[0].content, "fast-a says: Is Rust fun?");
        assert_eq!(responses[1].content, "fast-b says: Is Rust fun?");
        assert!(responses[2]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("timeout")));
    }
}
