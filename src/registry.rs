use std::{collections::BTreeSet, sync::Arc};

use crate::{
    backend::{
        anthropic::AnthropicBackend,
        gemini::GeminiBackend,
        openai::{
            OpenAiCompatBackend, OpenAiCompatClient, OpenAiCompatGroup, GROQ_BASE, MOONSHOT_BASE,
            OPENAI_BASE, OPENROUTER_BASE, XAI_BASE,
        },
        Backend, BackendError, ChatBackend, GroupBackend,
    },
    config::{ConfigSource, DebateSettings},
};

const SPECIALIZED_MAX_TOKENS: u32 = 2048;

const OPENROUTER_DEFAULT_MODELS: &[&str] = &[
    "openai/gpt-4o-mini",
    "anthropic/claude-3.5-haiku",
    "google/gemini-2.5-flash",
    "x-ai/grok-3",
    "moonshotai/kimi-k2",
];

const GROQ_DEFAULT_MODELS: &[&str] = &["llama-3.3-70b-versatile", "llama-3.1-8b-instant"];

struct Registration {
    credential: String,
    backend: Backend,
}

/// Every known backend, each gated by one credential.
///
/// Credentials are checked on every call, so adding or removing one takes effect on the next
/// request. Groups always enumerate before single backends, each in registration order.
pub struct BackendRegistry {
    config: Arc<dyn ConfigSource>,
    groups: Vec<Registration>,
    singles: Vec<Registration>,
}

impl BackendRegistry {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self {
            config,
            groups: Vec::new(),
            singles: Vec::new(),
        }
    }

    /// OpenRouter and Groq groups, then OpenAI, Gemini, xAI, Moonshot and Anthropic.
    pub fn with_default_providers(
        config: Arc<dyn ConfigSource>,
        settings: &DebateSettings,
    ) -> Result<Self, BackendError> {
        let timeout = settings.http_timeout;
        let compat = |base: &str, credential: &str| {
            OpenAiCompatClient::new(base, credential, config.clone(), timeout)
        };

        let openrouter = OpenAiCompatGroup::new(
            "openrouter",
            "OPENROUTER_DEBATE_MODELS",
            OPENROUTER_DEFAULT_MODELS,
            true,
            SPECIALIZED_MAX_TOKENS,
            compat(OPENROUTER_BASE, "OPENROUTER_API_KEY")?,
            config.clone(),
        )
        .with_stream_max_tokens(settings.max_tokens);
        let groq = OpenAiCompatGroup::new(
            "groq",
            "GROQ_DEBATE_MODELS",
            GROQ_DEFAULT_MODELS,
            false,
            settings.max_tokens,
            compat(GROQ_BASE, "GROQ_API_KEY")?,
            config.clone(),
        );
        let chatgpt = OpenAiCompatBackend::new(
            "chatgpt",
            "gpt-4o-mini",
            settings.max_tokens,
            compat(OPENAI_BASE, "OPENAI_API_KEY")?,
        );
        let gemini = GeminiBackend::new(
            "gemini-1.5-flash",
            SPECIALIZED_MAX_TOKENS,
            config.clone(),
            timeout,
        )?;
        let grok = OpenAiCompatBackend::new(
            "grok",
            "grok-3",
            SPECIALIZED_MAX_TOKENS,
            compat(XAI_BASE, "XAI_API_KEY")?,
        );
        let kimi = OpenAiCompatBackend::new(
            "kimi",
            "moonshot-v1-128k",
            settings.max_tokens,
            compat(MOONSHOT_BASE, "MOONSHOT_API_KEY")?,
        );
        let claude = AnthropicBackend::new(
            "claude-3-5-sonnet-20241022",
            SPECIALIZED_MAX_TOKENS,
            config.clone(),
            timeout,
        )?;

        Ok(Self::new(config.clone())
            .with_group("OPENROUTER_API_KEY", Arc::new(openrouter))
            .with_group("GROQ_API_KEY", Arc::new(groq))
            .with_single("OPENAI_API_KEY", Arc::new(chatgpt))
            .with_single(GeminiBackend::CREDENTIAL, Arc::new(gemini))
            .with_single("XAI_API_KEY", Arc::new(grok))
            .with_single("MOONSHOT_API_KEY", Arc::new(kimi))
            .with_single(AnthropicBackend::CREDENTIAL, Arc::new(claude)))
    }

    pub fn with_group(mut self, credential: &str, group: Arc<dyn GroupBackend>) -> Self {
        self.groups.push(Registration {
            credential: credential.to_owned(),
            backend: Backend::Group(group),
        });
        self
    }

    pub fn with_single(mut self, credential: &str, backend: Arc<dyn ChatBackend>) -> Self {
        self.singles.push(Registration {
            credential: credential.to_owned(),
            backend: Backend::Single(backend),
        });
        self
    }

    fn registrations(&self) -> impl Iterator<Item = &Registration> {
        self.groups.iter().chain(self.singles.iter())
    }

    fn is_active(&self, registration: &Registration) -> bool {
        self.config.is_set(&registration.credential)
    }

    pub fn has_any_credential(&self) -> bool {
        self.registrations()
            .any(|registration| self.is_active(registration))
    }

    /// Distinct credential names, in registration order.
    pub fn credential_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for registration in self.registrations() {
            if !names.contains(&registration.credential.as_str()) {
                names.push(&registration.credential);
            }
        }
        names
    }

    pub fn missing_credentials_message(&self) -> String {
        format!(
            "No LLM API keys configured. Set any of: {}",
            self.credential_names().join(", ")
        )
    }

    /// Active groups then active single backends.
    pub fn active_backends(&self) -> Vec<Backend> {
        self.registrations()
            .filter(|registration| self.is_active(registration))
            .map(|registration| registration.backend.clone())
            .collect()
    }

    pub fn active_groups(&self) -> Vec<Arc<dyn GroupBackend>> {
        self.groups
            .iter()
            .filter(|registration| self.is_active(registration))
            .filter_map(|registration| match &registration.backend {
                Backend::Group(group) => Some(group.clone()),
                Backend::Single(_) => None,
            })
            .collect()
    }

    /// Ids a caller may select: every model of active groups plus active single backends.
    pub fn active_backend_ids(&self) -> BTreeSet<String> {
        self.active_backends()
            .into_iter()
            .flat_map(|backend| match backend {
                Backend::Group(group) => group.models().into_iter().map(|model| model.id).collect(),
                Backend::Single(single) => vec![single.id().to_owned()],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::mock::{MockBackend, MockGroup},
        config::StaticConfig,
    };

    fn registry(config: Arc<StaticConfig>) -> BackendRegistry {
        BackendRegistry::new(config)
            .with_group(
                "OPENROUTER_API_KEY",
                Arc::new(MockGroup::new("openrouter", &["openai/gpt-4o-mini", "x-ai/grok-3"])),
            )
            .with_single("OPENAI_API_KEY", Arc::new(MockBackend::named("chatgpt")))
            .with_single("ANTHROPIC_API_KEY", Arc::new(MockBackend::named("claude")))
    }

    #[test]
    fn credentials_are_checked_per_call() {
        let config = Arc::new(StaticConfig::new());
        let registry = registry(config.clone());
        assert!(!registry.has_any_credential());
        assert!(registry.active_backends().is_empty());

        config.set("ANTHROPIC_API_KEY", "sk-ant");
        let ids = registry
            .active_backends()
            .iter()
            .map(|backend| backend.id().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["claude"]);

        config.remove("ANTHROPIC_API_KEY");
        assert!(!registry.has_any_credential());
    }

    #[test]
    fn groups_enumerate_before_singles() {
        let config = Arc::new(
            StaticConfig::new()
                .with("OPENAI_API_KEY", "sk")
                .with("ANTHROPIC_API_KEY", "sk-ant")
                .with("OPENROUTER_API_KEY", "sk-or"),
        );
        let registry = registry(config);

        let ids = registry
            .active_backends()
            .iter()
            .map(|backend| backend.id().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["openrouter", "chatgpt", "claude"]);
        assert_eq!(registry.active_groups().len(), 1);

        let selectable = registry.active_backend_ids().into_iter().collect::<Vec<_>>();
        assert_eq!(selectable, vec!["chatgpt", "claude", "gpt-4o-mini", "grok-3"]);
    }

    #[test]
    fn missing_credentials_message_names_every_key() {
        let registry = registry(Arc::new(StaticConfig::new()));
        let message = registry.missing_credentials_message();

        assert!(message.contains("OPENROUTER_API_KEY"));
        assert!(message.contains("OPENAI_API_KEY"));
        assert!(message.contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn default_providers_register_in_fixed_order() {
        let config = Arc::new(
            StaticConfig::new()
                .with("GROQ_API_KEY", "gsk")
                .with("MOONSHOT_API_KEY", "sk-moon")
                .with("OPENAI_API_KEY", "sk"),
        );
        let registry = BackendRegistry::with_default_providers(config, &DebateSettings::default())
            .expect("default providers should build");

        let ids = registry
            .active_backends()
            .iter()
            .map(|backend| backend.id().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["groq", "chatgpt", "kimi"]);
        assert_eq!(registry.credential_names().len(), 7);
    }
}
