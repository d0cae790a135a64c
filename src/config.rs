use std::{
    collections::HashMap,
    env,
    sync::{PoisonError, RwLock},
    time::Duration,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are participating in a shared discussion with the user and other AI assistants. \
You can see what other models have said in previous messages (they are labeled with their model names). \
Read their responses carefully, and feel free to agree, disagree, build upon, or challenge their viewpoints. \
Give a clear, concise response that engages with the conversation.";

/// Named settings and credentials, looked up on every call.
pub trait ConfigSource: Send + Sync {
    /// Returns the trimmed value, or `None` when unset or blank.
    fn var(&self, name: &str) -> Option<String>;

    fn is_set(&self, name: &str) -> bool {
        self.var(name).is_some()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl ConfigSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        env::var(name)
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }
}

/// In-memory source whose values can change while the service runs.
#[derive(Debug, Default)]
pub struct StaticConfig {
    values: RwLock<HashMap<String, String>>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, value: &str) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&self, name: &str, value: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), value.to_owned());
    }

    pub fn remove(&self, name: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

impl ConfigSource for StaticConfig {
    fn var(&self, name: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }
}

pub fn read_u64(source: &dyn ConfigSource, name: &str, default: u64) -> u64 {
    source
        .var(name)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Comma-separated list; `None` when unset or when every item is blank.
pub fn read_list(source: &dyn ConfigSource, name: &str) -> Option<Vec<String>> {
    let items = source
        .var(name)?
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();
    (!items.is_empty()).then_some(items)
}

#[derive(Debug, Clone)]
pub struct DebateSettings {
    pub default_system: String,
    pub max_tokens: u32,
    /// Upper bound on one backend call made by the core; `None` waits indefinitely.
    pub backend_timeout: Option<Duration>,
    pub http_timeout: Duration,
}

impl Default for DebateSettings {
    fn default() -> Self {
        Self {
            default_system: DEFAULT_SYSTEM_PROMPT.to_owned(),
            max_tokens: 256,
            backend_timeout: Some(Duration::from_secs(90)),
            http_timeout: Duration::from_secs(60),
        }
    }
}

impl DebateSettings {
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let defaults = Self::default();
        let max_tokens = source
            .var("DEFAULT_MAX_TOKENS")
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_tokens);
        let backend_timeout = match read_u64(source, "DEBATE_BACKEND_TIMEOUT_SECS", 90) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let http_timeout =
            Duration::from_secs(read_u64(source, "DEBATE_HTTP_TIMEOUT_SECS", 60).max(1));

        Self {
            default_system: source
                .var("DEBATE_SYSTEM_PROMPT")
                .unwrap_or(defaults.default_system),
            max_tokens,
            backend_timeout,
            http_timeout,
        }
    }

    pub fn from_env() -> Self {
        Self::from_source(&ProcessEnv)
    }
}
