use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::{Duration, Instant},
};

use redis::AsyncCommands;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    config::{read_u64, ConfigSource, ProcessEnv},
    models::{BackendResponse, ModelSelection, Turn},
};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: StdMutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: StdMutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        Self {
            ttl: Duration::from_secs(read_u64(source, "DEFAULT_CACHE_TTL_SEC", 300)),
        }
    }

    pub fn from_env() -> Self {
        Self::from_source(&ProcessEnv)
    }
}

/// SHA-256 over the canonical JSON form of a round request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(
        system: &str,
        conversation: &[Turn],
        selection: &ModelSelection,
    ) -> Option<Self> {
        let messages = conversation
            .iter()
            .map(|turn| json!({"role": turn.role.as_str(), "content": turn.content}))
            .collect::<Vec<_>>();
        Self::from_value(&json!({
            "system": system,
            "messages": messages,
            "selected_models": selection.canonical_ids(),
        }))
    }

    /// Object keys serialize sorted, so key order in `value` never changes the key.
    pub fn from_value(value: &Value) -> Option<Self> {
        let canonical = match serde_json::to_string(value) {
            Ok(canonical) => canonical,
            Err(error) => {
                warn!(error = %error, "request is not canonicalizable, skipping cache");
                return None;
            }
        };
        let digest = Sha256::digest(canonical.as_bytes());
        Some(Self(to_hex(digest.as_ref())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub created_at: Instant,
    pub responses: Vec<BackendResponse>,
}

/// Memoizes whole round results for a bounded time.
///
/// Expiry is checked on lookup; stale entries are removed then and there. Values are copied in
/// and out, so callers can never alter what is stored.
pub struct ResponseCache {
    backend: CacheBackend,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

enum CacheBackend {
    Memory(Mutex<HashMap<CacheKey, CacheEntry>>),
    Redis {
        client: redis::Client,
        prefix: String,
    },
}

impl ResponseCache {
    pub fn memory(config: CacheConfig) -> Self {
        Self::memory_with_clock(config, Arc::new(SystemClock))
    }

    pub fn memory_with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend: CacheBackend::Memory(Mutex::new(HashMap::new())),
            config,
            clock,
        }
    }

    /// Redis when `REDIS_URL` is set and valid, memory otherwise.
    pub fn from_source(config: CacheConfig, source: &dyn ConfigSource) -> Self {
        let Some(url) = source.var("REDIS_URL") else {
            return Self::memory(config);
        };

        match redis::Client::open(url) {
            Ok(client) => {
                let prefix = source
                    .var("DEBATE_REDIS_PREFIX")
                    .unwrap_or_else(|| "debate".to_owned());
                Self {
                    backend: CacheBackend::Redis { client, prefix },
                    config,
                    clock: Arc::new(SystemClock),
                }
            }
            Err(error) => {
                warn!(error = %error, "invalid REDIS_URL, falling back to in-memory cache");
                Self::memory(config)
            }
        }
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    pub async fn lookup(&self, key: &CacheKey) -> Option<Vec<BackendResponse>> {
        match &self.backend {
            CacheBackend::Memory(store) => {
                let mut guard = store.lock().await;
                let entry = guard.get(key)?;
                let age = self.clock.now().saturating_duration_since(entry.created_at);
                if age < self.config.ttl {
                    return Some(entry.responses.clone());
                }
                guard.remove(key);
                debug!(key = %key.as_str(), age_ms = age.as_millis() as u64, "evicted stale cache entry");
                None
            }
            CacheBackend::Redis { client, prefix } => {
                let mut connection = match client.get_multiplexed_async_connection().await {
                    Ok(connection) => connection,
                    Err(error) => {
                        warn!(error = %error, "failed to get redis connection for cache lookup");
                        return None;
                    }
                };
                let redis_key = format!("{prefix}:cache:debate:{}", key.as_str());
                let payload = match connection.get::<_, Option<String>>(&redis_key).await {
                    Ok(payload) => payload?,
                    Err(error) => {
                        warn!(error = %error, "redis get failed for cache");
                        return None;
                    }
                };
                match serde_json::from_str::<Vec<BackendResponse>>(&payload) {
                    Ok(responses) => Some(responses),
                    Err(error) => {
                        warn!(error = %error, "failed to decode cached responses");
                        None
                    }
                }
            }
        }
    }

    /// Overwrites any entry under `key`. Failures are logged, never returned.
    pub async fn store(&self, key: &CacheKey, responses: &[BackendResponse]) {
        match &self.backend {
            CacheBackend::Memory(store) => {
                let entry = CacheEntry {
                    created_at: self.clock.now(),
                    responses: responses.to_vec(),
                };
                store.lock().await.insert(key.clone(), entry);
            }
            CacheBackend::Redis { client, prefix } => {
                let mut connection = match client.get_multiplexed_async_connection().await {
                    Ok(connection) => connection,
                    Err(error) => {
                        warn!(error = %error, "failed to get redis connection for cache store");
                        return;
                    }
                };

                let payload = match serde_json::to_string(responses) {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(error = %error, "failed to serialize responses for cache");
                        return;
                    }
                };

                let redis_key = format!("{prefix}:cache:debate:{}", key.as_str());
                let ttl_secs = self.config.ttl.as_secs().max(1);
                if let Err(error) = connection
                    .set_ex::<_, _, ()>(&redis_key, payload, ttl_secs)
                    .await
                {
                    warn!(error = %error, "redis set failed for cache");
                }
            }
        }
    }
}
