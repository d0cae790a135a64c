use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One chronological entry of a conversation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Result of one backend (or one model of a group) for a round.
///
/// `content` is empty whenever `error` is set.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendResponse {
    pub backend_id: String,
    pub content: String,
    pub error: Option<String>,
}

impl BackendResponse {
    pub fn success(backend_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            content: content.into(),
            error: None,
        }
    }

    pub fn failure(backend_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            content: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Incremental event emitted by one stream producer.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StreamEvent {
    Delta { backend_id: String, delta: String },
    Done { backend_id: String, done: bool },
    Error { backend_id: String, error: String },
}

impl StreamEvent {
    pub fn delta(backend_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::Delta {
            backend_id: backend_id.into(),
            delta: delta.into(),
        }
    }

    pub fn done(backend_id: impl Into<String>) -> Self {
        Self::Done {
            backend_id: backend_id.into(),
            done: true,
        }
    }

    pub fn error(backend_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Error {
            backend_id: backend_id.into(),
            error: error.into(),
        }
    }

    pub fn backend_id(&self) -> &str {
        match self {
            Self::Delta { backend_id, .. }
            | Self::Done { backend_id, .. }
            | Self::Error { backend_id, .. } => backend_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// Caller-supplied allow-list of backend ids. Empty or absent selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelSelection(Option<BTreeSet<String>>);

impl ModelSelection {
    pub fn all() -> Self {
        Self(None)
    }

    pub fn from_ids(ids: Option<Vec<String>>) -> Self {
        let ids = ids
            .unwrap_or_default()
            .into_iter()
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty())
            .collect::<BTreeSet<_>>();
        if ids.is_empty() {
            Self(None)
        } else {
            Self(Some(ids))
        }
    }

    pub fn allows(&self, backend_id: &str) -> bool {
        match &self.0 {
            Some(ids) => ids.contains(backend_id),
            None => true,
        }
    }

    /// Sorted, de-duplicated ids; empty when everything is selected.
    pub fn canonical_ids(&self) -> Vec<&str> {
        self.0
            .iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebateRequest {
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub model_ids: Option<Vec<String>>,
    #[serde(default)]
    pub system: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct NormalizedDebate {
    pub conversation: Vec<Turn>,
    pub system: Option<String>,
    pub selection: ModelSelection,
}

impl DebateRequest {
    pub fn into_normalized(self) -> Result<NormalizedDebate, String> {
        if self.messages.is_empty() {
            return Err("messages array required".to_owned());
        }

        let conversation = self
            .messages
            .into_iter()
            .map(|message| Turn::new(message.role, message.content))
            .collect();

        Ok(NormalizedDebate {
            conversation,
            system: self.system.filter(|system| !system.trim().is_empty()),
            selection: ModelSelection::from_ids(self.model_ids),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DebateResponse {
    pub responses: Vec<BackendResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub ok: bool,
    pub service: &'static str,
}
