//! Conversation log and its keyed JSON store.
//!
//! The history file maps `conversation_id → Conversation`. Saving reads the
//! current document, upserts one entry and rewrites the whole file through a
//! temp file + rename, so a crash never leaves a half-written document behind.
//! Two processes saving at once can still lose each other's update.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::error::ChatError;
use crate::core::types::{ChatTurn, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub title: String,
    messages: Vec<ChatTurn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Survives `clear()` so indices never repeat within a conversation.
    #[serde(default)]
    next_turn_index: u32,
}

impl Conversation {
    pub fn new(conversation_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: Map::new(),
            next_turn_index: 0,
        }
    }

    /// `conv_{unix_millis}` titled with the local start time.
    pub fn start_new() -> Self {
        let now = chrono::Local::now();
        Self::new(
            format!("conv_{}", now.timestamp_millis()),
            format!("Conversation {}", now.format("%Y-%m-%d %H:%M:%S")),
        )
    }

    pub fn id(&self) -> &str {
        &self.conversation_id
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn next_index(&self) -> u32 {
        let after_last = self.messages.last().map_or(0, |t| t.turn_index + 1);
        self.next_turn_index.max(after_last)
    }

    fn push(&mut self, role: Role, content: String, metadata: Map<String, Value>) -> &ChatTurn {
        let now = Utc::now();
        let turn_index = self.next_index();
        self.next_turn_index = turn_index + 1;
        self.updated_at = now;
        self.messages.push(ChatTurn {
            role,
            content,
            message_id: uuid::Uuid::new_v4().to_string(),
            turn_index,
            created_at: now,
            metadata,
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn append_user(&mut self, content: impl Into<String>) -> &ChatTurn {
        self.push(Role::User, content.into(), Map::new())
    }

    pub fn append_assistant(&mut self, content: impl Into<String>) -> &ChatTurn {
        self.push(Role::Assistant, content.into(), Map::new())
    }

    /// Failed turn: keeps the history complete with an `error: …` answer.
    pub fn append_error(&mut self, reason: impl std::fmt::Display) -> &ChatTurn {
        let mut metadata = Map::new();
        metadata.insert("error".to_string(), Value::Bool(true));
        self.push(Role::Assistant, format!("error: {}", reason), metadata)
    }

    pub fn clear(&mut self) {
        self.next_turn_index = self.next_index();
        self.messages.clear();
        self.updated_at = Utc::now();
    }
}

/// Keyed JSON document of conversations.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored conversation. Missing or corrupt file reads as empty.
    pub fn load_all(&self) -> BTreeMap<String, Conversation> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                debug!("history: {} not readable: {}", self.path.display(), e);
                return BTreeMap::new();
            }
        };
        if content.trim().is_empty() {
            return BTreeMap::new();
        }
        match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                warn!(
                    "history: {} is corrupt ({}), starting from an empty document",
                    self.path.display(),
                    e
                );
                BTreeMap::new()
            }
        }
    }

    pub fn load(&self, conversation_id: &str) -> Option<Conversation> {
        self.load_all().remove(conversation_id)
    }

    /// Upsert one conversation and rewrite the document.
    pub fn save(&self, conversation: &Conversation) -> Result<(), ChatError> {
        let mut all = self.load_all();
        all.insert(conversation.conversation_id.clone(), conversation.clone());

        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&all).map_err(|e| ChatError::Persist(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| {
            ChatError::Persist(format!("cannot write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            ChatError::Persist(format!(
                "cannot rename {} → {}: {}",
                tmp.display(),
                self.path.display(),
                e
            ))
        })?;
        debug!(
            "history: saved {} ({} messages)",
            conversation.conversation_id,
            conversation.len()
        );
        Ok(())
    }
}
