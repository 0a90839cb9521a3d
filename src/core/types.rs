use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message of a conversation. Only `Conversation` creates these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub message_id: String,
    #[serde(default)]
    pub turn_index: u32,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChatTurn {
    pub fn is_error(&self) -> bool {
        self.metadata
            .get("error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Which assistant of the portal a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AssistantVariant {
    #[default]
    Xiaohang,
    Tongyi,
}

impl AssistantVariant {
    pub fn parse_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "xiaohang" => Some(AssistantVariant::Xiaohang),
            "tongyi" => Some(AssistantVariant::Tongyi),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssistantVariant::Xiaohang => "xiaohang",
            AssistantVariant::Tongyi => "tongyi",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Txt,
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Txt => "txt",
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

/// A question/answer pair as exported by the CLI modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaRecord {
    pub question: String,
    pub answer: String,
    pub timestamp: String,
    pub success: bool,
}

impl QaRecord {
    pub fn answered(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            timestamp: now_stamp(),
            success: true,
        }
    }

    pub fn failed(question: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            question: question.into(),
            answer: format!("error: {}", reason),
            timestamp: now_stamp(),
            success: false,
        }
    }
}

fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
