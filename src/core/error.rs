//! Error taxonomy surfaced by the chat session boundary.
//!
//! Locator and detector code returns plain `Option`/`Result<_, DomError>`
//! values; the controller translates those into [`ChatError`] so callers
//! never see raw CDP failures.

use std::time::Duration;

use thiserror::Error;

use crate::features::locator::ElementRole;
use crate::scraping::dom::DomError;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Credentials rejected or the SSO flow could not be completed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No strategy of the role's selector set produced a usable element.
    #[error("element not found: {role}")]
    ElementNotFound { role: ElementRole },

    /// Neither the end marker nor the stability rule fired before the ceiling.
    #[error("no complete response within {0:?}")]
    ResponseTimeout(Duration),

    /// Completion fired but the resolved text was empty.
    #[error("response completed but no text could be extracted")]
    NoResponseFound,

    /// Network hiccup or stale DOM; retried at the turn level.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("history persistence failed: {0}")]
    Persist(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Errors that warrant another attempt of the same turn.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::ElementNotFound { .. } | ChatError::Transient(_)
        )
    }

    /// Failed turns that still get an error-marked assistant entry in history.
    pub fn is_turn_failure(&self) -> bool {
        matches!(
            self,
            ChatError::ResponseTimeout(_)
                | ChatError::NoResponseFound
                | ChatError::ElementNotFound { .. }
                | ChatError::Transient(_)
        )
    }
}

impl From<DomError> for ChatError {
    fn from(e: DomError) -> Self {
        ChatError::Transient(e.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Transient(format!("http: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_locator_and_transient_failures_retry() {
        assert!(ChatError::ElementNotFound {
            role: ElementRole::Send
        }
        .is_retryable());
        assert!(ChatError::Transient("stale node".into()).is_retryable());
        assert!(!ChatError::ResponseTimeout(Duration::from_secs(60)).is_retryable());
        assert!(!ChatError::NoResponseFound.is_retryable());
        assert!(!ChatError::Auth("bad password".into()).is_retryable());
    }

    #[test]
    fn dom_errors_become_transient() {
        let e: ChatError = DomError::Stale("pc-7".into()).into();
        assert!(matches!(e, ChatError::Transient(_)));
    }
}
