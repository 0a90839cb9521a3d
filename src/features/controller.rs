//! One request/response turn, end to end.
//!
//! `ChatSession` owns the conversation log and the detector. A turn appends
//! the user message, finds and verifiably clears the input, types the
//! marker-augmented prompt, submits it, waits for the detector and records
//! the answer (or an error entry). Whole turns are retried with exponential
//! backoff when the failure is transient.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tracing::{debug, info, warn};

use crate::core::config::{AppConfig, DetectionSettings};
use crate::core::error::ChatError;
use crate::core::types::ChatTurn;
use crate::features::conversation::{Conversation, HistoryStore};
use crate::features::detector::{TurnCompletionDetector, TurnMarker};
use crate::features::locator::{ElementRole, LocatedElement, Locator, SelectorSet};
use crate::scraping::dom::{ClearTechnique, DomDriver, ElementSnapshot};

const LOCATE_POLL: Duration = Duration::from_millis(250);

/// Re-runs the SSO login when the session was dropped mid-run.
#[async_trait]
pub trait Reauthenticator: Send + Sync {
    async fn reauthenticate(&self, dom: &dyn DomDriver) -> Result<(), ChatError>;
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_message_length: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// How long the input may take to appear.
    pub implicit_wait: Duration,
    pub detection: DetectionSettings,
    pub assistant_url: String,
    /// Landing on this host means the portal logged us out.
    pub login_host: Option<String>,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_message_length: config.max_message_length,
            max_retries: config.timeouts.max_retries.max(1),
            retry_delay: config.timeouts.retry_delay,
            implicit_wait: config.timeouts.implicit_wait,
            detection: config.detection.clone(),
            assistant_url: config.assistant_url().to_string(),
            login_host: config.login_host(),
        }
    }
}

/// Cut `message` to `max_chars` characters. The flag tells whether it was cut.
pub fn truncate_message(message: &str, max_chars: usize) -> (String, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (message[..byte_idx].to_string(), true),
        None => (message.to_string(), false),
    }
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Poll the locator until it finds the role or `timeout` passes.
pub async fn wait_for_element<D: DomDriver + ?Sized>(
    dom: &D,
    set: &SelectorSet,
    anchor: Option<&ElementSnapshot>,
    timeout: Duration,
) -> Result<LocatedElement, ChatError> {
    let locator = Locator::new(dom);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return locator.require(set, anchor).await;
        }
        if let Some(found) = locator.locate(set, anchor).await? {
            return Ok(found);
        }
        tokio::time::sleep(LOCATE_POLL).await;
    }
}

pub struct ChatSession<D: DomDriver> {
    dom: Arc<D>,
    input: SelectorSet,
    send: SelectorSet,
    detector: TurnCompletionDetector,
    conversation: Conversation,
    store: Option<HistoryStore>,
    reauth: Option<Arc<dyn Reauthenticator>>,
    settings: SessionSettings,
    turns_sent: u32,
}

impl<D: DomDriver> ChatSession<D> {
    pub fn new(
        dom: Arc<D>,
        input: SelectorSet,
        send: SelectorSet,
        detector: TurnCompletionDetector,
        settings: SessionSettings,
        conversation: Conversation,
    ) -> Self {
        Self {
            dom,
            input,
            send,
            detector,
            conversation,
            store: None,
            reauth: None,
            settings,
            turns_sent: 0,
        }
    }

    pub fn from_config(dom: Arc<D>, config: &AppConfig, conversation: Conversation) -> Self {
        Self::new(
            dom,
            SelectorSet::new(ElementRole::Input, &config.selectors.input),
            SelectorSet::new(ElementRole::Send, &config.selectors.send),
            TurnCompletionDetector::from_config(config),
            SessionSettings::from_config(config),
            conversation,
        )
    }

    pub fn with_store(mut self, store: HistoryStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_reauthenticator(mut self, reauth: Arc<dyn Reauthenticator>) -> Self {
        self.reauth = Some(reauth);
        self
    }

    pub fn dom(&self) -> &Arc<D> {
        &self.dom
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn history(&self) -> &[ChatTurn] {
        self.conversation.turns()
    }

    pub fn detector(&self) -> &TurnCompletionDetector {
        &self.detector
    }

    /// Drop all turns of the current conversation and persist.
    pub fn clear_conversation(&mut self) {
        self.conversation.clear();
        self.persist();
        info!("🧹 conversation {} cleared", self.conversation.id());
    }

    /// Persist the conversation. Failures are logged, never fatal to a turn.
    pub fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.conversation) {
                warn!("history not saved: {}", e);
            }
        }
    }

    /// Send one message and return the cleaned answer.
    pub async fn send_message(&mut self, message: &str) -> Result<String, ChatError> {
        let (text, truncated) = truncate_message(message, self.settings.max_message_length);
        if truncated {
            warn!(
                "message exceeds {} characters, truncated",
                self.settings.max_message_length
            );
        }

        self.conversation.append_user(text.as_str());
        self.persist();
        self.turns_sent += 1;

        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.settings.retry_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_secs(3600))
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 1;
        loop {
            match self.attempt_turn(&text).await {
                Ok(answer) => {
                    self.conversation.append_assistant(answer.as_str());
                    self.persist();
                    return Ok(answer);
                }
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    let wait = backoff.next_backoff().unwrap_or(self.settings.retry_delay);
                    warn!(
                        "⚠️ attempt {}/{} failed: {} (retrying in {:?})",
                        attempt, self.settings.max_retries, e, wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_turn_failure() {
                        self.conversation.append_error(&e);
                        self.persist();
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn attempt_turn(&mut self, text: &str) -> Result<String, ChatError> {
        self.ensure_logged_in().await?;

        let dom = Arc::clone(&self.dom);
        let input = wait_for_element(dom.as_ref(), &self.input, None, self.settings.implicit_wait).await?;
        let input_fp = input.element.fingerprint.clone();
        debug!("input located via strategy #{}", input.strategy);

        self.clear_input(&input_fp).await?;

        let marker = self
            .settings
            .detection
            .use_marker
            .then(|| TurnMarker::render(&self.settings.detection, self.turns_sent));
        let outgoing = match &marker {
            Some(m) => m.augment(text),
            None => text.to_string(),
        };

        let baseline = self.detector.capture_baseline(dom.as_ref()).await;
        debug!("baseline holds {} existing texts", baseline.len());

        dom.type_text(&input_fp, &outgoing).await?;
        self.submit(&input.element).await?;

        self.detector.begin_turn(marker, text, baseline);
        let resolution = self.detector.wait_for_completion(dom.as_ref()).await?;
        Ok(resolution.text)
    }

    /// Bounce through the authenticator when the page sits on the login host.
    async fn ensure_logged_in(&self) -> Result<(), ChatError> {
        let Some(login_host) = self.settings.login_host.as_deref() else {
            return Ok(());
        };
        let current = self.dom.current_url().await?;
        if host_of(&current).as_deref() != Some(login_host) {
            return Ok(());
        }

        warn!("🔒 session dropped (now at {}), logging in again", current);
        let reauth = self
            .reauth
            .as_ref()
            .ok_or_else(|| ChatError::Auth("session expired and no authenticator is set".into()))?;
        reauth.reauthenticate(self.dom.as_ref()).await?;
        self.dom.navigate(&self.settings.assistant_url).await?;
        info!("🔓 back on {}", self.settings.assistant_url);
        Ok(())
    }

    /// Empty the input, checking after every technique.
    async fn clear_input(&self, fingerprint: &str) -> Result<(), ChatError> {
        for technique in ClearTechnique::ALL {
            self.dom.clear(fingerprint, technique).await?;
            let left = self.dom.value_of(fingerprint).await?;
            if left.trim().is_empty() {
                return Ok(());
            }
            debug!(
                "clear via {:?} left {} chars behind",
                technique,
                left.chars().count()
            );
        }
        Err(ChatError::Transient("input could not be cleared".into()))
    }

    /// Click the send control, or press Enter in the input when there is none.
    async fn submit(&self, input: &ElementSnapshot) -> Result<(), ChatError> {
        let locator = Locator::new(self.dom.as_ref());
        match locator.locate(&self.send, Some(input)).await? {
            Some(send) => {
                if let Err(e) = self.dom.click(&send.element.fingerprint).await {
                    warn!("send click failed ({}), pressing Enter instead", e);
                    self.dom.press_enter(&input.fingerprint).await?;
                }
            }
            None => {
                debug!("no send control, pressing Enter");
                self.dom.press_enter(&input.fingerprint).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_message("你好世界", 2), ("你好".to_string(), true));
        assert_eq!(truncate_message("abc", 3), ("abc".to_string(), false));
        assert_eq!(truncate_message("", 0), (String::new(), false));
    }

    #[test]
    fn host_comparison_ignores_case_and_path() {
        assert_eq!(
            host_of("https://SSO.buaa.edu.cn/login?service=x").as_deref(),
            Some("sso.buaa.edu.cn")
        );
        assert!(host_of("not a url").is_none());
    }
}
