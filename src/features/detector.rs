//! Turn-completion detection.
//!
//! After a prompt is submitted the page renders the answer incrementally and
//! without any "done" signal. The detector polls the document, tracks the best
//! candidate text for the current turn and resolves the turn when either
//!
//! * a candidate contains the per-turn end marker the prompt asked for, or
//! * the candidate length stops changing for `stable_polls` consecutive polls.
//!
//! A hard ceiling fails the turn. [`TurnCompletionDetector::observe`] is the
//! pure state machine; [`TurnCompletionDetector::wait_for_completion`] drives
//! it against a [`DomDriver`].

use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::core::config::{AppConfig, DetectionSettings};
use crate::core::error::ChatError;
use crate::features::locator::{ElementRole, SelectorSet};
use crate::scraping::dom::{DomDriver, DomError, ElementSnapshot};

// ── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub poll_interval: Duration,
    /// Consecutive polls with unchanged length that complete a turn.
    pub stable_polls: u32,
    /// Hard ceiling per turn.
    pub ceiling: Duration,
}

impl DetectorSettings {
    pub fn new(detection: &DetectionSettings, wait_for_answer: Duration) -> Self {
        Self {
            poll_interval: detection.poll_interval,
            stable_polls: detection.stable_polls.max(1),
            ceiling: wait_for_answer,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            stable_polls: 6,
            ceiling: Duration::from_secs(60),
        }
    }
}

// ── Marker ──────────────────────────────────────────────────────────────────

/// End-of-turn sentinel plus the sentence appended to the prompt asking for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnMarker {
    pub token: String,
    pub instruction: String,
}

impl TurnMarker {
    /// `turn` is 1-based.
    pub fn render(detection: &DetectionSettings, turn: u32) -> Self {
        let token = detection.marker_template.replace("{n}", &turn.to_string());
        let instruction = detection.marker_instruction.replace("{marker}", &token);
        Self { token, instruction }
    }

    pub fn augment(&self, message: &str) -> String {
        format!("{} {}", message, self.instruction)
    }
}

/// Cut `text` at the first occurrence of `marker`. No-op when absent.
pub fn strip_marker(text: &str, marker: &str) -> String {
    if marker.is_empty() {
        return text.to_string();
    }
    match text.find(marker) {
        Some(pos) => text[..pos].to_string(),
        None => text.to_string(),
    }
}

/// Final answer text: marker and everything after it removed, trimmed.
pub fn finalize(text: &str, marker: Option<&str>) -> String {
    match marker {
        Some(m) => strip_marker(text, m).trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Predict the ids of the next messages from the last answer container id.
///
/// `pattern` splits the id into a prefix group and a numeric group; the
/// next user message and the next answer usually take the following two
/// numbers. Zero padding is kept.
pub fn next_container_ids(hint: &str, pattern: &Regex) -> Vec<String> {
    let Some(caps) = pattern.captures(hint) else {
        return Vec::new();
    };
    let (Some(prefix), Some(digits)) = (caps.get(1), caps.get(2)) else {
        return Vec::new();
    };
    let digits = digits.as_str();
    let Ok(n) = digits.parse::<u64>() else {
        return Vec::new();
    };
    let width = digits.len();
    (1..=2)
        .filter_map(|step| n.checked_add(step))
        .map(|next| format!("{}{:0width$}", prefix.as_str(), next, width = width))
        .collect()
}

// ── Turn state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Streaming,
    Resolved,
    Failed,
}

/// Best known answer text at one poll. Lives only for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct DomProbeResult {
    pub candidate_text: String,
    pub element_fingerprint: String,
    /// Time since the turn started.
    pub observed_at: Duration,
    dom_id: Option<String>,
    len: usize,
}

impl DomProbeResult {
    fn from_element(el: &ElementSnapshot, observed_at: Duration) -> Self {
        Self {
            candidate_text: el.text.clone(),
            element_fingerprint: el.fingerprint.clone(),
            observed_at,
            dom_id: el.dom_id.clone(),
            len: el.text.chars().count(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    Marker,
    Stable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Marker-stripped, trimmed.
    pub text: String,
    pub signal: CompletionSignal,
    pub element_fingerprint: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Pending,
    Resolved(Resolution),
    /// Completion fired but nothing was left after cleanup.
    Empty,
    TimedOut,
}

#[derive(Debug, Default)]
struct TurnState {
    marker: Option<TurnMarker>,
    message: String,
    baseline: HashSet<String>,
    best: Option<DomProbeResult>,
    stable_count: u32,
    last_len: Option<usize>,
    polls: u32,
}

// ── Detector ────────────────────────────────────────────────────────────────

pub struct TurnCompletionDetector {
    settings: DetectorSettings,
    response: SelectorSet,
    fallback: Vec<String>,
    id_pattern: Regex,
    phase: TurnPhase,
    turn: TurnState,
    /// Last resolved container id. A hint only; every prediction is revalidated.
    container_hint: Option<String>,
}

impl TurnCompletionDetector {
    pub fn new(
        settings: DetectorSettings,
        response: SelectorSet,
        fallback: Vec<String>,
        id_pattern: Regex,
    ) -> Self {
        Self {
            settings,
            response,
            fallback,
            id_pattern,
            phase: TurnPhase::Idle,
            turn: TurnState::default(),
            container_hint: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            DetectorSettings::new(&config.detection, config.timeouts.wait_for_answer),
            SelectorSet::new(ElementRole::Response, &config.selectors.response),
            config.selectors.fallback_response.clone(),
            config.selectors.message_id_pattern.clone(),
        )
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn best(&self) -> Option<&DomProbeResult> {
        self.turn.best.as_ref()
    }

    pub fn container_hint(&self) -> Option<&str> {
        self.container_hint.as_deref()
    }

    pub fn set_container_hint(&mut self, hint: Option<String>) {
        self.container_hint = hint;
    }

    /// Idle → Streaming. Drops every piece of per-turn state.
    ///
    /// `baseline` holds texts already on the page before submission; they are
    /// never accepted as this turn's answer.
    pub fn begin_turn(&mut self, marker: Option<TurnMarker>, message: &str, baseline: HashSet<String>) {
        self.turn = TurnState {
            marker,
            message: message.trim().to_string(),
            baseline,
            ..TurnState::default()
        };
        self.phase = TurnPhase::Streaming;
    }

    /// Whether an element may be this turn's answer.
    fn is_fresh(&self, el: &ElementSnapshot) -> bool {
        if !el.visible {
            return false;
        }
        let text = el.text.trim();
        if text.is_empty() || self.turn.baseline.contains(text) {
            return false;
        }
        // Our own prompt bubble.
        if !self.turn.message.is_empty() && text == self.turn.message {
            return false;
        }
        match &self.turn.marker {
            Some(m) => !text.contains(m.instruction.trim()),
            None => true,
        }
    }

    /// Feed one poll's candidates into the state machine.
    ///
    /// Resolution is checked before the ceiling so a poll landing exactly on
    /// the ceiling can still complete the turn.
    pub fn observe(&mut self, elapsed: Duration, candidates: &[ElementSnapshot]) -> PollOutcome {
        match self.phase {
            TurnPhase::Streaming => {}
            TurnPhase::Idle => return PollOutcome::Pending,
            TurnPhase::Resolved | TurnPhase::Failed => {
                warn!("detector: observe after turn end ({:?})", self.phase);
                return PollOutcome::Pending;
            }
        }
        self.turn.polls += 1;

        let fresh: Vec<&ElementSnapshot> = candidates.iter().filter(|el| self.is_fresh(el)).collect();

        // (a) explicit marker
        let marker_hit = self.turn.marker.as_ref().and_then(|m| {
            fresh
                .iter()
                .filter(|el| el.text.contains(&m.token))
                .max_by_key(|el| el.text.chars().count())
                .copied()
        });

        // Monotonic: only a strictly longer text replaces the current best.
        if let Some(longest) = fresh.iter().max_by_key(|el| el.text.chars().count()) {
            let len = longest.text.chars().count();
            if self.turn.best.as_ref().map_or(true, |b| len > b.len) {
                self.turn.best = Some(DomProbeResult::from_element(longest, elapsed));
            }
        }

        if let Some(el) = marker_hit {
            let token = self.turn.marker.as_ref().map(|m| m.token.as_str());
            let text = finalize(&el.text, token);
            if let Some(id) = el.dom_id.clone() {
                self.container_hint = Some(id);
            }
            return self.complete(text, CompletionSignal::Marker, el.fingerprint.clone(), elapsed);
        }

        // (b) stability
        if let Some(best) = &self.turn.best {
            if self.turn.last_len == Some(best.len) {
                self.turn.stable_count += 1;
            } else {
                self.turn.stable_count = 1;
                self.turn.last_len = Some(best.len);
            }
            if self.turn.stable_count >= self.settings.stable_polls {
                let token = self.turn.marker.as_ref().map(|m| m.token.as_str());
                let text = finalize(&best.candidate_text, token);
                let fingerprint = best.element_fingerprint.clone();
                if let Some(id) = best.dom_id.clone() {
                    self.container_hint = Some(id);
                }
                return self.complete(text, CompletionSignal::Stable, fingerprint, elapsed);
            }
        }

        if elapsed >= self.settings.ceiling {
            self.phase = TurnPhase::Failed;
            return PollOutcome::TimedOut;
        }
        PollOutcome::Pending
    }

    fn complete(
        &mut self,
        text: String,
        signal: CompletionSignal,
        element_fingerprint: String,
        elapsed: Duration,
    ) -> PollOutcome {
        if text.is_empty() {
            self.phase = TurnPhase::Failed;
            return PollOutcome::Empty;
        }
        self.phase = TurnPhase::Resolved;
        PollOutcome::Resolved(Resolution {
            text,
            signal,
            element_fingerprint,
            elapsed,
        })
    }

    // ── DOM side ────────────────────────────────────────────────────────────

    async fn query<D: DomDriver + ?Sized>(
        dom: &D,
        selector: &str,
        in_frames: bool,
    ) -> Result<Vec<ElementSnapshot>, DomError> {
        let result = if in_frames {
            dom.select_in_frames(selector).await
        } else {
            dom.select_all(selector).await
        };
        match result {
            Err(DomError::Script(e)) => {
                debug!("detector: selector {:?} skipped: {}", selector, e);
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn predicted<D: DomDriver + ?Sized>(&self, dom: &D) -> Result<Vec<ElementSnapshot>, DomError> {
        let mut out = Vec::new();
        let Some(hint) = self.container_hint.as_deref() else {
            return Ok(out);
        };
        for id in next_container_ids(hint, &self.id_pattern) {
            if let Some(el) = dom.element_by_id(&id).await? {
                out.push(el);
            }
        }
        Ok(out)
    }

    /// One poll: walk the extraction ladder and stop at the first level that
    /// yields a fresh candidate.
    ///
    /// 1. predicted next containers + primary response selectors
    /// 2. broad fallback selectors
    /// 3. generic text-bearing elements
    /// 4. same-origin iframes
    pub async fn probe<D: DomDriver + ?Sized>(&self, dom: &D) -> Result<Vec<ElementSnapshot>, DomError> {
        let mut level = self.predicted(dom).await?;
        for sel in self.response.css() {
            level.extend(Self::query(dom, sel, false).await?);
        }
        if level.iter().any(|el| self.is_fresh(el)) {
            return Ok(level);
        }

        let mut level = Vec::new();
        for sel in &self.fallback {
            level.extend(Self::query(dom, sel, false).await?);
        }
        if level.iter().any(|el| self.is_fresh(el)) {
            return Ok(level);
        }

        let level = dom.select_text_bearing().await?;
        if level.iter().any(|el| self.is_fresh(el)) {
            return Ok(level);
        }

        let mut level = Vec::new();
        for sel in self.response.css().chain(self.fallback.iter().map(String::as_str)) {
            level.extend(Self::query(dom, sel, true).await?);
        }
        Ok(level)
    }

    /// Texts visible anywhere on the ladder before the prompt is sent.
    pub async fn capture_baseline<D: DomDriver + ?Sized>(&self, dom: &D) -> HashSet<String> {
        let mut found: Vec<ElementSnapshot> = Vec::new();
        match self.predicted(dom).await {
            Ok(v) => found.extend(v),
            Err(e) => debug!("detector: baseline prediction failed: {}", e),
        }
        let selectors: Vec<&str> = self
            .response
            .css()
            .chain(self.fallback.iter().map(String::as_str))
            .collect();
        for in_frames in [false, true] {
            for sel in &selectors {
                match Self::query(dom, sel, in_frames).await {
                    Ok(v) => found.extend(v),
                    Err(e) => debug!("detector: baseline query {:?} failed: {}", sel, e),
                }
            }
        }
        match dom.select_text_bearing().await {
            Ok(v) => found.extend(v),
            Err(e) => debug!("detector: baseline scan failed: {}", e),
        }
        found
            .into_iter()
            .map(|el| el.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Poll until the current turn resolves or fails.
    ///
    /// Stale nodes and script errors count as an empty poll; transport errors
    /// end the wait as a transient failure.
    pub async fn wait_for_completion<D: DomDriver + ?Sized>(&mut self, dom: &D) -> Result<Resolution, ChatError> {
        if self.phase != TurnPhase::Streaming {
            return Err(ChatError::Transient(format!("no turn in progress ({:?})", self.phase)));
        }
        let started = tokio::time::Instant::now();
        loop {
            let candidates = match self.probe(dom).await {
                Ok(c) => c,
                Err(DomError::Transport(e)) => {
                    self.phase = TurnPhase::Failed;
                    return Err(ChatError::Transient(e));
                }
                Err(e) => {
                    debug!("detector: empty poll: {}", e);
                    Vec::new()
                }
            };

            match self.observe(started.elapsed(), &candidates) {
                PollOutcome::Pending => {
                    if let Some(best) = &self.turn.best {
                        debug!(
                            "detector: poll #{} best={} chars stable={}",
                            self.turn.polls, best.len, self.turn.stable_count
                        );
                    }
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                PollOutcome::Resolved(r) => {
                    info!(
                        "✅ answer complete via {:?} after {:.1}s ({} chars)",
                        r.signal,
                        r.elapsed.as_secs_f64(),
                        r.text.chars().count()
                    );
                    return Ok(r);
                }
                PollOutcome::Empty => return Err(ChatError::NoResponseFound),
                PollOutcome::TimedOut => {
                    warn!("⏱️ no complete answer within {:?}", self.settings.ceiling);
                    return Err(ChatError::ResponseTimeout(self.settings.ceiling));
                }
            }
        }
    }
}
