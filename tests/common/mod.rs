//! Scripted in-memory document for driving the locator, detector and
//! controller without a browser.
//!
//! Element text follows a script keyed by (submit number, time since that
//! submit). Pressing Enter in an input or clicking a send element counts as a
//! submit. Time is `tokio::time`, so `start_paused` tests are exact.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use portal_chat::dom::{ClearTechnique, DomDriver, DomError, ElementSnapshot, Rect};

pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[derive(Debug, Clone)]
pub struct FakeElement {
    fp: String,
    dom_id: Option<String>,
    tag: String,
    selectors: Vec<String>,
    initial: String,
    /// (submit number, offset after that submit, text)
    script: Vec<(u32, Duration, String)>,
    echo_prompt: bool,
    visible: bool,
    visible_from: Option<Duration>,
    enabled: bool,
    rect: Rect,
    in_frame: bool,
    text_bearing: bool,
    is_field: bool,
    submits: bool,
    click_fails: bool,
}

pub fn el(fp: &str) -> FakeElement {
    FakeElement {
        fp: fp.to_string(),
        dom_id: None,
        tag: "div".to_string(),
        selectors: Vec::new(),
        initial: String::new(),
        script: Vec::new(),
        echo_prompt: false,
        visible: true,
        visible_from: None,
        enabled: true,
        rect: Rect {
            left: 100.0,
            top: 100.0,
            width: 500.0,
            height: 40.0,
        },
        in_frame: false,
        text_bearing: false,
        is_field: false,
        submits: false,
        click_fails: false,
    }
}

/// A `textarea` answering to `selectors`.
pub fn input(fp: &str, selectors: &[&str]) -> FakeElement {
    el(fp)
        .tag("textarea")
        .matches(selectors)
        .matches(&["textarea"])
        .field()
        .rect(100.0, 800.0, 600.0, 40.0)
}

/// A `button` that submits on click.
pub fn send_button(fp: &str, selectors: &[&str]) -> FakeElement {
    el(fp)
        .tag("button")
        .matches(selectors)
        .matches(&["button"])
        .submits()
        .rect(660.0, 805.0, 30.0, 30.0)
}

impl FakeElement {
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    pub fn id(mut self, id: &str) -> Self {
        self.dom_id = Some(id.to_string());
        self
    }

    pub fn matches(mut self, selectors: &[&str]) -> Self {
        self.selectors.extend(selectors.iter().map(|s| s.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.initial = text.to_string();
        self
    }

    /// Text shown from `after` past the `submit`-th submit on.
    pub fn at(mut self, submit: u32, after: Duration, text: &str) -> Self {
        self.script.push((submit, after, text.to_string()));
        self.script.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        self
    }

    /// Shows the last submitted prompt, like a user bubble.
    pub fn echo(mut self) -> Self {
        self.echo_prompt = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn visible_from(mut self, t: Duration) -> Self {
        self.visible_from = Some(t);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn rect(mut self, left: f64, top: f64, width: f64, height: f64) -> Self {
        self.rect = Rect {
            left,
            top,
            width,
            height,
        };
        self
    }

    pub fn in_frame(mut self) -> Self {
        self.in_frame = true;
        self
    }

    pub fn text_bearing(mut self) -> Self {
        self.text_bearing = true;
        self
    }

    pub fn field(mut self) -> Self {
        self.is_field = true;
        self
    }

    pub fn submits(mut self) -> Self {
        self.submits = true;
        self
    }

    pub fn click_fails(mut self) -> Self {
        self.click_fails = true;
        self
    }

    fn answers_to(&self, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .any(|part| self.selectors.iter().any(|s| s == part))
    }
}

#[derive(Debug, Default)]
struct State {
    elements: Vec<FakeElement>,
    values: HashMap<String, String>,
    url: String,
    submits: Vec<(Instant, String)>,
    typed: Vec<String>,
    clicks: Vec<String>,
    enters: Vec<String>,
    clears: Vec<ClearTechnique>,
    ignored_clears: usize,
    navigations: Vec<String>,
    redirect_on_navigate: Option<(String, String)>,
}

pub struct FakeDom {
    created: Instant,
    state: Mutex<State>,
}

impl FakeDom {
    pub fn new(url: &str, elements: Vec<FakeElement>) -> Self {
        let values = elements
            .iter()
            .filter(|e| e.is_field)
            .map(|e| (e.fp.clone(), e.initial.clone()))
            .collect();
        Self {
            created: Instant::now(),
            state: Mutex::new(State {
                elements,
                values,
                url: url.to_string(),
                ..State::default()
            }),
        }
    }

    /// The first `n` clear calls leave the value in place.
    pub fn ignore_first_clears(&self, n: usize) {
        self.state.lock().unwrap().ignored_clears = n;
    }

    /// Navigating to `from` lands on `to` instead.
    pub fn redirect(&self, from: &str, to: &str) {
        self.state.lock().unwrap().redirect_on_navigate = Some((from.to_string(), to.to_string()));
    }

    pub fn set_url(&self, url: &str) {
        self.state.lock().unwrap().url = url.to_string();
    }

    pub fn set_value(&self, fp: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .values
            .insert(fp.to_string(), value.to_string());
    }

    /// Submit `prompt` directly, as if the controller had sent it.
    pub fn submit_now(&self, prompt: &str) {
        self.state
            .lock()
            .unwrap()
            .submits
            .push((Instant::now(), prompt.to_string()));
    }

    pub fn submits(&self) -> Vec<String> {
        self.state.lock().unwrap().submits.iter().map(|s| s.1.clone()).collect()
    }

    pub fn typed(&self) -> Vec<String> {
        self.state.lock().unwrap().typed.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().unwrap().clicks.clone()
    }

    pub fn enters(&self) -> Vec<String> {
        self.state.lock().unwrap().enters.clone()
    }

    pub fn clears(&self) -> Vec<ClearTechnique> {
        self.state.lock().unwrap().clears.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }

    fn text_of(&self, state: &State, e: &FakeElement) -> String {
        if e.is_field {
            return state.values.get(&e.fp).cloned().unwrap_or_default();
        }
        let current = state.submits.len() as u32;
        if e.echo_prompt {
            return state.submits.last().map(|s| s.1.clone()).unwrap_or_default();
        }
        let since = state
            .submits
            .last()
            .map(|s| s.0.elapsed())
            .unwrap_or_default();
        e.script
            .iter()
            .filter(|(n, after, _)| *n < current || (*n == current && *after <= since))
            .last()
            .map(|(_, _, t)| t.clone())
            .unwrap_or_else(|| e.initial.clone())
    }

    fn snapshot(&self, state: &State, e: &FakeElement) -> ElementSnapshot {
        let shown = e.visible && e.visible_from.map_or(true, |t| self.created.elapsed() >= t);
        ElementSnapshot {
            fingerprint: e.fp.clone(),
            dom_id: e.dom_id.clone(),
            tag: e.tag.clone(),
            text: self.text_of(state, e),
            visible: shown && !e.rect.is_empty(),
            enabled: e.enabled,
            rect: e.rect,
        }
    }

    fn query(&self, selector: &str, in_frame: bool) -> Result<Vec<ElementSnapshot>, DomError> {
        if selector.starts_with("!!") {
            return Err(DomError::Script(format!("SyntaxError: '{}' is not a valid selector", selector)));
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .elements
            .iter()
            .filter(|e| e.in_frame == in_frame && e.answers_to(selector))
            .map(|e| self.snapshot(&state, e))
            .collect())
    }

    fn find(&self, state: &State, fp: &str) -> Result<FakeElement, DomError> {
        state
            .elements
            .iter()
            .find(|e| e.fp == fp)
            .cloned()
            .ok_or_else(|| DomError::Stale(fp.to_string()))
    }

    fn submit_from(&self, state: &mut State) {
        let prompt = state
            .elements
            .iter()
            .filter(|e| e.is_field)
            .filter_map(|e| state.values.get(&e.fp))
            .find(|v| !v.is_empty())
            .cloned()
            .unwrap_or_default();
        // The page empties its input once a message is sent.
        for value in state.values.values_mut() {
            value.clear();
        }
        state.submits.push((Instant::now(), prompt));
    }
}

#[async_trait]
impl DomDriver for FakeDom {
    async fn select_all(&self, selector: &str) -> Result<Vec<ElementSnapshot>, DomError> {
        self.query(selector, false)
    }

    async fn select_in_frames(&self, selector: &str) -> Result<Vec<ElementSnapshot>, DomError> {
        self.query(selector, true)
    }

    async fn select_text_bearing(&self) -> Result<Vec<ElementSnapshot>, DomError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .elements
            .iter()
            .filter(|e| e.text_bearing && !e.in_frame)
            .map(|e| self.snapshot(&state, e))
            .filter(|s| !s.text.trim().is_empty())
            .collect())
    }

    async fn element_by_id(&self, id: &str) -> Result<Option<ElementSnapshot>, DomError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .elements
            .iter()
            .find(|e| !e.in_frame && e.dom_id.as_deref() == Some(id))
            .map(|e| self.snapshot(&state, e)))
    }

    async fn value_of(&self, fingerprint: &str) -> Result<String, DomError> {
        let state = self.state.lock().unwrap();
        let e = self.find(&state, fingerprint)?;
        Ok(self.text_of(&state, &e))
    }

    async fn clear(&self, fingerprint: &str, technique: ClearTechnique) -> Result<(), DomError> {
        let mut state = self.state.lock().unwrap();
        self.find(&state, fingerprint)?;
        state.clears.push(technique);
        if state.ignored_clears > 0 {
            state.ignored_clears -= 1;
            return Ok(());
        }
        state.values.insert(fingerprint.to_string(), String::new());
        Ok(())
    }

    async fn type_text(&self, fingerprint: &str, text: &str) -> Result<(), DomError> {
        let mut state = self.state.lock().unwrap();
        self.find(&state, fingerprint)?;
        state.typed.push(text.to_string());
        let value = state.values.entry(fingerprint.to_string()).or_default();
        value.push_str(text);
        Ok(())
    }

    async fn click(&self, fingerprint: &str) -> Result<(), DomError> {
        let mut state = self.state.lock().unwrap();
        let e = self.find(&state, fingerprint)?;
        if e.click_fails {
            return Err(DomError::Transport("click intercepted".into()));
        }
        state.clicks.push(fingerprint.to_string());
        if e.submits {
            self.submit_from(&mut state);
        }
        Ok(())
    }

    async fn press_enter(&self, fingerprint: &str) -> Result<(), DomError> {
        let mut state = self.state.lock().unwrap();
        let e = self.find(&state, fingerprint)?;
        state.enters.push(fingerprint.to_string());
        if e.is_field {
            self.submit_from(&mut state);
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DomError> {
        Ok(self.state.lock().unwrap().url.clone())
    }

    async fn navigate(&self, url: &str) -> Result<(), DomError> {
        let mut state = self.state.lock().unwrap();
        state.navigations.push(url.to_string());
        let landed = match &state.redirect_on_navigate {
            Some((from, to)) if from == url => to.clone(),
            _ => url.to_string(),
        };
        state.url = landed;
        Ok(())
    }
}
