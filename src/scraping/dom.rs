//! The document seam.
//!
//! Locator, detector and controller only talk to a [`DomDriver`]. The live
//! implementation is [`super::cdp_dom::CdpDom`]; tests drive the same code
//! with a scripted in-memory document.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomError {
    /// The element behind a fingerprint is gone (re-render, navigation).
    #[error("stale element: {0}")]
    Stale(String),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("browser transport error: {0}")]
    Transport(String),
}

/// Rendered bounds in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn center_y(&self) -> f64 {
        self.top + self.height / 2.0
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// One element as seen by a single query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    /// Stable handle for follow-up actions on the same node.
    pub fingerprint: String,
    /// DOM `id` attribute, when the page sets one.
    #[serde(default)]
    pub dom_id: Option<String>,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub text: String,
    /// Non-zero bounds and not hidden by `display`/`visibility`.
    pub visible: bool,
    /// Not disabled, not read-only.
    pub enabled: bool,
    #[serde(default)]
    pub rect: Rect,
}

/// Ways to empty an input. Some rendered inputs ignore the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTechnique {
    /// Set `value`/`textContent` to empty and fire `input`.
    Assign,
    /// Focus, select all, delete.
    SelectAllDelete,
    /// Native value setter bypassing framework wrappers, then `input` + `change`.
    NativeSetter,
}

impl ClearTechnique {
    pub const ALL: [ClearTechnique; 3] = [
        ClearTechnique::Assign,
        ClearTechnique::SelectAllDelete,
        ClearTechnique::NativeSetter,
    ];
}

#[async_trait]
pub trait DomDriver: Send + Sync {
    /// Elements of the top document matching a CSS selector, document order.
    async fn select_all(&self, selector: &str) -> Result<Vec<ElementSnapshot>, DomError>;

    /// Same as [`DomDriver::select_all`] but inside same-origin iframes, recursively.
    async fn select_in_frames(&self, selector: &str) -> Result<Vec<ElementSnapshot>, DomError>;

    /// Leaf-ish elements with text whose class or id looks like content/response markup.
    async fn select_text_bearing(&self) -> Result<Vec<ElementSnapshot>, DomError>;

    async fn element_by_id(&self, id: &str) -> Result<Option<ElementSnapshot>, DomError>;

    /// Current value of an input (or text of a contenteditable).
    async fn value_of(&self, fingerprint: &str) -> Result<String, DomError>;

    async fn clear(&self, fingerprint: &str, technique: ClearTechnique) -> Result<(), DomError>;

    async fn type_text(&self, fingerprint: &str, text: &str) -> Result<(), DomError>;

    async fn click(&self, fingerprint: &str) -> Result<(), DomError>;

    /// Keyboard "confirm" on the element.
    async fn press_enter(&self, fingerprint: &str) -> Result<(), DomError>;

    async fn current_url(&self) -> Result<String, DomError>;

    async fn navigate(&self, url: &str) -> Result<(), DomError>;
}
