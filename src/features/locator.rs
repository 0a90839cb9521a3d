//! Multi-strategy element finder for the chat page.
//!
//! Strategies run in priority order; a strategy that matches nothing usable
//! falls through to the next one. Every set ends in a generic last-resort
//! strategy so markup drift degrades instead of breaking.

use std::fmt;

use tracing::{debug, warn};

use crate::core::error::ChatError;
use crate::scraping::dom::{DomDriver, DomError, ElementSnapshot};

const LAST_RESORT_INPUT: &str = "textarea, [contenteditable='true'], [contenteditable='']";
const LAST_RESORT_SEND: &str = "button, [role='button'], input[type='submit']";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementRole {
    Input,
    Send,
    Response,
}

impl ElementRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementRole::Input => "input",
            ElementRole::Send => "send",
            ElementRole::Response => "response",
        }
    }

    /// Input and send controls must also accept interaction.
    pub fn needs_interaction(&self) -> bool {
        matches!(self, ElementRole::Input | ElementRole::Send)
    }
}

impl fmt::Display for ElementRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Css(String),
    /// Role-specific generic query, always last.
    LastResort,
}

/// Ordered locator strategies for one role. Static after construction.
#[derive(Debug, Clone)]
pub struct SelectorSet {
    role: ElementRole,
    strategies: Vec<Strategy>,
}

impl SelectorSet {
    pub fn new(role: ElementRole, selectors: &[String]) -> Self {
        let mut strategies: Vec<Strategy> = selectors
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| Strategy::Css(s.to_string()))
            .collect();
        strategies.push(Strategy::LastResort);
        Self { role, strategies }
    }

    pub fn role(&self) -> ElementRole {
        self.role
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// The CSS selectors only, without the last resort.
    pub fn css(&self) -> impl Iterator<Item = &str> {
        self.strategies.iter().filter_map(|s| match s {
            Strategy::Css(sel) => Some(sel.as_str()),
            Strategy::LastResort => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocatedElement {
    pub element: ElementSnapshot,
    /// Index into [`SelectorSet::strategies`] that produced the match.
    pub strategy: usize,
}

/// Whether an element qualifies for a role: visible, and interactive for input/send.
pub fn is_usable(role: ElementRole, el: &ElementSnapshot) -> bool {
    if !el.visible || el.rect.is_empty() {
        return false;
    }
    !role.needs_interaction() || el.enabled
}

/// A send control candidate sits right of the input's midline, roughly on its row.
pub fn is_right_of(anchor: &ElementSnapshot, el: &ElementSnapshot) -> bool {
    if el.fingerprint == anchor.fingerprint {
        return false;
    }
    let a = &anchor.rect;
    let band = a.height.max(60.0);
    el.rect.left >= a.left + a.width / 2.0 && (el.rect.center_y() - a.center_y()).abs() <= band
}

pub struct Locator<'a, D: DomDriver + ?Sized> {
    dom: &'a D,
}

impl<'a, D: DomDriver + ?Sized> Locator<'a, D> {
    pub fn new(dom: &'a D) -> Self {
        Self { dom }
    }

    /// First usable element of the set, or `None` when every strategy is exhausted.
    ///
    /// `anchor` is the located input; the send last resort needs it to look
    /// to the right of the text box.
    pub async fn locate(
        &self,
        set: &SelectorSet,
        anchor: Option<&ElementSnapshot>,
    ) -> Result<Option<LocatedElement>, DomError> {
        let role = set.role();
        for (idx, strategy) in set.strategies().iter().enumerate() {
            let found = match strategy {
                Strategy::Css(selector) => match self.dom.select_all(selector).await {
                    Ok(elements) => elements.into_iter().find(|el| is_usable(role, el)),
                    Err(DomError::Script(e)) => {
                        warn!("locator[{}]: selector {:?} rejected: {}", role, selector, e);
                        None
                    }
                    Err(e) => return Err(e),
                },
                Strategy::LastResort => self.last_resort(role, anchor).await?,
            };

            if let Some(element) = found {
                debug!(
                    "locator[{}]: strategy #{} matched {}",
                    role, idx, element.fingerprint
                );
                return Ok(Some(LocatedElement {
                    element,
                    strategy: idx,
                }));
            }
        }
        debug!("locator[{}]: all strategies exhausted", role);
        Ok(None)
    }

    /// Like [`Locator::locate`] but a miss becomes `ElementNotFound`.
    pub async fn require(
        &self,
        set: &SelectorSet,
        anchor: Option<&ElementSnapshot>,
    ) -> Result<LocatedElement, ChatError> {
        self.locate(set, anchor)
            .await?
            .ok_or(ChatError::ElementNotFound { role: set.role() })
    }

    async fn last_resort(
        &self,
        role: ElementRole,
        anchor: Option<&ElementSnapshot>,
    ) -> Result<Option<ElementSnapshot>, DomError> {
        match role {
            ElementRole::Input => Ok(self
                .dom
                .select_all(LAST_RESORT_INPUT)
                .await?
                .into_iter()
                .find(|el| is_usable(role, el))),
            ElementRole::Send => {
                let Some(anchor) = anchor else {
                    return Ok(None);
                };
                let right_edge = anchor.rect.right();
                let best = self
                    .dom
                    .select_all(LAST_RESORT_SEND)
                    .await?
                    .into_iter()
                    .filter(|el| is_usable(role, el) && is_right_of(anchor, el))
                    .min_by(|a, b| {
                        let da = (a.rect.left - right_edge).abs();
                        let db = (b.rect.left - right_edge).abs();
                        da.total_cmp(&db)
                    });
                Ok(best)
            }
            ElementRole::Response => Ok(self
                .dom
                .select_text_bearing()
                .await?
                .into_iter()
                .find(|el| is_usable(role, el) && !el.text.trim().is_empty())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraping::dom::Rect;

    fn el(fp: &str, left: f64, top: f64, width: f64, height: f64) -> ElementSnapshot {
        ElementSnapshot {
            fingerprint: fp.to_string(),
            visible: true,
            enabled: true,
            rect: Rect {
                left,
                top,
                width,
                height,
            },
            ..Default::default()
        }
    }

    #[test]
    fn selector_set_always_ends_in_last_resort() {
        let set = SelectorSet::new(ElementRole::Input, &["textarea".into(), "  ".into()]);
        assert_eq!(
            set.strategies(),
            &[Strategy::Css("textarea".into()), Strategy::LastResort]
        );
        assert_eq!(set.css().collect::<Vec<_>>(), vec!["textarea"]);
    }

    #[test]
    fn disabled_controls_are_not_usable_but_responses_are() {
        let mut e = el("pc-1", 0.0, 0.0, 10.0, 10.0);
        e.enabled = false;
        assert!(!is_usable(ElementRole::Send, &e));
        assert!(!is_usable(ElementRole::Input, &e));
        assert!(is_usable(ElementRole::Response, &e));
    }

    #[test]
    fn zero_size_elements_are_invisible() {
        let e = el("pc-1", 0.0, 0.0, 0.0, 20.0);
        assert!(!is_usable(ElementRole::Response, &e));
    }

    #[test]
    fn right_of_requires_same_row() {
        let input = el("in", 100.0, 500.0, 600.0, 40.0);
        assert!(is_right_of(&input, &el("send", 660.0, 505.0, 30.0, 30.0)));
        assert!(is_right_of(&input, &el("send", 720.0, 500.0, 40.0, 40.0)));
        // left half of the box
        assert!(!is_right_of(&input, &el("attach", 110.0, 505.0, 30.0, 30.0)));
        // header button far above
        assert!(!is_right_of(&input, &el("menu", 900.0, 10.0, 30.0, 30.0)));
        assert!(!is_right_of(&input, &input));
    }
}
