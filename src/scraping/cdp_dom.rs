//! [`DomDriver`] over a live `chromiumoxide` page.
//!
//! Elements are addressed by a `data-pc-fp` attribute stamped on first sight,
//! so a snapshot taken in one evaluation can be acted on in the next one.
//! Same-origin iframes are searched after the top document.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::Page;
use serde_json::Value;
use tracing::debug;

use super::dom::{ClearTechnique, DomDriver, DomError, ElementSnapshot};

const PRELUDE: &str = r#"
const __pcDescribe = (el) => {
  if (!el || !el.dataset) return null;
  if (!el.dataset.pcFp) {
    window.__pcSeq = (window.__pcSeq || 0) + 1;
    el.dataset.pcFp = 'pc-' + window.__pcSeq;
  }
  const view = (el.ownerDocument && el.ownerDocument.defaultView) || window;
  const style = view.getComputedStyle(el);
  const r = el.getBoundingClientRect();
  const visible = r.width > 0 && r.height > 0
    && style.display !== 'none' && style.visibility !== 'hidden';
  const enabled = !el.disabled && !el.readOnly
    && el.getAttribute('aria-disabled') !== 'true';
  const field = el.tagName === 'TEXTAREA' || el.tagName === 'INPUT';
  return {
    fingerprint: el.dataset.pcFp,
    dom_id: el.id || null,
    tag: el.tagName.toLowerCase(),
    text: field ? (el.value || '') : (el.innerText || el.textContent || ''),
    visible: visible,
    enabled: enabled,
    rect: { left: r.left, top: r.top, width: r.width, height: r.height },
  };
};
const __pcFrames = (doc, out) => {
  for (const f of doc.querySelectorAll('iframe,frame')) {
    try {
      const d = f.contentDocument;
      if (d) { out.push(d); __pcFrames(d, out); }
    } catch (e) { /* cross-origin */ }
  }
  return out;
};
const __pcFind = (fp) => {
  const sel = '[data-pc-fp="' + fp + '"]';
  const el = document.querySelector(sel);
  if (el) return el;
  for (const d of __pcFrames(document, [])) {
    const hit = d.querySelector(sel);
    if (hit) return hit;
  }
  return null;
};
const __pcIsField = (el) => el.tagName === 'TEXTAREA' || el.tagName === 'INPUT';
"#;

const SELECT_ALL: &str = r#"
let nodes;
try { nodes = document.querySelectorAll(__ARG__); } catch (e) { return { error: String(e) }; }
const out = [];
for (const el of nodes) { const d = __pcDescribe(el); if (d) out.push(d); }
return out;
"#;

const SELECT_IN_FRAMES: &str = r#"
const out = [];
for (const doc of __pcFrames(document, [])) {
  let nodes;
  try { nodes = doc.querySelectorAll(__ARG__); } catch (e) { return { error: String(e) }; }
  for (const el of nodes) { const d = __pcDescribe(el); if (d) out.push(d); }
}
return out;
"#;

const SELECT_TEXT_BEARING: &str = r#"
const pat = /(content|response|answer|reply|message|markdown|assistant)/i;
const nested = '[class*="content"],[class*="answer"],[class*="message"],[class*="reply"],[class*="markdown"]';
const out = [];
const all = document.body ? document.body.querySelectorAll('*') : [];
for (const el of all) {
  if (__pcIsField(el)) continue;
  const marks = (typeof el.className === 'string' ? el.className : '') + ' ' + (el.id || '');
  if (!pat.test(marks)) continue;
  if (!(el.innerText || '').trim()) continue;
  if (el.querySelector(nested)) continue;
  const d = __pcDescribe(el);
  if (d) out.push(d);
  if (out.length >= 200) break;
}
return out;
"#;

const BY_ID: &str = r#"
const el = document.getElementById(__ARG__);
return el ? __pcDescribe(el) : null;
"#;

const VALUE_OF: &str = r#"
const el = __pcFind(__ARG__);
if (!el) return { stale: true };
return { value: __pcIsField(el) ? (el.value || '') : (el.innerText || '') };
"#;

const CLEAR_ASSIGN: &str = r#"
const el = __pcFind(__ARG__);
if (!el) return { stale: true };
el.focus();
if (__pcIsField(el)) { el.value = ''; } else { el.textContent = ''; }
el.dispatchEvent(new Event('input', { bubbles: true }));
return { ok: true };
"#;

const CLEAR_SELECT_DELETE: &str = r#"
const el = __pcFind(__ARG__);
if (!el) return { stale: true };
const doc = el.ownerDocument;
el.focus();
if (typeof el.select === 'function') {
  el.select();
} else {
  const range = doc.createRange();
  range.selectNodeContents(el);
  const sel = doc.defaultView.getSelection();
  sel.removeAllRanges();
  sel.addRange(range);
}
doc.execCommand('delete');
return { ok: true };
"#;

const CLEAR_NATIVE_SETTER: &str = r#"
const el = __pcFind(__ARG__);
if (!el) return { stale: true };
const view = el.ownerDocument.defaultView;
if (__pcIsField(el)) {
  const proto = el.tagName === 'TEXTAREA'
    ? view.HTMLTextAreaElement.prototype
    : view.HTMLInputElement.prototype;
  Object.getOwnPropertyDescriptor(proto, 'value').set.call(el, '');
} else {
  el.innerHTML = '';
}
el.dispatchEvent(new Event('input', { bubbles: true }));
el.dispatchEvent(new Event('change', { bubbles: true }));
return { ok: true };
"#;

const FOCUS: &str = r#"
const el = __pcFind(__ARG__);
if (!el) return { stale: true };
el.scrollIntoView({ block: 'center' });
el.focus();
return { ok: true };
"#;

const CLICK: &str = r#"
const el = __pcFind(__ARG__);
if (!el) return { stale: true };
el.scrollIntoView({ block: 'center' });
el.click();
return { ok: true };
"#;

const PRESS_ENTER: &str = r#"
const el = __pcFind(__ARG__);
if (!el) return { stale: true };
el.focus();
for (const type of ['keydown', 'keypress', 'keyup']) {
  el.dispatchEvent(new KeyboardEvent(type, {
    key: 'Enter', code: 'Enter', keyCode: 13, which: 13, bubbles: true, cancelable: true,
  }));
}
return { ok: true };
"#;

/// Live document handle. Cheap to clone; clones share the same tab.
#[derive(Clone)]
pub struct CdpDom {
    page: Page,
}

impl CdpDom {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    fn script(body: &str, arg: &str) -> String {
        let arg = serde_json::to_string(arg).unwrap_or_else(|_| "\"\"".to_string());
        format!("(() => {{\n{}\n{}\n}})()", PRELUDE, body.replace("__ARG__", &arg))
    }

    async fn eval(&self, body: &str, arg: &str) -> Result<Value, DomError> {
        let js = Self::script(body, arg);
        let result = self
            .page
            .evaluate(js)
            .await
            .map_err(|e| DomError::Transport(e.to_string()))?;
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    async fn eval_list(&self, body: &str, arg: &str) -> Result<Vec<ElementSnapshot>, DomError> {
        let value = self.eval(body, arg).await?;
        if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
            return Err(DomError::Script(format!("{} ({})", err, arg)));
        }
        if value.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(value).map_err(|e| DomError::Script(e.to_string()))
    }

    /// Run an element action script; `{stale: true}` means the node is gone.
    async fn act(&self, body: &str, fingerprint: &str) -> Result<Value, DomError> {
        let value = self.eval(body, fingerprint).await?;
        if value.get("stale").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Err(DomError::Stale(fingerprint.to_string()));
        }
        Ok(value)
    }

    fn css_for(fingerprint: &str) -> String {
        format!("[data-pc-fp=\"{}\"]", fingerprint)
    }
}

#[async_trait]
impl DomDriver for CdpDom {
    async fn select_all(&self, selector: &str) -> Result<Vec<ElementSnapshot>, DomError> {
        self.eval_list(SELECT_ALL, selector).await
    }

    async fn select_in_frames(&self, selector: &str) -> Result<Vec<ElementSnapshot>, DomError> {
        self.eval_list(SELECT_IN_FRAMES, selector).await
    }

    async fn select_text_bearing(&self) -> Result<Vec<ElementSnapshot>, DomError> {
        self.eval_list(SELECT_TEXT_BEARING, "").await
    }

    async fn element_by_id(&self, id: &str) -> Result<Option<ElementSnapshot>, DomError> {
        let value = self.eval(BY_ID, id).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| DomError::Script(e.to_string()))
    }

    async fn value_of(&self, fingerprint: &str) -> Result<String, DomError> {
        let value = self.act(VALUE_OF, fingerprint).await?;
        Ok(value
            .get("value")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    async fn clear(&self, fingerprint: &str, technique: ClearTechnique) -> Result<(), DomError> {
        let body = match technique {
            ClearTechnique::Assign => CLEAR_ASSIGN,
            ClearTechnique::SelectAllDelete => CLEAR_SELECT_DELETE,
            ClearTechnique::NativeSetter => CLEAR_NATIVE_SETTER,
        };
        self.act(body, fingerprint).await.map(|_| ())
    }

    async fn type_text(&self, fingerprint: &str, text: &str) -> Result<(), DomError> {
        self.act(FOCUS, fingerprint).await?;
        // insertText commits like an IME, so CJK text needs no key definitions.
        self.page
            .execute(InsertTextParams::new(text))
            .await
            .map_err(|e| DomError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn click(&self, fingerprint: &str) -> Result<(), DomError> {
        match self.page.find_element(Self::css_for(fingerprint)).await {
            Ok(el) => {
                el.click()
                    .await
                    .map_err(|e| DomError::Transport(e.to_string()))?;
                Ok(())
            }
            Err(e) => {
                // Not in the top document (iframe) or not hit-testable.
                debug!("native click unavailable for {}: {}", fingerprint, e);
                self.act(CLICK, fingerprint).await.map(|_| ())
            }
        }
    }

    async fn press_enter(&self, fingerprint: &str) -> Result<(), DomError> {
        match self.page.find_element(Self::css_for(fingerprint)).await {
            Ok(el) => {
                el.press_key("Enter")
                    .await
                    .map_err(|e| DomError::Transport(e.to_string()))?;
                Ok(())
            }
            Err(e) => {
                debug!("native key press unavailable for {}: {}", fingerprint, e);
                self.act(PRESS_ENTER, fingerprint).await.map(|_| ())
            }
        }
    }

    async fn current_url(&self) -> Result<String, DomError> {
        self.page
            .url()
            .await
            .map(|u| u.unwrap_or_default())
            .map_err(|e| DomError::Transport(e.to_string()))
    }

    async fn navigate(&self, url: &str) -> Result<(), DomError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| DomError::Transport(e.to_string()))?;
        Ok(())
    }
}
