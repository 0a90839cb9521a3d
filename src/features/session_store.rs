//! Credentials and the cookie state shared by the HTTP client and the browser.
//!
//! Cookies acquired by either side are recorded in a [`CookieLedger`]; the
//! most recent writer is authoritative and the other side is brought up to
//! date before its next network operation. Successful logins are also saved to
//! `~/.portal-chat/sessions/{domain_key}.json` so a later run can start from
//! the stored cookies.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::error::ChatError;

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cookies
// ─────────────────────────────────────────────────────────────────────────────

/// Wire shape shared with CDP `Network.Cookie` / `CookieParam` (camelCase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Unix seconds; `-1` or absent for session cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
}

impl StoredCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            http_only: None,
            secure: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// `Set-Cookie` style line for a cookie jar.
    pub fn to_set_cookie(&self) -> String {
        let mut line = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            line.push_str(&format!("; Domain={}", domain.trim_start_matches('.')));
        }
        line.push_str(&format!("; Path={}", self.path.as_deref().unwrap_or("/")));
        if self.secure.unwrap_or(false) {
            line.push_str("; Secure");
        }
        line
    }

    pub fn is_session_scoped(&self) -> bool {
        self.expires.map(|e| e <= 0.0).unwrap_or(true)
    }
}

/// Which client produced a cookie set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieOrigin {
    Http,
    Browser,
}

/// Last-writer-wins cookie state between the HTTP client and the browser.
///
/// Every `record` bumps the generation. Each side remembers the generation it
/// last received; `pending_for` reports what a side still has to apply.
#[derive(Debug, Default)]
pub struct CookieLedger {
    cookies: Vec<StoredCookie>,
    origin: Option<CookieOrigin>,
    generation: u64,
    http_seen: u64,
    browser_seen: u64,
}

impl CookieLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the authoritative set. The writer is considered up to date.
    pub fn record(&mut self, origin: CookieOrigin, cookies: Vec<StoredCookie>) -> u64 {
        self.generation += 1;
        self.cookies = cookies;
        self.origin = Some(origin);
        *self.seen_mut(origin) = self.generation;
        self.generation
    }

    /// Cookies `target` has not received yet, if any.
    pub fn pending_for(&self, target: CookieOrigin) -> Option<&[StoredCookie]> {
        let seen = match target {
            CookieOrigin::Http => self.http_seen,
            CookieOrigin::Browser => self.browser_seen,
        };
        (seen < self.generation).then_some(self.cookies.as_slice())
    }

    pub fn mark_delivered(&mut self, target: CookieOrigin) {
        *self.seen_mut(target) = self.generation;
    }

    pub fn source(&self) -> Option<CookieOrigin> {
        self.origin
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cookies(&self) -> &[StoredCookie] {
        &self.cookies
    }

    fn seen_mut(&mut self, side: CookieOrigin) -> &mut u64 {
        match side {
            CookieOrigin::Http => &mut self.http_seen,
            CookieOrigin::Browser => &mut self.browser_seen,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Domain keys
// ─────────────────────────────────────────────────────────────────────────────

fn host_to_key(host: &str) -> String {
    host.replace(['.', ':'], "_")
}

/// `https://chat.buaa.edu.cn/page` → `"chat_buaa_edu_cn"`
pub fn domain_key(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(host_to_key))
}

/// Key of the parent domain, `None` for a bare second-level domain.
pub fn parent_domain_key(host: &str) -> Option<String> {
    let dot_pos = host.find('.')?;
    let rest = &host[dot_pos + 1..];
    rest.contains('.').then(|| host_to_key(rest))
}

// ─────────────────────────────────────────────────────────────────────────────
// Expiry
// ─────────────────────────────────────────────────────────────────────────────

/// Earliest persistent expiry, `None` when every cookie is session-scoped.
pub fn min_cookie_expiry(cookies: &[StoredCookie]) -> Option<f64> {
    cookies
        .iter()
        .filter_map(|c| c.expires)
        .filter(|&exp| exp > 0.0)
        .reduce(f64::min)
}

/// [`min_cookie_expiry`], or `saved_at` + 24 h for session-only jars.
/// `None` only for an empty jar.
pub fn effective_session_expiry(cookies: &[StoredCookie], saved_at: f64) -> Option<f64> {
    if cookies.is_empty() {
        return None;
    }
    if let Some(min_exp) = min_cookie_expiry(cookies) {
        return Some(min_exp);
    }
    Some(saved_at + SESSION_ONLY_TTL_SECS)
}

const SESSION_ONLY_TTL_SECS: f64 = 86_400.0;

/// Modification time of `path` in Unix seconds; 0 when unknown.
fn saved_at(path: &Path) -> f64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp() as f64)
        .unwrap_or(0.0)
}

// ─────────────────────────────────────────────────────────────────────────────
// On-disk sessions
// ─────────────────────────────────────────────────────────────────────────────

/// Directory of per-domain cookie files.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.portal-chat/sessions`
    pub fn default_location() -> Option<Self> {
        let home = dirs::home_dir()?;
        Some(Self::at(home.join(".portal-chat").join("sessions")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_by_key(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn session_path(&self, url: &str) -> Option<PathBuf> {
        Some(self.path_by_key(&domain_key(url)?))
    }

    /// Write the cookie set for `url`'s host. Temp file + rename.
    pub fn save(&self, url: &str, cookies: &[StoredCookie]) -> Result<PathBuf, ChatError> {
        let path = self
            .session_path(url)
            .ok_or_else(|| ChatError::Persist(format!("no host in {}", url)))?;
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(cookies)
            .map_err(|e| ChatError::Persist(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        info!(
            "session_store: 💾 saved {} cookies ({})",
            cookies.len(),
            path.display()
        );
        Ok(path)
    }

    fn load_by_key(&self, key: &str) -> Option<Vec<StoredCookie>> {
        let path = self.path_by_key(key);
        let content = std::fs::read_to_string(&path).ok()?;
        let cookies: Vec<StoredCookie> = match serde_json::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "session_store: unreadable session file {}: {}",
                    path.display(),
                    e
                );
                return None;
            }
        };
        let now = chrono::Utc::now().timestamp() as f64;
        match effective_session_expiry(&cookies, saved_at(&path)) {
            None => return None,
            Some(exp) if exp <= now => {
                info!("session_store: ⌛ session for '{}' expired", key);
                return None;
            }
            Some(_) => {}
        }
        info!(
            "session_store: 🍪 loaded {} cookies for '{}'",
            cookies.len(),
            key
        );
        Some(cookies)
    }

    /// Stored cookies for `url`, falling back to the parent domain
    /// (`chat.buaa.edu.cn` → `buaa.edu.cn`).
    pub fn load(&self, url: &str) -> Option<Vec<StoredCookie>> {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))?;
        if let Some(c) = self.load_by_key(&host_to_key(&host)) {
            return Some(c);
        }
        let parent = parent_domain_key(&host)?;
        self.load_by_key(&parent)
    }

    /// Drop the stored session so the next run logs in again.
    pub fn invalidate(&self, url: &str) {
        let Some(path) = self.session_path(url) else {
            return;
        };
        if !path.exists() {
            return;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => info!("session_store: 🗑️  removed stale session {}", path.display()),
            Err(e) => warn!(
                "session_store: failed to remove session file {}: {}",
                path.display(),
                e
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Browser side
// ─────────────────────────────────────────────────────────────────────────────

/// Push cookies into the browser via `Network.setCookies`.
///
/// Cookies that do not convert to a `CookieParam` are skipped. Returns the
/// number applied.
pub async fn inject_into_page(
    page: &chromiumoxide::Page,
    cookies: &[StoredCookie],
    fallback_url: &str,
) -> Result<usize, ChatError> {
    use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetCookiesParams};

    let params: Vec<CookieParam> = cookies
        .iter()
        .filter_map(|c| {
            let mut v = serde_json::to_value(c).ok()?;
            if c.domain.is_none() {
                v["url"] = serde_json::Value::String(fallback_url.to_string());
            }
            if c.is_session_scoped() {
                if let Some(obj) = v.as_object_mut() {
                    obj.remove("expires");
                }
            }
            serde_json::from_value::<CookieParam>(v).ok()
        })
        .collect();

    if params.is_empty() {
        return Ok(0);
    }
    let count = params.len();
    page.execute(SetCookiesParams::new(params))
        .await
        .map_err(|e| ChatError::Transient(format!("setCookies: {}", e)))?;
    info!("session_store: 💉 injected {} cookies into browser", count);
    Ok(count)
}

/// Every cookie the browser currently holds for the page.
pub async fn read_from_page(page: &chromiumoxide::Page) -> Result<Vec<StoredCookie>, ChatError> {
    let raw = page
        .get_cookies()
        .await
        .map_err(|e| ChatError::Transient(format!("getCookies: {}", e)))?;
    Ok(raw
        .into_iter()
        .filter_map(|c| {
            serde_json::to_value(c)
                .ok()
                .and_then(|v| serde_json::from_value::<StoredCookie>(v).ok())
        })
        .collect())
}
