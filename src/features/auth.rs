//! SSO login for the portal.
//!
//! The HTTP path scrapes the CAS-style login form and posts it with a shared
//! cookie jar; the browser path fills the same form inside the live page and
//! leaves a human time to solve a captcha when the window is visible. Cookies
//! won by either side go through the [`CookieLedger`] so the other side is
//! updated before its next request.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::core::config::AppConfig;
use crate::core::error::ChatError;
use crate::features::controller::Reauthenticator;
use crate::features::session_store::{
    self, CookieLedger, CookieOrigin, Credentials, SessionStore, StoredCookie,
};
use crate::scraping::dom::{DomDriver, ElementSnapshot};

const CAPTCHA_GRACE: Duration = Duration::from_secs(15);
const LEAVE_LOGIN_TIMEOUT: Duration = Duration::from_secs(15);
const FORM_WAIT: Duration = Duration::from_secs(10);
const STEP: Duration = Duration::from_millis(500);

/// Hidden fields of the SSO form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginForm {
    pub execution: String,
    pub csrf: Option<String>,
    pub captcha_visible: bool,
}

/// Pull `execution`, `_csrf` and the captcha state out of the login page.
pub fn parse_login_form(html: &str) -> Option<LoginForm> {
    let doc = Html::parse_document(html);
    let value_of = |css: &str| -> Option<String> {
        let sel = Selector::parse(css).ok()?;
        doc.select(&sel)
            .next()
            .and_then(|el| el.value().attr("value"))
            .map(|v| v.to_string())
    };
    let execution = value_of("input[name='execution']").filter(|v| !v.is_empty())?;
    let csrf = value_of("input[name='_csrf']");

    let captcha_visible = Selector::parse("#captchaParent")
        .ok()
        .and_then(|sel| doc.select(&sel).next().map(|el| el.value().attr("style").unwrap_or("").to_string()))
        .map(|style| {
            let compact: String = style.chars().filter(|c| !c.is_whitespace()).collect();
            !compact.to_ascii_lowercase().contains("display:none")
        })
        .unwrap_or(false);

    Some(LoginForm {
        execution,
        csrf,
        captcha_visible,
    })
}

/// Reason for a rejected login, recognised from the returned page text.
pub fn classify_failure(page_text: &str) -> Option<&'static str> {
    if page_text.contains("认证信息无效") || page_text.contains("Invalid credentials") {
        Some("invalid username or password")
    } else if page_text.contains("验证码错误") {
        Some("captcha rejected")
    } else {
        None
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// `a=1; b=2` from a jar lookup, as cookies scoped to `host`.
fn parse_cookie_header(header: &str, host: &str) -> Vec<StoredCookie> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (!name.is_empty()).then(|| StoredCookie::new(name, value).with_domain(host))
        })
        .collect()
}

pub struct Authenticator {
    credentials: Credentials,
    login_url: String,
    redirect_url: String,
    login_host: Option<String>,
    headless: bool,
    jar: Arc<Jar>,
    http: reqwest::Client,
    /// Same jar, redirects disabled.
    probe: reqwest::Client,
    ledger: Mutex<CookieLedger>,
    sessions: Option<SessionStore>,
}

impl Authenticator {
    pub fn new(config: &AppConfig, user_agent: &str) -> Result<Self, ChatError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
        for (name, value) in &config.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.insert(n, v);
                }
                _ => warn!("ignoring invalid header {}", name),
            }
        }

        let jar = Arc::new(Jar::default());
        let build = |redirect: reqwest::redirect::Policy| {
            reqwest::Client::builder()
                .cookie_provider(Arc::clone(&jar))
                .default_headers(headers.clone())
                .user_agent(user_agent)
                .timeout(config.timeouts.request)
                .redirect(redirect)
                .build()
                .map_err(|e| ChatError::Config(format!("http client: {}", e)))
        };
        let http = build(reqwest::redirect::Policy::limited(10))?;
        let probe = build(reqwest::redirect::Policy::none())?;

        Ok(Self {
            credentials: config.credentials.clone(),
            login_url: config.login_url.clone(),
            redirect_url: config.redirect_url.clone(),
            login_host: config.login_host(),
            headless: config.browser.headless,
            jar,
            http,
            probe,
            ledger: Mutex::new(CookieLedger::new()),
            sessions: SessionStore::default_location(),
        })
    }

    /// Override where cookies are saved between runs.
    pub fn with_session_store(mut self, store: Option<SessionStore>) -> Self {
        self.sessions = store;
        self
    }

    /// True when `url` is on the SSO host.
    pub fn is_login_location(&self, url: &str) -> bool {
        match (&self.login_host, host_of(url)) {
            (Some(login), Some(host)) => *login == host,
            _ => false,
        }
    }

    // ── HTTP login ──────────────────────────────────────────────────────────

    pub async fn login_with_http(&self) -> Result<(), ChatError> {
        info!("🔑 SSO login over HTTP as {}", self.credentials.username);
        let page = self.http.get(&self.login_url).send().await?.text().await?;
        let form = parse_login_form(&page)
            .ok_or_else(|| ChatError::Auth("login page carries no execution token".into()))?;
        if form.captcha_visible {
            warn!("⚠️ SSO page shows a captcha; the HTTP login will probably be refused");
        }

        let params = [
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
            ("_csrf", form.csrf.as_deref().unwrap_or("")),
            ("execution", form.execution.as_str()),
            ("_eventId", "submit"),
            ("type", "username_password"),
            ("geolocation", ""),
        ];
        let resp = self.http.post(&self.login_url).form(&params).send().await?;
        let landed = resp.url().to_string();
        let body = resp.text().await?;

        if let Some(reason) = classify_failure(&body) {
            return Err(ChatError::Auth(reason.to_string()));
        }
        if self.is_login_location(&landed) && parse_login_form(&body).is_some() {
            return Err(ChatError::Auth("SSO returned the login form again".into()));
        }

        let resp = self.http.get(&self.redirect_url).send().await?;
        if self.is_login_location(resp.url().as_str()) {
            return Err(ChatError::Auth(format!(
                "{} still redirects to SSO",
                self.redirect_url
            )));
        }

        self.record_http_cookies();
        info!("✅ HTTP login succeeded");
        Ok(())
    }

    /// GET without following redirects; any doubt counts as "login required".
    pub async fn is_login_required(&self, url: &str) -> bool {
        let resp = match self.probe.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("login probe for {} failed: {}", url, e);
                return true;
            }
        };
        let status = resp.status();
        if status.is_redirection() {
            let target = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let absolute = Url::parse(url)
                .and_then(|base| base.join(target))
                .map(|u| u.to_string())
                .unwrap_or_else(|_| target.to_string());
            return self.is_login_location(&absolute) || absolute.contains("/login");
        }
        if status.is_success() {
            if self.is_login_location(resp.url().as_str()) {
                return true;
            }
            let body = resp.text().await.unwrap_or_default();
            return body.contains("name=\"execution\"") || body.contains("loginIframe");
        }
        true
    }

    // ── Browser login ───────────────────────────────────────────────────────

    async fn first_visible(dom: &dyn DomDriver, selector: &str) -> Option<ElementSnapshot> {
        let top = dom.select_all(selector).await.unwrap_or_default();
        let framed = dom.select_in_frames(selector).await.unwrap_or_default();
        top.into_iter().chain(framed).find(|el| el.visible)
    }

    async fn find_form(dom: &dyn DomDriver) -> Option<(ElementSnapshot, ElementSnapshot, Option<ElementSnapshot>)> {
        let layouts = [
            ("#unPassword", "#pwPassword", ".submit-btn"),
            (
                "input[name='username']",
                "input[name='password']",
                "[type='submit'], [name='submit']",
            ),
        ];
        for (user, pass, submit) in layouts {
            if let (Some(u), Some(p)) = (
                Self::first_visible(dom, user).await,
                Self::first_visible(dom, pass).await,
            ) {
                return Some((u, p, Self::first_visible(dom, submit).await));
            }
        }
        None
    }

    async fn page_text(dom: &dyn DomDriver) -> String {
        let mut text = String::new();
        for el in dom.select_all("body").await.unwrap_or_default() {
            text.push_str(&el.text);
        }
        for el in dom.select_in_frames("body").await.unwrap_or_default() {
            text.push_str(&el.text);
        }
        text
    }

    pub async fn login_in_browser(&self, dom: &dyn DomDriver) -> Result<(), ChatError> {
        info!("🌐 SSO login in the browser");
        dom.navigate(&self.login_url).await?;

        let deadline = tokio::time::Instant::now() + FORM_WAIT;
        let (user, pass, submit) = loop {
            if let Some(found) = Self::find_form(dom).await {
                break found;
            }
            if !self.is_login_location(&dom.current_url().await?) {
                info!("already signed in, SSO skipped the form");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChatError::Auth("SSO login form not found".into()));
            }
            tokio::time::sleep(STEP).await;
        };

        for (field, value) in [
            (&user, self.credentials.username.as_str()),
            (&pass, self.credentials.password.as_str()),
        ] {
            dom.clear(&field.fingerprint, crate::scraping::dom::ClearTechnique::NativeSetter)
                .await?;
            dom.type_text(&field.fingerprint, value).await?;
        }

        if Self::first_visible(dom, "#captchaParent").await.is_some() {
            if self.headless {
                warn!("⚠️ captcha shown in a headless browser; login will likely fail");
            } else {
                info!("🧩 captcha shown, waiting {:?} for it to be solved", CAPTCHA_GRACE);
                tokio::time::sleep(CAPTCHA_GRACE).await;
            }
        }

        match submit {
            Some(btn) => dom.click(&btn.fingerprint).await?,
            None => dom.press_enter(&pass.fingerprint).await?,
        }

        let deadline = tokio::time::Instant::now() + LEAVE_LOGIN_TIMEOUT;
        loop {
            tokio::time::sleep(STEP).await;
            let url = dom.current_url().await?;
            if !self.is_login_location(&url) {
                info!("✅ browser login succeeded ({})", url);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        let reason = classify_failure(&Self::page_text(dom).await).unwrap_or("still on the SSO page");
        Err(ChatError::Auth(reason.to_string()))
    }

    /// HTTP first, the browser when that fails and a page is available.
    pub async fn login(&self, dom: Option<&dyn DomDriver>) -> Result<(), ChatError> {
        if !self.credentials.is_complete() {
            return Err(ChatError::Auth("username and password are required".into()));
        }
        let http_err = match self.login_with_http().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!("HTTP login failed: {}", http_err);
        let Some(dom) = dom else {
            return Err(http_err);
        };
        self.login_in_browser(dom).await.map_err(|e| {
            ChatError::Auth(format!("http: {}; browser: {}", http_err, e))
        })
    }

    // ── Cookies ─────────────────────────────────────────────────────────────

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, CookieLedger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot the jar for the SSO and portal hosts into the ledger.
    pub fn record_http_cookies(&self) {
        let mut cookies = Vec::new();
        for raw in [&self.login_url, &self.redirect_url] {
            let Ok(url) = Url::parse(raw) else { continue };
            let Some(host) = url.host_str() else { continue };
            if let Some(header) = self.jar.cookies(&url) {
                if let Ok(s) = header.to_str() {
                    for c in parse_cookie_header(s, host) {
                        if !cookies.contains(&c) {
                            cookies.push(c);
                        }
                    }
                }
            }
        }
        let generation = self.lock_ledger().record(CookieOrigin::Http, cookies);
        debug!("cookie ledger: http snapshot, generation {}", generation);
    }

    fn apply_to_jar(&self, cookies: &[StoredCookie]) {
        let fallback = Url::parse(&self.redirect_url).ok();
        for c in cookies {
            let url = c
                .domain
                .as_deref()
                .and_then(|d| Url::parse(&format!("https://{}/", d.trim_start_matches('.'))).ok())
                .or_else(|| fallback.clone());
            if let Some(url) = url {
                self.jar.add_cookie_str(&c.to_set_cookie(), &url);
            }
        }
    }

    /// Bring the jar up to date before an HTTP request.
    pub fn sync_to_http(&self) {
        let pending = self
            .lock_ledger()
            .pending_for(CookieOrigin::Http)
            .map(|c| c.to_vec());
        if let Some(cookies) = pending {
            self.apply_to_jar(&cookies);
            self.lock_ledger().mark_delivered(CookieOrigin::Http);
            debug!("cookie ledger: {} cookies pushed to http", cookies.len());
        }
    }

    /// Bring the browser up to date before it navigates.
    pub async fn sync_to_browser(&self, page: &chromiumoxide::Page) -> Result<(), ChatError> {
        let pending = self
            .lock_ledger()
            .pending_for(CookieOrigin::Browser)
            .map(|c| c.to_vec());
        if let Some(cookies) = pending {
            session_store::inject_into_page(page, &cookies, &self.redirect_url).await?;
            self.lock_ledger().mark_delivered(CookieOrigin::Browser);
        }
        Ok(())
    }

    /// Record the browser's cookies as authoritative and hand them to the jar.
    pub async fn pull_from_browser(&self, page: &chromiumoxide::Page) -> Result<(), ChatError> {
        let cookies = session_store::read_from_page(page).await?;
        let generation = self.lock_ledger().record(CookieOrigin::Browser, cookies);
        debug!("cookie ledger: browser snapshot, generation {}", generation);
        self.sync_to_http();
        Ok(())
    }

    /// Load cookies saved by an earlier run into the jar.
    pub fn restore_saved(&self) -> bool {
        let Some(cookies) = self.sessions.as_ref().and_then(|s| s.load(&self.redirect_url)) else {
            return false;
        };
        self.apply_to_jar(&cookies);
        self.lock_ledger().record(CookieOrigin::Http, cookies);
        true
    }

    pub fn save_session(&self) {
        let Some(store) = &self.sessions else { return };
        let cookies = self.lock_ledger().cookies().to_vec();
        if cookies.is_empty() {
            return;
        }
        if let Err(e) = store.save(&self.redirect_url, &cookies) {
            warn!("session cookies not saved: {}", e);
        }
    }

    pub fn forget_session(&self) {
        if let Some(store) = &self.sessions {
            store.invalidate(&self.redirect_url);
        }
    }
}

/// Re-login for a running chat: HTTP then browser, cookies synced both ways.
pub struct SessionReauth {
    auth: Arc<Authenticator>,
    page: chromiumoxide::Page,
}

impl SessionReauth {
    pub fn new(auth: Arc<Authenticator>, page: chromiumoxide::Page) -> Self {
        Self { auth, page }
    }
}

#[async_trait]
impl Reauthenticator for SessionReauth {
    async fn reauthenticate(&self, dom: &dyn DomDriver) -> Result<(), ChatError> {
        self.auth.forget_session();
        match self.auth.login_with_http().await {
            Ok(()) => self.auth.sync_to_browser(&self.page).await?,
            Err(e) => {
                warn!("HTTP re-login failed ({}), using the browser", e);
                self.auth.login_in_browser(dom).await?;
                self.auth.pull_from_browser(&self.page).await?;
            }
        }
        self.auth.save_session();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_PAGE: &str = r#"
        <html><body>
        <form id="fm1">
          <input type="hidden" name="execution" value="e1s1-token"/>
          <input type="hidden" name="_csrf" value="csrf-abc"/>
          <div id="captchaParent" style="display: none"><img/></div>
        </form>
        </body></html>"#;

    #[test]
    fn parses_hidden_fields() {
        let form = parse_login_form(LOGIN_PAGE).unwrap();
        assert_eq!(form.execution, "e1s1-token");
        assert_eq!(form.csrf.as_deref(), Some("csrf-abc"));
        assert!(!form.captcha_visible);
    }

    #[test]
    fn detects_visible_captcha() {
        let html = LOGIN_PAGE.replace("style=\"display: none\"", "style=\"\"");
        assert!(parse_login_form(&html).unwrap().captcha_visible);
    }

    #[test]
    fn page_without_execution_is_not_a_login_form() {
        assert!(parse_login_form("<html><body>portal</body></html>").is_none());
    }

    #[test]
    fn failure_texts() {
        assert_eq!(
            classify_failure("<span>认证信息无效。</span>"),
            Some("invalid username or password")
        );
        assert_eq!(classify_failure("Invalid credentials."), Some("invalid username or password"));
        assert_eq!(classify_failure("验证码错误"), Some("captcha rejected"));
        assert_eq!(classify_failure("welcome"), None);
    }

    #[test]
    fn cookie_header_split() {
        let cookies = parse_cookie_header("CASTGC=TGT-1; JSESSIONID=abc=def", "sso.buaa.edu.cn");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[1].value, "abc=def");
        assert_eq!(cookies[0].domain.as_deref(), Some("sso.buaa.edu.cn"));
    }
}
