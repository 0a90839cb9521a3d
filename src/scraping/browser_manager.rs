//! Native browser management using `chromiumoxide`.
//!
//! This module is the **single source of truth** for:
//! * Finding a usable browser executable (per configured kind, cross-platform).
//! * Launching a browser or attaching to one that is already running.
//! * Tracking who owns the process, so teardown never closes a browser this
//!   process did not start.

use anyhow::{anyhow, Result};
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use std::path::Path;
use tracing::{info, warn};

use crate::core::config::{BrowserKind, BrowserSettings, Timeouts};

// ── User-Agent pool ──────────────────────────────────────────────────────────

const DESKTOP_USER_AGENTS: &[&str] = &[
    // Chrome 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 – macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 – Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Returns a randomly-chosen realistic Chromium-family User-Agent string.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

// ── Browser executable discovery ─────────────────────────────────────────────

fn path_names(kind: BrowserKind) -> &'static [&'static str] {
    match kind {
        BrowserKind::Chrome => &["google-chrome", "google-chrome-stable", "chrome"],
        BrowserKind::Chromium => &["chromium", "chromium-browser"],
        BrowserKind::Brave => &["brave-browser", "brave"],
        BrowserKind::Edge => &["microsoft-edge", "microsoft-edge-stable", "msedge"],
    }
}

fn well_known_paths(kind: BrowserKind) -> Vec<&'static str> {
    #[cfg(target_os = "macos")]
    let paths = match kind {
        BrowserKind::Chrome => vec!["/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"],
        BrowserKind::Chromium => vec!["/Applications/Chromium.app/Contents/MacOS/Chromium"],
        BrowserKind::Brave => vec!["/Applications/Brave Browser.app/Contents/MacOS/Brave Browser"],
        BrowserKind::Edge => vec!["/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"],
    };

    #[cfg(target_os = "linux")]
    let paths = match kind {
        BrowserKind::Chrome => vec!["/usr/bin/google-chrome", "/opt/google/chrome/chrome"],
        BrowserKind::Chromium => vec![
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
        ],
        BrowserKind::Brave => vec!["/usr/bin/brave-browser", "/usr/bin/brave"],
        BrowserKind::Edge => vec!["/usr/bin/microsoft-edge"],
    };

    #[cfg(target_os = "windows")]
    let paths = match kind {
        BrowserKind::Chrome => vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ],
        BrowserKind::Chromium => vec![r"C:\Program Files\Chromium\Application\chrome.exe"],
        BrowserKind::Brave => {
            vec![r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe"]
        }
        BrowserKind::Edge => vec![
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
            r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
        ],
    };

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    let paths = {
        let _ = kind;
        Vec::new()
    };

    paths
}

/// Find a browser executable.
///
/// Resolution order:
/// 1. Explicit executable from config / `CHROME_EXECUTABLE`
/// 2. PATH scan for the configured kind, then every other Chromium kind
/// 3. OS-specific well-known install paths, same preference order
pub fn find_chrome_executable(settings: &BrowserSettings) -> Option<String> {
    if let Some(p) = settings.executable.as_deref() {
        if Path::new(p).exists() {
            return Some(p.to_string());
        }
        warn!("configured browser executable {} does not exist", p);
    }

    let mut order = vec![settings.kind];
    for k in [
        BrowserKind::Chrome,
        BrowserKind::Chromium,
        BrowserKind::Edge,
        BrowserKind::Brave,
    ] {
        if !order.contains(&k) {
            order.push(k);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for kind in &order {
            for dir in std::env::split_paths(&path_var) {
                for exe in path_names(*kind) {
                    let full = dir.join(exe);
                    if full.exists() {
                        return Some(full.to_string_lossy().to_string());
                    }
                }
            }
        }
    }

    for kind in &order {
        for c in well_known_paths(*kind) {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Browser config builder ───────────────────────────────────────────────────

/// Build a `BrowserConfig` for the chat session.
///
/// Headed by default so a human can solve an SSO captcha; `headless` flips it.
pub fn build_browser_config(
    exe: &str,
    settings: &BrowserSettings,
    timeouts: &Timeouts,
    user_agent: &str,
) -> Result<BrowserConfig> {
    let (width, height) = (1366, 900);
    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .request_timeout(timeouts.page_load)
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-gpu")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", user_agent));

    if !settings.headless {
        builder = builder.with_head();
    }

    builder
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

// ── Ownership-tagged browser handle ──────────────────────────────────────────

/// Who is responsible for the browser process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserOwnership {
    /// Launched by this process; closed on shutdown unless `keep_open`.
    Owned,
    /// Attached to an external browser; only navigated and queried, never closed.
    Borrowed,
}

pub struct BrowserHandle {
    browser: Option<Browser>,
    handler_task: Option<tokio::task::JoinHandle<()>>,
    ownership: BrowserOwnership,
    keep_open: bool,
}

impl BrowserHandle {
    /// Launch a fresh browser. The handle owns it.
    pub async fn launch(
        settings: &BrowserSettings,
        timeouts: &Timeouts,
        user_agent: &str,
    ) -> Result<Self> {
        let exe = find_chrome_executable(settings).ok_or_else(|| {
            anyhow!("No browser found. Install Chrome, Chromium, Edge or Brave, or set CHROME_EXECUTABLE.")
        })?;
        info!(
            "🚀 launching browser ({}, headless={})",
            exe, settings.headless
        );
        let config = build_browser_config(&exe, settings, timeouts, user_agent)?;
        let (browser, handler) = Browser::launch(config)
            .await
            .map_err(|e| anyhow!("Failed to launch browser ({}): {}", exe, e))?;
        Ok(Self::wrap(
            browser,
            handler,
            BrowserOwnership::Owned,
            settings.keep_open,
        ))
    }

    /// Attach to a running browser via its DevTools websocket URL. The handle borrows it.
    pub async fn attach(debugger_url: &str) -> Result<Self> {
        info!("🔗 attaching to running browser at {}", debugger_url);
        let (browser, handler) = Browser::connect(debugger_url)
            .await
            .map_err(|e| anyhow!("Failed to connect to {}: {}", debugger_url, e))?;
        Ok(Self::wrap(browser, handler, BrowserOwnership::Borrowed, true))
    }

    /// Attach when a debugger URL is configured, otherwise launch.
    pub async fn open(
        settings: &BrowserSettings,
        timeouts: &Timeouts,
        user_agent: &str,
    ) -> Result<Self> {
        match settings.debugger_url.as_deref() {
            Some(url) => Self::attach(url).await,
            None => Self::launch(settings, timeouts, user_agent).await,
        }
    }

    fn wrap(
        browser: Browser,
        mut handler: chromiumoxide::Handler,
        ownership: BrowserOwnership,
        keep_open: bool,
    ) -> Self {
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
        });
        Self {
            browser: Some(browser),
            handler_task: Some(handler_task),
            ownership,
            keep_open,
        }
    }

    pub fn ownership(&self) -> BrowserOwnership {
        self.ownership
    }

    /// Whether `shutdown` will close the process.
    pub fn closes_on_shutdown(&self) -> bool {
        self.ownership == BrowserOwnership::Owned && !self.keep_open
    }

    pub async fn new_page(&self, url: &str) -> Result<Page> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| anyhow!("browser already shut down"))?;
        browser
            .new_page(url)
            .await
            .map_err(|e| anyhow!("Failed to open tab: {}", e))
    }

    /// Release the browser. Closes it only when owned and not `keep_open`.
    pub async fn shutdown(&mut self) {
        let Some(mut browser) = self.browser.take() else {
            return;
        };
        if self.closes_on_shutdown() {
            if let Err(e) = browser.close().await {
                warn!("Browser close error (non-fatal): {}", e);
            }
            let _ = browser.wait().await;
            info!("🛑 browser closed");
        } else {
            info!(
                "browser left running (ownership={:?}, keep_open={})",
                self.ownership, self.keep_open
            );
            if self.ownership == BrowserOwnership::Owned {
                // Dropping a launched Browser kills its child process.
                std::mem::forget(browser);
            }
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        // Drop cannot await; spawn the close when still inside a runtime.
        if !self.closes_on_shutdown() {
            if self.ownership == BrowserOwnership::Owned {
                if let Some(browser) = self.browser.take() {
                    std::mem::forget(browser);
                }
            }
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Some(mut browser) = self.browser.take() {
            handle.spawn(async move {
                let _ = browser.close().await;
            });
        }
    }
}
