use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::ChatError;
use crate::core::types::AssistantVariant;
use crate::features::session_store::Credentials;

// ---------------------------------------------------------------------------
// PortalConfigFile: file-based config loader (portal-chat.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "PORTAL_CHAT_CONFIG";
pub const ENV_USERNAME: &str = "PORTAL_USERNAME";
pub const ENV_PASSWORD: &str = "PORTAL_PASSWORD";
pub const ENV_HISTORY_FILE: &str = "PORTAL_CHAT_HISTORY";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";

pub const DEFAULT_LOGIN_URL: &str = "https://sso.buaa.edu.cn/login";
pub const DEFAULT_REDIRECT_URL: &str = "https://chat.buaa.edu.cn/";
pub const DEFAULT_XIAOHANG_URL: &str = "https://chat.buaa.edu.cn/page/site/newPc";
pub const DEFAULT_TONGYI_URL: &str = "https://chat.buaa.edu.cn/page/app/tongyi";

const DEFAULT_INPUT_SELECTORS: &[&str] = &[
    "textarea.n-input__textarea-el",
    ".chat-input",
    "[placeholder]",
    "textarea",
];

const DEFAULT_SEND_SELECTORS: &[&str] = &[
    "button[type='submit']",
    ".send-button",
    "button.n-button",
];

const DEFAULT_RESPONSE_SELECTORS: &[&str] = &[
    ".chat-assistant .text",
    ".chat-message-text",
    ".assistant-message",
    ".reply .text",
];

const DEFAULT_FALLBACK_RESPONSE_SELECTORS: &[&str] = &[
    "[class*='assistant']",
    "[class*='answer']",
    "[class*='markdown']",
    "[class*='reply']",
];

/// Credentials section (`auth` key).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct AuthSection {
    pub username: Option<String>,
    /// Never logged.
    pub password: Option<String>,
    pub login_url: Option<String>,
    pub redirect_url: Option<String>,
}

/// Assistant endpoints (`assistant` key).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct AssistantSection {
    pub xiaohang_url: Option<String>,
    pub tongyi_url: Option<String>,
    /// `xiaohang` or `tongyi`.
    pub default_assistant: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
}

/// All durations are whole seconds.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct TimeoutSection {
    pub request_timeout: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<u64>,
    pub implicit_wait: Option<u64>,
    pub page_load_timeout: Option<u64>,
    /// Hard ceiling for one assistant answer.
    pub wait_for_answer: Option<u64>,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct BrowserSection {
    /// `chrome`, `chromium`, `brave` or `edge`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub headless: Option<bool>,
    /// Leave the browser running when the program exits.
    pub keep_open: Option<bool>,
    pub executable: Option<String>,
    /// Attach to an already running browser instead of launching one.
    /// The process will never close a browser it attached to.
    pub debugger_url: Option<String>,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct SelectorSection {
    pub input: Option<Vec<String>>,
    pub send: Option<Vec<String>>,
    pub response: Option<Vec<String>>,
    pub fallback_response: Option<Vec<String>>,
    /// Regex with a prefix group and a numeric group, e.g. `^(message-)(\d+)$`.
    pub message_id_pattern: Option<String>,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct DetectionSection {
    pub poll_interval_ms: Option<u64>,
    pub stable_polls: Option<u32>,
    pub use_marker: Option<bool>,
    /// `{n}` is replaced with the 1-based turn number.
    pub marker_template: Option<String>,
    /// `{marker}` is replaced with the rendered marker.
    pub marker_instruction: Option<String>,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct MessageSection {
    pub max_length: Option<usize>,
    pub history_file: Option<String>,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct BatchSection {
    pub delay_secs: Option<u64>,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct LogSection {
    pub level: Option<String>,
    pub file: Option<String>,
    pub console: Option<bool>,
    pub rotate: Option<bool>,
}

/// Top-level config loaded from `portal-chat.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct PortalConfigFile {
    pub auth: AuthSection,
    pub assistant: AssistantSection,
    pub timeouts: TimeoutSection,
    pub browser: BrowserSection,
    pub selectors: SelectorSection,
    pub detection: DetectionSection,
    pub message: MessageSection,
    pub batch: BatchSection,
    pub log: LogSection,
}

/// Load `portal-chat.json`.
///
/// An explicit path must exist and parse. Without one, search order (first found wins):
/// 1. `PORTAL_CHAT_CONFIG` env var path
/// 2. `./portal-chat.json`
/// 3. `../portal-chat.json`
///
/// Missing file → `PortalConfigFile::default()`.
/// Parse error on a searched path → log a warning, return defaults.
pub fn load_portal_config(explicit: Option<&Path>) -> Result<PortalConfigFile, ChatError> {
    if let Some(path) = explicit {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ChatError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let cfg = serde_json::from_str::<PortalConfigFile>(&contents).map_err(|e| {
            ChatError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        tracing::info!("portal-chat.json loaded from {}", path.display());
        return Ok(cfg);
    }

    let candidates: Vec<PathBuf> = {
        let mut v = vec![
            PathBuf::from("portal-chat.json"),
            PathBuf::from("../portal-chat.json"),
        ];
        if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
            v.insert(0, PathBuf::from(env_path));
        }
        v
    };

    for path in &candidates {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        return match serde_json::from_str::<PortalConfigFile>(&contents) {
            Ok(cfg) => {
                tracing::info!("portal-chat.json loaded from {}", path.display());
                Ok(cfg)
            }
            Err(e) => {
                tracing::warn!(
                    "portal-chat.json parse error at {}: {}, using defaults",
                    path.display(),
                    e
                );
                Ok(PortalConfigFile::default())
            }
        };
    }

    Ok(PortalConfigFile::default())
}

// ---------------------------------------------------------------------------
// AppConfig: resolved once, then shared read-only
// ---------------------------------------------------------------------------

/// Values supplied on the command line. They win over file and env.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub username: Option<String>,
    pub password: Option<String>,
    pub variant: Option<AssistantVariant>,
    pub headless: bool,
    pub debug: bool,
    pub batch_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserKind {
    Chrome,
    Chromium,
    Brave,
    Edge,
}

impl BrowserKind {
    pub fn parse_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "chrome" | "google-chrome" => Some(BrowserKind::Chrome),
            "chromium" => Some(BrowserKind::Chromium),
            "brave" => Some(BrowserKind::Brave),
            "edge" | "msedge" => Some(BrowserKind::Edge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub request: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub implicit_wait: Duration,
    pub page_load: Duration,
    pub wait_for_answer: Duration,
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub kind: BrowserKind,
    pub headless: bool,
    pub keep_open: bool,
    pub executable: Option<String>,
    pub debugger_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub input: Vec<String>,
    pub send: Vec<String>,
    pub response: Vec<String>,
    pub fallback_response: Vec<String>,
    pub message_id_pattern: regex::Regex,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub poll_interval: Duration,
    pub stable_polls: u32,
    pub use_marker: bool,
    pub marker_template: String,
    pub marker_instruction: String,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<PathBuf>,
    pub console: bool,
    pub rotate: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub credentials: Credentials,
    pub login_url: String,
    pub redirect_url: String,
    pub variant: AssistantVariant,
    pub xiaohang_url: String,
    pub tongyi_url: String,
    pub headers: BTreeMap<String, String>,
    pub timeouts: Timeouts,
    pub browser: BrowserSettings,
    pub selectors: SelectorConfig,
    pub detection: DetectionSettings,
    pub max_message_length: usize,
    pub history_file: PathBuf,
    pub batch_delay: Duration,
    pub log: LogSettings,
}

impl AppConfig {
    /// Merge file, environment and CLI values into the immutable run config.
    pub fn resolve(file: PortalConfigFile, overrides: ConfigOverrides) -> Result<Self, ChatError> {
        let PortalConfigFile {
            auth,
            assistant,
            timeouts,
            browser,
            selectors,
            detection,
            message,
            batch,
            log,
        } = file;

        let username = overrides
            .username
            .or(auth.username)
            .or_else(|| env_nonempty(ENV_USERNAME))
            .unwrap_or_default();
        let password = overrides
            .password
            .or(auth.password)
            .or_else(|| env_nonempty(ENV_PASSWORD))
            .unwrap_or_default();

        let variant = match overrides.variant {
            Some(v) => v,
            None => match assistant.default_assistant.as_deref() {
                None => AssistantVariant::default(),
                Some(raw) => AssistantVariant::parse_str(raw).unwrap_or_else(|| {
                    tracing::warn!("unknown assistant type '{}', using xiaohang", raw);
                    AssistantVariant::Xiaohang
                }),
            },
        };

        let kind = match browser.kind.as_deref() {
            None => BrowserKind::Chrome,
            Some(raw) => BrowserKind::parse_str(raw).ok_or_else(|| {
                ChatError::Config(format!(
                    "unsupported browser type '{}' (chrome, chromium, brave, edge)",
                    raw
                ))
            })?,
        };

        let pattern = selectors
            .message_id_pattern
            .unwrap_or_else(|| r"^(.*?)(\d+)$".to_string());
        let message_id_pattern = regex::Regex::new(&pattern)
            .map_err(|e| ChatError::Config(format!("message_id_pattern: {}", e)))?;
        if message_id_pattern.captures_len() < 3 {
            return Err(ChatError::Config(
                "message_id_pattern needs a prefix group and a numeric group".to_string(),
            ));
        }

        let history_file = message
            .history_file
            .or_else(|| env_nonempty(ENV_HISTORY_FILE))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data").join("history.json"));

        let level = if overrides.debug {
            "debug".to_string()
        } else {
            log.level.unwrap_or_else(|| "info".to_string())
        };

        Ok(Self {
            credentials: Credentials::new(username, password),
            login_url: auth.login_url.unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string()),
            redirect_url: auth
                .redirect_url
                .unwrap_or_else(|| DEFAULT_REDIRECT_URL.to_string()),
            variant,
            xiaohang_url: assistant
                .xiaohang_url
                .unwrap_or_else(|| DEFAULT_XIAOHANG_URL.to_string()),
            tongyi_url: assistant
                .tongyi_url
                .unwrap_or_else(|| DEFAULT_TONGYI_URL.to_string()),
            headers: assistant.headers.unwrap_or_default(),
            timeouts: Timeouts {
                request: secs(timeouts.request_timeout, 60),
                max_retries: timeouts.max_retries.unwrap_or(3).max(1),
                retry_delay: secs(timeouts.retry_delay, 2),
                implicit_wait: secs(timeouts.implicit_wait, 10),
                page_load: secs(timeouts.page_load_timeout, 30),
                wait_for_answer: secs(timeouts.wait_for_answer, 60),
            },
            browser: BrowserSettings {
                kind,
                headless: overrides.headless || browser.headless.unwrap_or(false),
                keep_open: browser.keep_open.unwrap_or(false),
                executable: browser
                    .executable
                    .or_else(|| env_nonempty(ENV_CHROME_EXECUTABLE)),
                debugger_url: browser.debugger_url.filter(|u| !u.trim().is_empty()),
            },
            selectors: SelectorConfig {
                input: list_or(selectors.input, DEFAULT_INPUT_SELECTORS),
                send: list_or(selectors.send, DEFAULT_SEND_SELECTORS),
                response: list_or(selectors.response, DEFAULT_RESPONSE_SELECTORS),
                fallback_response: list_or(
                    selectors.fallback_response,
                    DEFAULT_FALLBACK_RESPONSE_SELECTORS,
                ),
                message_id_pattern,
            },
            detection: DetectionSettings {
                poll_interval: Duration::from_millis(detection.poll_interval_ms.unwrap_or(500)),
                stable_polls: detection.stable_polls.unwrap_or(6).max(1),
                use_marker: detection.use_marker.unwrap_or(true),
                marker_template: detection
                    .marker_template
                    .unwrap_or_else(|| "[DIALOG_{n}_END]".to_string()),
                marker_instruction: detection.marker_instruction.unwrap_or_else(|| {
                    "(When your answer is complete, end it with {marker})".to_string()
                }),
            },
            max_message_length: message.max_length.unwrap_or(2000),
            history_file,
            batch_delay: Duration::from_secs(
                overrides
                    .batch_delay_secs
                    .or(batch.delay_secs)
                    .unwrap_or(2),
            ),
            log: LogSettings {
                level,
                file: log.file.map(PathBuf::from),
                console: log.console.unwrap_or(true),
                rotate: log.rotate.unwrap_or(false),
            },
        })
    }

    /// Chat page for the configured assistant variant.
    pub fn assistant_url(&self) -> &str {
        match self.variant {
            AssistantVariant::Xiaohang => &self.xiaohang_url,
            AssistantVariant::Tongyi => &self.tongyi_url,
        }
    }

    /// Host of the SSO service; landing there means the session was dropped.
    pub fn login_host(&self) -> Option<String> {
        url::Url::parse(&self.login_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.unwrap_or(default))
}

fn list_or(value: Option<Vec<String>>, default: &[&str]) -> Vec<String> {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_portal_layout() {
        let cfg = AppConfig::resolve(
            PortalConfigFile::default(),
            ConfigOverrides {
                username: Some("20370000".into()),
                password: Some("secret".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.assistant_url(), DEFAULT_XIAOHANG_URL);
        assert_eq!(cfg.timeouts.max_retries, 3);
        assert_eq!(cfg.timeouts.wait_for_answer, Duration::from_secs(60));
        assert_eq!(cfg.detection.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.detection.stable_polls, 6);
        assert_eq!(cfg.selectors.input[0], "textarea.n-input__textarea-el");
        assert_eq!(cfg.login_host().as_deref(), Some("sso.buaa.edu.cn"));
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let file: PortalConfigFile = serde_json::from_str(
            r#"{
                "auth": {"username": "file-user", "password": "file-pass"},
                "assistant": {"default_assistant": "xiaohang"},
                "browser": {"headless": false},
                "log": {"level": "warn"}
            }"#,
        )
        .unwrap();
        let cfg = AppConfig::resolve(
            file,
            ConfigOverrides {
                username: Some("cli-user".into()),
                variant: Some(AssistantVariant::Tongyi),
                headless: true,
                debug: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.credentials.username, "cli-user");
        assert_eq!(cfg.credentials.password, "file-pass");
        assert_eq!(cfg.assistant_url(), DEFAULT_TONGYI_URL);
        assert!(cfg.browser.headless);
        assert_eq!(cfg.log.level, "debug");
    }

    #[test]
    fn firefox_is_rejected() {
        let file: PortalConfigFile =
            serde_json::from_str(r#"{"browser": {"type": "firefox"}}"#).unwrap();
        let err = AppConfig::resolve(file, ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn id_pattern_needs_two_groups() {
        let file: PortalConfigFile =
            serde_json::from_str(r#"{"selectors": {"message_id_pattern": "^\\d+$"}}"#).unwrap();
        assert!(AppConfig::resolve(file, ConfigOverrides::default()).is_err());
    }
}
