//! `PortalClient`: login, browser and chat session wired together.

use std::sync::Arc;

use tracing::{info, warn};

use crate::core::config::AppConfig;
use crate::core::error::ChatError;
use crate::core::types::ChatTurn;
use crate::features::auth::{Authenticator, SessionReauth};
use crate::features::controller::ChatSession;
use crate::features::conversation::{Conversation, HistoryStore};
use crate::scraping::browser_manager::{random_user_agent, BrowserHandle};
use crate::scraping::cdp_dom::CdpDom;
use crate::scraping::dom::DomDriver;

pub struct PortalClient {
    config: Arc<AppConfig>,
    auth: Arc<Authenticator>,
    browser: BrowserHandle,
    session: ChatSession<CdpDom>,
}

impl PortalClient {
    /// Log in, bring up the browser on the assistant page and start a conversation.
    pub async fn open(config: Arc<AppConfig>) -> Result<Self, ChatError> {
        if !config.credentials.is_complete() {
            return Err(ChatError::Auth("username and password are required".into()));
        }
        let user_agent = random_user_agent();
        let auth = Arc::new(Authenticator::new(&config, user_agent)?);

        let mut http_ready = false;
        if auth.restore_saved() && !auth.is_login_required(&config.redirect_url).await {
            info!("🍪 saved session still valid");
            http_ready = true;
        }
        if !http_ready {
            match auth.login(None).await {
                Ok(()) => http_ready = true,
                Err(e) => warn!("HTTP login unavailable ({}), will log in through the browser", e),
            }
        }

        let mut browser = BrowserHandle::open(&config.browser, &config.timeouts, user_agent)
            .await
            .map_err(|e| ChatError::BrowserLaunch(e.to_string()))?;

        match Self::prepare_page(&config, &auth, &browser, http_ready).await {
            Ok(dom) => {
                auth.save_session();
                let reauth = Arc::new(SessionReauth::new(Arc::clone(&auth), dom.page().clone()));
                let session = ChatSession::from_config(Arc::new(dom), &config, Conversation::start_new())
                    .with_store(HistoryStore::new(&config.history_file))
                    .with_reauthenticator(reauth);
                info!(
                    "💬 {} ready, conversation {}",
                    config.variant.as_str(),
                    session.conversation().id()
                );
                Ok(Self {
                    config,
                    auth,
                    browser,
                    session,
                })
            }
            Err(e) => {
                browser.shutdown().await;
                Err(e)
            }
        }
    }

    async fn prepare_page(
        config: &AppConfig,
        auth: &Authenticator,
        browser: &BrowserHandle,
        http_ready: bool,
    ) -> Result<CdpDom, ChatError> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ChatError::BrowserLaunch(e.to_string()))?;
        let dom = CdpDom::new(page);

        if http_ready {
            auth.sync_to_browser(dom.page()).await?;
        }
        dom.navigate(config.assistant_url()).await?;

        let current = dom.current_url().await?;
        if !http_ready || auth.is_login_location(&current) {
            auth.login_in_browser(&dom).await?;
            auth.pull_from_browser(dom.page()).await?;
            dom.navigate(config.assistant_url()).await?;
        }
        Ok(dom)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn conversation(&self) -> &Conversation {
        self.session.conversation()
    }

    pub async fn chat(&mut self, message: &str) -> Result<String, ChatError> {
        self.session.send_message(message).await
    }

    pub fn history(&self) -> &[ChatTurn] {
        self.session.history()
    }

    pub fn clear_conversation(&mut self) {
        self.session.clear_conversation();
    }

    /// Persist and release the browser (closed only when owned and not kept open).
    pub async fn close(mut self) {
        self.session.persist();
        self.browser.shutdown().await;
    }
}
