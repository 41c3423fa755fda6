//! Process wiring: bot loop, orchestrator, background tasks and the HTTP
//! listener.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relaydesk_bot::bridge::EventLoop;
use relaydesk_bot::eventlog::EventLog;
use relaydesk_bot::platform::{HttpConnector, PlatformConnector};
use relaydesk_bot::LoginOrchestrator;

use crate::config::ServerConfig;
use crate::db::Db;
use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server {
    config: ServerConfig,
    connector: Arc<dyn PlatformConnector>,
}

impl Server {
    /// Server talking to the configured platform gateway.
    pub fn new(config: ServerConfig) -> Self {
        let connector = HttpConnector::new(config.gateway_url.clone(), config.api_credentials());
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: ServerConfig, connector: Arc<dyn PlatformConnector>) -> Self {
        Self { config, connector }
    }

    /// Open storage and build the orchestrator without attaching a loop.
    pub fn build_state(&self) -> Result<AppState> {
        let db_path = self.config.db_path();
        let db = Db::open(&db_path).with_context(|| format!("opening database {db_path}"))?;
        let event_log = Arc::new(EventLog::open(
            &self.config.bot_log_path,
            self.config.event_log_utc_offset_hours,
        ));
        let orchestrator = Arc::new(LoginOrchestrator::new(
            Arc::clone(&self.connector),
            self.config.login_settings(),
            event_log,
        ));
        let events = crate::events::load_events(&self.config.events_path);
        Ok(AppState::new(self.config.clone(), db, orchestrator, events))
    }

    pub async fn run(self) -> Result<()> {
        self.config.validate()?;
        let state = self.build_state()?;

        let bot_loop = EventLoop::spawn("relaydesk-bot").context("starting bot event loop")?;
        state.orchestrator.attach_loop(bot_loop.handle());

        if let Some(creds) = self.config.stored_credentials() {
            let orchestrator = Arc::clone(&state.orchestrator);
            tokio::spawn(async move {
                let result =
                    tokio::task::spawn_blocking(move || orchestrator.start_with_stored_credentials(&creds))
                        .await;
                match result {
                    Ok(Ok(Some(identity))) => tracing::info!(%identity, "bot auto-started"),
                    Ok(Ok(None)) => tracing::info!("bot auto-start skipped"),
                    Ok(Err(e)) => tracing::warn!(error = %e, "bot auto-start failed"),
                    Err(e) => tracing::error!(error = %e, "bot auto-start task panicked"),
                }
            });
        } else {
            tracing::info!("no stored bot credentials; waiting for a web login");
        }

        let sweeper = {
            let state = state.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let logins = state.orchestrator.sweep_expired();
                    let oauth = state.sweep_oauth_pending();
                    if logins + oauth > 0 {
                        tracing::debug!(logins, oauth, "expired pending logins swept");
                    }
                }
            })
        };

        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        tracing::info!("HTTP dashboard listening on {}", self.config.listen_addr);

        let orchestrator = Arc::clone(&state.orchestrator);
        let router = crate::web::router(state);
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        sweeper.abort();
        tracing::info!("shutting down bot");
        let mut bot_loop = bot_loop;
        tokio::task::spawn_blocking(move || {
            orchestrator.shutdown(SHUTDOWN_DISCONNECT_TIMEOUT);
            bot_loop.shutdown();
        })
        .await
        .context("bot shutdown task")?;

        served.context("HTTP server error")
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
