//! Server configuration (flags or environment).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use relaydesk_bot::LoginSettings;
use relaydesk_bot::orchestrator::StoredCredentials;
use relaydesk_bot::platform::ApiCredentials;

/// Platform session name used by the startup auto-login.
pub const BOT_SESSION_NAME: &str = "bot_session";

#[derive(Parser, Debug, Clone)]
#[command(name = "relaydesk-server", about = "Dashboard for the relaydesk chat bot")]
pub struct ServerConfig {
    /// HTTP listen address
    #[arg(long, env = "RELAYDESK_LISTEN", default_value = "0.0.0.0:5000")]
    pub listen_addr: String,

    /// SQLite database path (defaults to ./data.db)
    #[arg(long, env = "DATABASE_PATH")]
    pub db_path: Option<String>,

    /// Secret for the private cookie jar (at least 16 characters)
    #[arg(long, env = "SESSION_SECRET", hide_env_values = true)]
    pub session_secret: String,

    /// OIDC client id
    #[arg(long, env = "OIDC_CLIENT_ID")]
    pub oidc_client_id: String,

    /// OIDC issuer URL
    #[arg(long, env = "OIDC_ISSUER_URL", default_value = "https://replit.com/oidc")]
    pub oidc_issuer_url: String,

    /// Externally visible origin, e.g. https://desk.example.com. When unset it
    /// is derived from X-Forwarded-Proto / X-Forwarded-Host / Host.
    #[arg(long, env = "PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Chat platform API id
    #[arg(long, env = "TELEGRAM_API_ID", default_value_t = 0)]
    pub api_id: i64,

    /// Chat platform API hash
    #[arg(long, env = "TELEGRAM_API_HASH", default_value = "", hide_env_values = true)]
    pub api_hash: String,

    /// Phone number for the non-interactive startup login
    #[arg(long, env = "TELEGRAM_PHONE")]
    pub phone: Option<String>,

    /// Chat the bot posts to
    #[arg(long, env = "TELEGRAM_GROUP_ID", allow_hyphen_values = true)]
    pub group_id: Option<i64>,

    /// Platform gateway base URL
    #[arg(long, env = "TELEGRAM_GATEWAY_URL", default_value = "http://127.0.0.1:8081")]
    pub gateway_url: String,

    /// Append-only bot event log
    #[arg(long, env = "BOT_LOG_PATH", default_value = "bot_logs.txt")]
    pub bot_log_path: PathBuf,

    /// Events snapshot loaded at startup
    #[arg(long, env = "EVENTS_PATH", default_value = "events.json")]
    pub events_path: PathBuf,

    #[arg(long, env = "LOGIN_START_TIMEOUT_SECS", default_value_t = 20)]
    pub login_start_timeout_secs: u64,

    #[arg(long, env = "LOGIN_VERIFY_TIMEOUT_SECS", default_value_t = 30)]
    pub login_verify_timeout_secs: u64,

    /// Unfinished web logins are discarded after this long
    #[arg(long, env = "LOGIN_SESSION_TTL_SECS", default_value_t = 600)]
    pub login_session_ttl_secs: u64,

    #[arg(long, env = "SCHEDULER_INTERVAL_SECS", default_value_t = 60)]
    pub scheduler_interval_secs: u64,

    /// UTC offset for event log timestamps
    #[arg(long, env = "EVENT_LOG_UTC_OFFSET_HOURS", default_value_t = 6, allow_hyphen_values = true)]
    pub event_log_utc_offset_hours: i32,
}

impl ServerConfig {
    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session_secret.chars().count() < 16 {
            anyhow::bail!("SESSION_SECRET must be set and at least 16 characters");
        }
        if self.oidc_client_id.trim().is_empty() {
            anyhow::bail!("OIDC_CLIENT_ID must be set");
        }
        if let Some(url) = &self.public_url {
            url::Url::parse(url).map_err(|e| anyhow::anyhow!("invalid PUBLIC_URL {url}: {e}"))?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> String {
        match &self.db_path {
            Some(p) => p.clone(),
            None => {
                tracing::warn!("DATABASE_PATH not set, defaulting to data.db for local development");
                "data.db".to_string()
            }
        }
    }

    pub fn api_credentials(&self) -> ApiCredentials {
        ApiCredentials {
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
        }
    }

    pub fn login_settings(&self) -> LoginSettings {
        LoginSettings {
            start_timeout: Duration::from_secs(self.login_start_timeout_secs),
            verify_timeout: Duration::from_secs(self.login_verify_timeout_secs),
            session_ttl: Duration::from_secs(self.login_session_ttl_secs),
            scheduler_interval: Duration::from_secs(self.scheduler_interval_secs.max(1)),
        }
    }

    /// Startup credentials, when every piece is present.
    pub fn stored_credentials(&self) -> Option<StoredCredentials> {
        let phone = self.phone.as_deref().map(str::trim).filter(|p| !p.is_empty())?;
        if !self.api_credentials().is_configured() {
            return None;
        }
        Some(StoredCredentials {
            phone: phone.to_string(),
            session_name: BOT_SESSION_NAME.to_string(),
            target_chat: self.group_id,
        })
    }
}
