//! # relaydesk-bot
//!
//! Login core for the relaydesk dashboard: drives a chat-platform client
//! through phone → code → (two-factor password) → authorized, with every
//! platform call running on one dedicated event-loop thread and web handlers
//! waiting on it synchronously with a timeout.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use relaydesk_bot::bridge::EventLoop;
//! use relaydesk_bot::eventlog::EventLog;
//! use relaydesk_bot::orchestrator::{LoginOrchestrator, LoginOutcome, LoginSettings};
//! use relaydesk_bot::platform::{ApiCredentials, HttpConnector};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = HttpConnector::new(
//!     "http://127.0.0.1:8081",
//!     ApiCredentials { api_id: 12345, api_hash: "0123abcd".into() },
//! );
//! let orchestrator = LoginOrchestrator::new(
//!     Arc::new(connector),
//!     LoginSettings::default(),
//!     Arc::new(EventLog::open("bot_logs.txt", 6)),
//! );
//! let bot_loop = EventLoop::spawn("relaydesk-bot")?;
//! orchestrator.attach_loop(bot_loop.handle());
//!
//! let session_id = orchestrator.start_login("+8801000000")?;
//! match orchestrator.verify_code(&session_id, "123456", None)? {
//!     LoginOutcome::Authorized { identity } => println!("logged in as {identity}"),
//!     LoginOutcome::PasswordRequired => println!("two-factor password needed"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod client;
pub mod error;
pub mod eventlog;
pub mod orchestrator;
pub mod platform;
pub mod scheduler;
pub mod scripted;
pub mod session;

pub use error::LoginError;
pub use orchestrator::{LoginOrchestrator, LoginOutcome, LoginSettings, StoredCredentials};
