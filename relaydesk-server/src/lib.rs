//! relaydesk dashboard: OIDC-protected pages and JSON API for driving the
//! bot's chat-platform login.

pub mod auth;
pub mod config;
pub mod db;
pub mod events;
pub mod oidc;
pub mod server;
pub mod state;
pub mod web;
