use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (RELAYDESK_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("RELAYDESK_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("relaydesk_server=info".parse()?)
        .add_directive("relaydesk_bot=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = relaydesk_server::config::ServerConfig::parse();
    tracing::info!("Starting relaydesk dashboard on {}", config.listen_addr);
    let server = relaydesk_server::server::Server::new(config);
    server.run().await
}
