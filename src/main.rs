use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use tracing::info;

use smpp_gate::config::AppConfig;
use smpp_gate::router::{InMemoryRouter, User};
use smpp_gate::smpp::server::SmppServer;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    // Initialize configuration
    let config = match AppConfig::new() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(config.log.level.clone())
        .init();

    info!("Starting SMPP gate '{}'...", config.smpps.id);

    let router = Arc::new(InMemoryRouter::new());
    for account in &config.smpps.accounts {
        let mut user = User::new(&account.uid, &account.username, &account.password);
        user.smpps_credential.max_bindings = account.max_bindings;
        router.add_user(user);
    }
    info!("Provisioned {} user account(s)", config.smpps.accounts.len());

    let server = Arc::new(SmppServer::new(Arc::new(config), router));

    let acceptor = server.clone();
    let accept_loop = tokio::spawn(async move { acceptor.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining sessions");
    server.shutdown(Duration::from_secs(5)).await;
    accept_loop.abort();

    Ok(())
}
