#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use dotenv::dotenv;
use ssh_tunnel::{Config, TunnelSession};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        "Tunnelling to {} through {} as {}",
        config.remote_address(),
        config.ssh_address(),
        config.username
    );

    let mut session = TunnelSession::create(config)?;
    if let Err(e) = session.setup().await {
        error!("Tunnel setup failed: {}", e);
        return Err(e.into());
    }

    // One JSON line for wrappers waiting on the bound port
    println!("{}", serde_json::to_string(&session.info())?);

    let shutdown = session.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping the tunnel");
            shutdown.shutdown();
        }
    });

    let exit = session.open_tunnel().await?;
    info!("Tunnel exited: {}", exit);
    Ok(())
}
