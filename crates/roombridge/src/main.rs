use anyhow::Result;

use roombridge::session::RoomSession;
use roombridge::{bridge, logging, Config};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    logging::init(config.log_format);

    tracing::info!("Starting roombridge for room {}...", config.room);

    // Connect the destination first so tracks have somewhere to go
    let destination = match RoomSession::connect_publisher(&config).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Failed to connect to destination room: {}", e);
            return Err(e.into());
        }
    };

    let summary = bridge::run(
        destination,
        |dispatcher| RoomSession::connect_subscriber(&config, dispatcher),
        &config.relay,
        shutdown_signal(),
    )
    .await?;

    tracing::info!("Shut down after relaying {} track(s)", summary.started);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
