//! Process-level wiring of the two rooms

use std::future::Future;
use std::sync::Arc;

use crate::config::RelayConfig;
use crate::dispatcher::{Supervisor, SupervisorSummary, TrackDispatcher};
use crate::error::SessionError;
use crate::track::{SessionHandle, TrackPublisher};

/// Relay tracks from the source room into `destination` until `shutdown`.
///
/// The destination must already be connected so the publisher exists before
/// the first track arrives. `connect_source` receives the dispatcher that its
/// session should offer inbound tracks to. Each session is disconnected
/// exactly once, source first, whether or not the source connected.
pub async fn run<D, S, C, Fut>(
    destination: Arc<D>,
    connect_source: C,
    relay: &RelayConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<SupervisorSummary, SessionError>
where
    D: TrackPublisher + SessionHandle + 'static,
    S: SessionHandle,
    C: FnOnce(TrackDispatcher) -> Fut,
    Fut: Future<Output = Result<S, SessionError>>,
{
    let publisher: Arc<dyn TrackPublisher> = destination.clone();
    let (supervisor, dispatcher) = Supervisor::new(publisher, relay);

    let source = match connect_source(dispatcher).await {
        Ok(source) => source,
        Err(e) => {
            tracing::error!("Failed to connect to source room: {}", e);
            destination.disconnect().await;
            return Err(e);
        }
    };
    tracing::info!("Connected to {}, waiting for tracks", source.label());

    let summary = supervisor.run(shutdown).await;
    tracing::info!(
        "Relayed {} track(s): {} completed, {} failed, {} abandoned",
        summary.started,
        summary.completed,
        summary.failed,
        summary.abandoned
    );

    let sessions: [&dyn SessionHandle; 2] = [&source, destination.as_ref()];
    for session in sessions {
        if session.disconnect().await {
            tracing::info!("Disconnected from {}", session.label());
        }
    }

    Ok(summary)
}
