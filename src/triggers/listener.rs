//! LISTEN loop feeding change notifications into the hub.

use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ChangeNotification;
use crate::live::HubHandle;

/// Delay before reconnecting after a failed LISTEN
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Run until the shutdown signal is received
///
/// After every (re)connect the hub is asked to resync, since notifications
/// sent while disconnected are lost.
pub async fn run_listener(
    pool: PgPool,
    channel: String,
    hub: HubHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(channel = %channel, "Change listener started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "Change listener failed to connect");
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    _ = shutdown_rx.changed() => break,
                }
            }
        };
        if let Err(e) = listener.listen(&channel).await {
            warn!(error = %e, channel = %channel, "LISTEN failed");
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                _ = shutdown_rx.changed() => break,
            }
        }
        hub.resync();

        loop {
            tokio::select! {
                received = listener.try_recv() => match received {
                    Ok(Some(notification)) => {
                        match ChangeNotification::parse(notification.payload()) {
                            Ok(change) => hub.notify(change),
                            Err(e) => warn!(error = %e, "Ignoring malformed notification"),
                        }
                    }
                    Ok(None) => {
                        // Connection dropped; the next try_recv reconnects
                        debug!("Change listener connection lost");
                        hub.resync();
                    }
                    Err(e) => {
                        warn!(error = %e, "Change listener error, reconnecting");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!("Change listener shutting down");
                    return;
                }
            }
        }
    }

    info!("Change listener stopped");
}
