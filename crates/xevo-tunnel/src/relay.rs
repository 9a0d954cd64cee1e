//! Stub relay
//!
//! Drives one bound stub endpoint: for every accepted external connection,
//! open a new channel through the live control connection carrying the
//! skeleton descriptor, then pump bytes until either side finishes. The same
//! relay serves forward stubs on the client and reverse stubs on the server;
//! only the channel opener differs.

use crate::descriptor::{ChannelDescriptor, EndpointDescriptor};
use crate::endpoint::{Originator, Stub};
use crate::error::Result;
use crate::pump::{pump_streams, BoxedStream};
use crate::stats::ConnStats;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause after a transient accept failure before retrying
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Opens a new channel to the peer over the live control connection.
///
/// Implemented by both session sides; the stub relay never owns the session,
/// it only borrows this accessor, and dies when the session cancels it.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// Open a channel carrying `skeleton` as its endpoint descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error when the peer rejects the open or the control
    /// connection is gone.
    async fn open_channel(
        &self,
        skeleton: &EndpointDescriptor,
        originator: &Originator,
    ) -> Result<BoxedStream>;
}

/// Serve one bound stub until cancellation or exhaustion.
///
/// Each accepted connection runs on its own task so a slow channel open or
/// local dial never stalls the accept loop.
pub async fn serve_stub(
    route: usize,
    descriptor: ChannelDescriptor,
    mut stub: Stub,
    opener: Arc<dyn ChannelOpener>,
    stats: Arc<ConnStats>,
    cancel: CancellationToken,
) {
    let skeleton = descriptor.skeleton.clone();
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = stub.accept() => accepted,
        };
        match accepted {
            Ok(Some((conn, originator))) => {
                let conn_id = stats.open();
                tracing::debug!(
                    route,
                    conn = conn_id,
                    peer = %originator.host,
                    "stub connection accepted"
                );
                let skeleton = skeleton.clone();
                let opener = Arc::clone(&opener);
                let stats = Arc::clone(&stats);
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    relay_connection(route, conn_id, conn, originator, &skeleton, opener, &cancel)
                        .await;
                    stats.close();
                });
            }
            Ok(None) => {
                tracing::debug!(route, "stub exhausted");
                break;
            }
            Err(e) => {
                tracing::warn!(route, error = %e, "stub accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
    tracing::debug!(route, "stub listener stopped");
}

/// Carry one accepted connection through a freshly opened channel
async fn relay_connection(
    route: usize,
    conn_id: u64,
    external: BoxedStream,
    originator: Originator,
    skeleton: &EndpointDescriptor,
    opener: Arc<dyn ChannelOpener>,
    cancel: &CancellationToken,
) {
    let channel = match opener.open_channel(skeleton, &originator).await {
        Ok(channel) => channel,
        Err(e) => {
            // A rejected open closes the external connection and nothing else.
            tracing::info!(route, conn = conn_id, error = %e, "channel open rejected");
            return;
        }
    };
    tokio::select! {
        (sent, received, error) = pump_streams(external, channel) => {
            match error {
                Some(e) => tracing::debug!(
                    route, conn = conn_id, sent, received, error = %e,
                    "connection ended with error"
                ),
                None => tracing::debug!(
                    route, conn = conn_id, sent, received,
                    "connection closed"
                ),
            }
        }
        () = cancel.cancelled() => {
            tracing::debug!(route, conn = conn_id, "connection aborted by session teardown");
        }
    }
}

/// Bind a stub and spawn its relay, returning once the listener is live.
///
/// # Errors
///
/// Returns the bind error so a failed stub can fail the whole configuration
/// before anything is acknowledged.
pub async fn spawn_stub(
    route: usize,
    descriptor: ChannelDescriptor,
    env: &crate::endpoint::EndpointEnv,
    opener: Arc<dyn ChannelOpener>,
    cancel: CancellationToken,
) -> Result<()> {
    let stub = Stub::bind(&descriptor.stub, env).await?;
    if let Some(addr) = stub.local_addr() {
        tracing::info!(route, %addr, route_spec = %descriptor, "stub listening");
    } else {
        tracing::info!(route, route_spec = %descriptor, "stub listening");
    }
    let stats = Arc::clone(&env.stats);
    tokio::spawn(serve_stub(route, descriptor, stub, opener, stats, cancel));
    Ok(())
}
