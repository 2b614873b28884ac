//! Tunnel heartbeat: periodically issues an outbound `setClientId`
//! JSON-RPC call over the established connection, both to keep the
//! connection alive and to let the control plane confirm which client id
//! this tunnel currently represents.
//!
//! A `tokio::select!` loop races a sleep against a shutdown watch; failure
//! to complete the call forces exactly one reconnect rather than silently
//! retrying in place.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::rpc::RpcEngine;

/// Spawn the heartbeat task. Returns its `JoinHandle` so the caller can
/// detect it exiting early (e.g. because the RPC engine's outbound channel
/// closed) and trigger a reconnect.
pub fn spawn(
    rpc: Arc<RpcEngine>,
    client_id: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let params = json!({ "clientId": client_id });
                    match rpc.call("setClientId", Some(params)).await {
                        Ok(_) => debug!("heartbeat setClientId acknowledged"),
                        Err(e) => {
                            warn!(error = %e, "heartbeat setClientId failed, ending heartbeat task");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("heartbeat task shutting down");
                    break;
                }
            }
        }
    })
}
