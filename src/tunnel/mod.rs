//! Persistent tunnel client: dials the control plane, authenticates with a
//! bearer JWT, runs the JSON-RPC engine over the socket, and reconnects
//! with backoff on any non-fatal failure.
//!
//! A supervisor loop (`TunnelClient::run`) drives a single connection
//! attempt (`connect_and_run`), which spawns a dedicated writer task and a
//! heartbeat task and then reads frames until the socket closes.

pub mod backoff;
pub mod connector;
pub mod heartbeat;
pub mod writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::auth::{TokenError, TokenIssuer};
use crate::keystore::KeyStore;
use crate::rpc::RpcEngine;

use backoff::Backoff;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Mirrors the lifecycle spec.md §4.4 assigns the tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Established,
    Heartbeating,
    Reconnecting,
    Terminated,
}

/// Registers JSON-RPC method handlers on a freshly created engine. Called
/// again after every reconnect since each connection gets its own engine
/// bound to its own writer channel.
pub type MethodRegistrar = Arc<dyn Fn(&Arc<RpcEngine>) + Send + Sync>;

pub struct TunnelClient {
    tunnel_host: String,
    client_id: String,
    tunnel_id: String,
    heartbeat_interval: Duration,
    keystore: Arc<KeyStore>,
    tls_config: Arc<rustls::ClientConfig>,
    register_methods: MethodRegistrar,
    state_tx: watch::Sender<ConnectionState>,
    reconnecting: AtomicBool,
}

impl TunnelClient {
    pub fn new(
        tunnel_host: String,
        client_id: String,
        tunnel_id: String,
        heartbeat_interval: Duration,
        keystore: Arc<KeyStore>,
        register_methods: MethodRegistrar,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            tunnel_host,
            client_id,
            tunnel_id,
            heartbeat_interval,
            keystore,
            tls_config: Arc::new(connector::build_tls_config()),
            register_methods,
            state_tx,
            reconnecting: AtomicBool::new(false),
        })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// Supervisor loop: connect, run until disconnect, back off, repeat.
    /// Returns `Err(TunnelError::Authentication(_))` immediately on an
    /// auth-fatal rejection — the caller is expected to treat that as
    /// unrecoverable and not restart the process in a tight loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        loop {
            if *shutdown.borrow() {
                self.set_state(ConnectionState::Terminated);
                return Ok(());
            }

            // Coalesce: if another path already kicked off a reconnect,
            // this iteration just waits rather than dialing twice.
            if self
                .reconnecting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            let outcome = self.connect_and_run(&mut shutdown, &mut backoff).await;
            self.reconnecting.store(false, Ordering::SeqCst);

            match outcome {
                Ok(Shutdown) => {
                    self.set_state(ConnectionState::Terminated);
                    return Ok(());
                }
                Ok(Outcome::Disconnected) => {
                    warn!("tunnel disconnected, reconnecting");
                }
                Err(TunnelError::Authentication(reason)) => {
                    error!(reason = %reason, "tunnel authentication fatally rejected, not retrying");
                    self.set_state(ConnectionState::Terminated);
                    return Err(TunnelError::Authentication(reason));
                }
                Err(e) => {
                    warn!(error = %e, "tunnel connection lost");
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = backoff.next();
            info!(delay_ms = delay.as_millis(), "reconnecting tunnel");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    self.set_state(ConnectionState::Terminated);
                    return Ok(());
                }
            }
        }
    }

    async fn connect_and_run(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Result<Outcome, TunnelError> {
        self.set_state(ConnectionState::Connecting);

        let issuer = TokenIssuer::new(self.keystore.signer());
        let token = issuer.issue(&self.client_id, &self.tunnel_id)?;

        let stream = connector::dial(&self.tunnel_host, &token, &self.tls_config).await?;
        self.set_state(ConnectionState::Authenticating);

        let (sink, read) = stream.split();
        let (outbound, mut writer_handle) = writer::spawn_writer(sink);

        let rpc = RpcEngine::new(outbound);
        (self.register_methods)(&rpc);

        // The reader has to be pumping before any outbound `call` can
        // resolve, including the handshake call below -- its response
        // frame arrives on this same socket.
        let rpc_for_reader = Arc::clone(&rpc);
        let mut read_handle = tokio::spawn(async move {
            let mut read = read;
            read_loop(&mut read, &rpc_for_reader).await
        });

        // `setClientId` is the first message sent on every newly opened
        // tunnel; its completion is the precondition for Established
        // (spec.md §4.5/§5b). Only a fully successful handshake here
        // resets the backoff counter.
        if let Err(e) = rpc
            .call("setClientId", Some(json!({ "clientId": self.client_id })))
            .await
        {
            warn!(error = %e, "setClientId handshake failed, tearing down connection");
            read_handle.abort();
            rpc.close().await;
            return Err(TunnelError::Handshake(e.to_string()));
        }
        backoff.reset();
        info!(client_id = %self.client_id, "tunnel established");
        self.set_state(ConnectionState::Established);

        self.set_state(ConnectionState::Heartbeating);
        let mut hb_handle = heartbeat::spawn(
            Arc::clone(&rpc),
            self.client_id.clone(),
            self.heartbeat_interval,
            shutdown.clone(),
        );

        let outcome = tokio::select! {
            result = &mut read_handle => result.unwrap_or_else(|e| Err(TunnelError::Handshake(format!("reader task panicked: {e}")))),
            _ = &mut writer_handle => {
                warn!("tunnel writer task exited, reconnecting");
                Ok(Outcome::Disconnected)
            }
            _ = &mut hb_handle => {
                // Heartbeat task only ever exits early on a failed
                // `setClientId` call or shutdown; either way this
                // connection attempt is over. A failed heartbeat must
                // force exactly one reconnection cycle before the next
                // tick would have fired.
                warn!("heartbeat task exited, forcing reconnect");
                Ok(Outcome::Disconnected)
            }
            _ = shutdown.changed() => Ok(Outcome::Shutdown),
        };

        read_handle.abort();
        hb_handle.abort();
        rpc.close().await;
        self.set_state(ConnectionState::Disconnected);
        outcome
    }
}

enum Outcome {
    Shutdown,
    Disconnected,
}
use Outcome::Shutdown;

async fn read_loop(
    read: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
    rpc: &Arc<RpcEngine>,
) -> Result<Outcome, TunnelError> {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => rpc.handle_incoming(&text).await,
            Ok(Message::Close(_)) => {
                info!("tunnel closed by peer");
                return Ok(Outcome::Disconnected);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Binary(_)) => {
                warn!("ignoring unexpected binary frame on JSON-RPC tunnel");
            }
            Err(e) => return Err(TunnelError::WebSocket(e)),
        }
    }
    Ok(Outcome::Disconnected)
}
