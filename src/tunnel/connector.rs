//! Dials the control plane's WebSocket tunnel endpoint with a bearer JWT,
//! distinguishing an auth-fatal handshake rejection (401/403) from any
//! other connect failure so the caller can skip backoff and bail out.

use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{self, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;

use super::TunnelError;

pub type TunnelStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Build rustls `ClientConfig` with the platform's webpki root store.
pub fn build_tls_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Dial `tunnel_host` (a `ws://` or `wss://` base URL) and perform the
/// WebSocket upgrade, presenting `token` as a bearer credential.
pub async fn dial(
    tunnel_host: &str,
    token: &str,
    tls_config: &Arc<rustls::ClientConfig>,
) -> Result<TunnelStream, TunnelError> {
    let url = format!("{}/api/v1/tunnel", tunnel_host.trim_end_matches('/'));
    info!(url = %url, "dialing control-plane tunnel");

    let mut request = url
        .clone()
        .into_client_request()
        .map_err(|e| TunnelError::Handshake(e.to_string()))?;
    request.headers_mut().insert(
        "Authorization",
        http::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TunnelError::Handshake(e.to_string()))?,
    );

    let connector = tokio_tungstenite::Connector::Rustls(Arc::clone(tls_config));
    let ws_config = WebSocketConfig {
        max_frame_size: Some(16 << 20),
        max_message_size: Some(16 << 20),
        ..Default::default()
    };

    let connect = tokio_tungstenite::connect_async_tls_with_config(
        request,
        Some(ws_config),
        false,
        Some(connector),
    );

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, connect).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(classify_handshake_error(e)),
        Err(_) => Err(TunnelError::Handshake(format!(
            "handshake timed out after {}s",
            HANDSHAKE_TIMEOUT.as_secs()
        ))),
    }
}

fn classify_handshake_error(err: tokio_tungstenite::tungstenite::Error) -> TunnelError {
    use tokio_tungstenite::tungstenite::Error;
    if let Error::Http(response) = &err {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return TunnelError::Authentication(format!(
                "control plane rejected credentials: HTTP {status}"
            ));
        }
    }
    TunnelError::WebSocket(err)
}
