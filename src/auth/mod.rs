//! JWT minting for the tunnel's bearer-auth handshake.
//!
//! A thin layer over the [`crate::keystore::Signer`]: builds the claim set
//! the control plane expects and hands back a compact ES384 JWT.

use serde::Serialize;
use thiserror::Error;

use crate::keystore::{KeyStoreError, Signer};

const ISSUER: &str = "kd-client";
const AUDIENCE: &str = "p0.dev";
const TOKEN_LIFETIME_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("signer not initialized: {0}")]
    SignerNotInitialized(#[from] KeyStoreError),

    #[error("failed to encode JWT: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: [&'a str; 1],
    iat: i64,
    exp: i64,
    #[serde(rename = "tunnel-id")]
    tunnel_id: &'a str,
}

/// Mints short-lived (7 day) bearer tokens for the persistent tunnel.
pub struct TokenIssuer<'a> {
    signer: &'a Signer,
}

impl<'a> TokenIssuer<'a> {
    pub fn new(signer: &'a Signer) -> Self {
        Self { signer }
    }

    /// Mint a JWT for `client_id`, tagged with `tunnel_id` so the control
    /// plane can correlate concurrent connections from the same host.
    pub fn issue(&self, client_id: &str, tunnel_id: &str) -> Result<String, TokenError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: ISSUER,
            sub: client_id,
            aud: [AUDIENCE],
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
            tunnel_id,
        };

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::ES384);
        let token = jsonwebtoken::encode(&header, &claims, self.signer.encoding_key())?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeyStore;

    #[test]
    fn issued_token_has_three_segments_and_expected_claims() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::generate(dir.path()).unwrap();
        let issuer = TokenIssuer::new(store.signer());

        let token = issuer.issue("org:host:ssh", "tunnel-abc").unwrap();
        assert_eq!(token.split('.').count(), 3);

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, jsonwebtoken::Algorithm::ES384);
    }
}
