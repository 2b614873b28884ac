//! ES384 key pair storage: load, generate, and expose a signing capability.
//!
//! Mirrors the restrictive-permission save/load idiom used for identity
//! keys elsewhere in the corpus (mode checks via `PermissionsExt`), but
//! speaks JWK JSON instead of raw bytes since the control plane consumes
//! the public key as a JWK.

use std::fs;
use std::path::{Path, PathBuf};

use p384::SecretKey;
use thiserror::Error;

const PRIVATE_JWK_FILE: &str = "jwk.private.json";
const PUBLIC_JWK_FILE: &str = "jwk.public.json";

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error(
        "key pair not found at {path}: {source}\nhint: run `kd-agent keygen --key-path {path}` to generate one"
    )]
    KeyNotFound {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key material at {path} is invalid: {reason}")]
    KeyInvalid { path: String, reason: String },

    #[error("failed to create key directory {path}: {source}")]
    DirectoryCreate {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key directory {path} is not writable: {source}")]
    DirectoryNotWritable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write key file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("signer was never initialized")]
    SignerNotInitialized,

    #[error("cryptographic signing failure: {0}")]
    CryptoFailure(String),
}

/// Capability exposed by a loaded [`KeyStore`]: signs JWTs and reports the
/// public JWK to embed in registration/identity payloads.
pub struct Signer {
    encoding_key: jsonwebtoken::EncodingKey,
    public_jwk: serde_json::Value,
}

impl Signer {
    pub fn encoding_key(&self) -> &jsonwebtoken::EncodingKey {
        &self.encoding_key
    }

    pub fn public_jwk(&self) -> &serde_json::Value {
        &self.public_jwk
    }
}

/// Loaded or generated ES384 key pair. Immutable after construction;
/// regeneration produces a brand new `KeyStore`, it never mutates one in
/// place.
pub struct KeyStore {
    signer: Signer,
}

impl KeyStore {
    /// Load `jwk.private.json` / `jwk.public.json` from `path`.
    pub fn load(path: &Path) -> Result<Self, KeyStoreError> {
        let private_path = path.join(PRIVATE_JWK_FILE);
        let public_path = path.join(PUBLIC_JWK_FILE);

        let private_raw = fs::read_to_string(&private_path).map_err(|source| {
            KeyStoreError::KeyNotFound {
                path: path.display().to_string(),
                source,
            }
        })?;
        let public_raw =
            fs::read_to_string(&public_path).map_err(|source| KeyStoreError::KeyNotFound {
                path: path.display().to_string(),
                source,
            })?;

        let public_jwk: serde_json::Value = serde_json::from_str(&public_raw).map_err(|e| {
            KeyStoreError::KeyInvalid {
                path: public_path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        let secret = SecretKey::from_jwk_str(&private_raw).map_err(|e| KeyStoreError::KeyInvalid {
            path: private_path.display().to_string(),
            reason: e.to_string(),
        })?;

        let encoding_key = encoding_key_from_secret(&secret, &private_path)?;

        Ok(Self {
            signer: Signer {
                encoding_key,
                public_jwk,
            },
        })
    }

    /// Generate a fresh P-384 keypair at `path`. Always succeeds when keys
    /// already exist there — regeneration invalidates prior control-plane
    /// registration, but it is the caller's job to warn about that; no
    /// backup of the previous material is made.
    pub fn generate(path: &Path) -> Result<Self, KeyStoreError> {
        ensure_key_dir(path)?;

        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let public = secret.public_key();

        let mut private_jwk: serde_json::Value = serde_json::from_str(
            &secret
                .to_jwk_string()
                .map_err(|e| KeyStoreError::CryptoFailure(e.to_string()))?,
        )
        .expect("p384 JWK serialization is always valid JSON");
        let mut public_jwk: serde_json::Value = serde_json::from_str(
            &public
                .to_jwk_string()
                .map_err(|e| KeyStoreError::CryptoFailure(e.to_string()))?,
        )
        .expect("p384 JWK serialization is always valid JSON");

        annotate_jwk(&mut private_jwk);
        annotate_jwk(&mut public_jwk);

        let private_path = path.join(PRIVATE_JWK_FILE);
        let public_path = path.join(PUBLIC_JWK_FILE);

        write_json(&private_path, &private_jwk, 0o400)?;
        write_json(&public_path, &public_jwk, 0o644)?;

        let encoding_key = encoding_key_from_secret(&secret, &private_path)?;

        Ok(Self {
            signer: Signer {
                encoding_key,
                public_jwk,
            },
        })
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }
}

/// `use: sig`, `alg: ES384` — RFC 7517 metadata the bare p384 JWK doesn't
/// carry on its own.
fn annotate_jwk(jwk: &mut serde_json::Value) {
    if let Some(obj) = jwk.as_object_mut() {
        obj.insert("use".to_string(), serde_json::Value::String("sig".into()));
        obj.insert(
            "alg".to_string(),
            serde_json::Value::String("ES384".into()),
        );
    }
}

fn encoding_key_from_secret(
    secret: &SecretKey,
    private_path: &Path,
) -> Result<jsonwebtoken::EncodingKey, KeyStoreError> {
    let pem = secret
        .to_pkcs8_pem(Default::default())
        .map_err(|e| KeyStoreError::KeyInvalid {
            path: private_path.display().to_string(),
            reason: e.to_string(),
        })?;
    jsonwebtoken::EncodingKey::from_ec_pem(pem.as_bytes()).map_err(|e| {
        KeyStoreError::CryptoFailure(format!("failed to build ES384 signing key: {e}"))
    })
}

fn ensure_key_dir(path: &Path) -> Result<(), KeyStoreError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|source| KeyStoreError::DirectoryCreate {
            path: path.display().to_string(),
            source,
        })?;
        set_mode(path, 0o700).map_err(|source| KeyStoreError::DirectoryCreate {
            path: path.display().to_string(),
            source,
        })?;
    }

    let probe = path.join(".kd-agent-write-probe");
    fs::write(&probe, b"probe").map_err(|source| KeyStoreError::DirectoryNotWritable {
        path: path.display().to_string(),
        source,
    })?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

fn write_json(path: &PathBuf, value: &serde_json::Value, mode: u32) -> Result<(), KeyStoreError> {
    let content = serde_json::to_vec_pretty(value).expect("serde_json::Value always serializes");
    fs::write(path, content).map_err(|source| KeyStoreError::Write {
        path: path.display().to_string(),
        source,
    })?;
    set_mode(path, mode).map_err(|source| KeyStoreError::Write {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::generate(dir.path()).unwrap();
        assert_eq!(
            store.signer().public_jwk()["alg"].as_str(),
            Some("ES384")
        );

        let loaded = KeyStore::load(dir.path()).unwrap();
        assert_eq!(
            loaded.signer().public_jwk(),
            store.signer().public_jwk()
        );
    }

    #[test]
    fn load_missing_reports_hint() {
        let dir = tempfile::tempdir().unwrap();
        let err = KeyStore::load(dir.path()).unwrap_err();
        assert!(matches!(err, KeyStoreError::KeyNotFound { .. }));
        assert!(err.to_string().contains("keygen"));
    }
}
