//! Durable site-scope token.

use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use tracing::info;

use crate::store::{BackendError, CacheBackend};

/// Cache slot holding the installation's scope token.
const TOKEN_SLOT: &str = "varnish-site-token";

/// Bytes of entropy behind the token; hex-encoded for transport.
const TOKEN_BYTES: usize = 20;

/// Provides the token that scopes cache entries and bans to this
/// installation when several share one caching proxy.
///
/// The token is generated once and persisted, so bans issued after a
/// restart still match headers recorded before it.
pub struct TokenStorage {
    backend: Arc<dyn CacheBackend>,
}

impl TokenStorage {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Returns the persisted token, generating and storing one on first use.
    pub fn get_token(&self) -> Result<String, BackendError> {
        if let Some(existing) = self.backend.get(TOKEN_SLOT)? {
            return Ok(String::from_utf8_lossy(&existing).into_owned());
        }

        let mut entropy = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut entropy);
        let token = hex::encode(entropy);

        self.backend
            .set(TOKEN_SLOT, Bytes::copy_from_slice(token.as_bytes()), &[], None)?;
        info!("Generated new site token");

        Ok(token)
    }
}
