//! # In-Process Collaborators
//!
//! [`TrustChecker`] and [`KeyFetcher`] implementations backed by local
//! stores. Dev mode runs all four services in one process and wires the
//! handlers straight to the stores; the integration tests do the same.
//! Production swaps these for the HTTP client in [`crate::rpc::client`]
//! without the handlers noticing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::crypto::{KemPrivateKey, KemPublicKey};
use crate::error::{ApiError, ApiResult};
use crate::graph::TrustGraph;
use crate::identity::Did;
use crate::keystore::KeyStore;
use crate::propagation::{KeyFetcher, TrustChecker};

/// Trust re-checks against a local [`TrustGraph`].
pub struct LocalTrust {
    graph: Arc<TrustGraph>,
}

impl LocalTrust {
    pub fn new(graph: Arc<TrustGraph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl TrustChecker for LocalTrust {
    async fn is_trusted(&self, author: &Did, recipient: &Did) -> ApiResult<bool> {
        self.graph.is_trusted(author, recipient)
    }
}

/// Key fetches against a local [`KeyStore`].
pub struct LocalKeys {
    keystore: Arc<KeyStore>,
}

impl LocalKeys {
    pub fn new(keystore: Arc<KeyStore>) -> Self {
        Self { keystore }
    }
}

#[async_trait]
impl KeyFetcher for LocalKeys {
    async fn current_public_key(&self, did: &Did) -> ApiResult<(String, KemPublicKey)> {
        let pair = self.keystore.get_or_create(did)?;
        let public = KemPublicKey::from_bytes(&pair.public_key)
            .map_err(|e| ApiError::Internal(format!("stored public key corrupt: {e}")))?;
        Ok((pair.id, public))
    }

    async fn private_keys(
        &self,
        did: &Did,
        key_pair_ids: &[String],
    ) -> ApiResult<HashMap<String, KemPrivateKey>> {
        let pairs = self.keystore.get_private_keys(did, key_pair_ids)?;
        let mut out = HashMap::with_capacity(pairs.len());
        for pair in pairs {
            let private = KemPrivateKey::from_bytes(&pair.private_key)
                .map_err(|e| ApiError::Internal(format!("stored private key corrupt: {e}")))?;
            out.insert(pair.id, private);
        }
        Ok(out)
    }
}
