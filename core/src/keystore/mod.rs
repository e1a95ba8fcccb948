//! # Keystore
//!
//! The `user-keys` service's store: one long-lived ML-KEM-768 keypair per
//! author, with rotation. The hard invariant is *exactly one current
//! keypair per author*; everything else in the system keys off it.
//!
//! ## Tree Layout
//!
//! | Tree       | Key                   | Value                  |
//! |------------|-----------------------|------------------------|
//! | `keypairs` | keypair id (UTF-8)    | `bincode(UserKeyPair)` |
//! | `current`  | author DID (UTF-8)    | keypair id (UTF-8)     |
//!
//! The `current` tree is the uniqueness invariant: there is one slot per
//! author, and every read-modify-write of that slot happens inside a
//! storage transaction spanning both trees. Concurrent get-or-create
//! callers race to fill the slot and the losers adopt the winner's
//! keypair. Tombstoned keypairs stay in `keypairs` forever; session keys
//! reference them by id long after rotation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Tree;
use uuid::Uuid;

use crate::clock::Clock;
use crate::crypto::{self, KemKeyPair};
use crate::error::{ApiError, ApiResult};
use crate::identity::Did;
use crate::propagation::jobs::{
    queue_name, UpdateSessionKeysJob, UPDATE_SESSION_KEYS, UPDATE_SESSION_KEYS_SEALED_FIELDS,
};
use crate::queue::{JobOptions, Queue};
use crate::rpc::ServiceName;
use crate::storage::SchemaDb;

/// One author keypair, current or tombstoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKeyPair {
    /// Opaque, stable id. Session keys reference it across schemas.
    pub id: String,
    pub author_did: Did,
    /// ML-KEM-768 public key bytes.
    pub public_key: Vec<u8>,
    /// ML-KEM-768 private key bytes.
    pub private_key: Vec<u8>,
    pub created_at_ms: i64,
    /// Set on rotation. A tombstoned keypair is never current again.
    pub deleted_at_ms: Option<i64>,
}

/// The keystore. Owns the `user_keys` schema and publishes rotation
/// migrations onto the queue.
pub struct KeyStore {
    keypairs: Tree,
    current: Tree,
    queue: Queue,
    clock: Clock,
    rotate_min_age: Duration,
}

impl KeyStore {
    pub fn new(
        db: &SchemaDb,
        queue: Queue,
        clock: Clock,
        rotate_min_age: Duration,
    ) -> ApiResult<Self> {
        Ok(Self {
            keypairs: db.open_tree("keypairs")?,
            current: db.open_tree("current")?,
            queue,
            clock,
            rotate_min_age,
        })
    }

    /// The author's current keypair, creating one if none exists.
    ///
    /// Generation happens before the transaction; if a concurrent caller
    /// fills the slot first, the freshly generated pair is discarded and
    /// the winner's pair is returned, so every caller observes the same
    /// keypair id.
    pub fn get_or_create(&self, author: &Did) -> ApiResult<UserKeyPair> {
        if let Some(existing) = self.current_keypair(author)? {
            return Ok(existing);
        }

        let generated = KemKeyPair::generate();
        let candidate = UserKeyPair {
            id: Uuid::new_v4().to_string(),
            author_did: author.clone(),
            public_key: generated.public.as_bytes().to_vec(),
            private_key: generated.private.as_bytes().to_vec(),
            created_at_ms: self.clock.now_ms(),
            deleted_at_ms: None,
        };
        let encoded = bincode::serialize(&candidate)?;

        let winner_id: Result<String, TransactionError<()>> = (&self.keypairs, &self.current)
            .transaction(|(keypairs, current)| {
                if let Some(existing_id) = current.get(author.as_str().as_bytes())? {
                    // Lost the race; adopt the winner.
                    return Ok(ivec_to_string(&existing_id));
                }
                keypairs.insert(candidate.id.as_bytes(), encoded.as_slice())?;
                current.insert(author.as_str().as_bytes(), candidate.id.as_bytes())?;
                Ok(candidate.id.clone())
            });

        let winner_id = winner_id.map_err(flatten_tx)?;
        if winner_id == candidate.id {
            Ok(candidate)
        } else {
            self.keypair_by_id(&winner_id)?
                .ok_or_else(|| ApiError::Internal("current points at missing keypair".into()))
        }
    }

    /// Current keypairs for a batch of authors. Authors without a keypair
    /// are omitted; tombstoned keypairs are never returned.
    pub fn get_public_keys(&self, authors: &[Did]) -> ApiResult<Vec<UserKeyPair>> {
        let mut out = Vec::with_capacity(authors.len());
        for author in authors {
            if let Some(pair) = self.current_keypair(author)? {
                out.push(pair);
            }
        }
        Ok(out)
    }

    /// Private keys for the requested keypair ids, restricted to the
    /// given author.
    ///
    /// Ids that do not exist or belong to someone else surface as the
    /// same `NotFound`. On top of that filter, the returned set is
    /// asserted to contain exactly one distinct owner DID equal to the
    /// request; a violation means the filter itself is broken and is a
    /// fatal internal error, not a client error.
    pub fn get_private_keys(&self, author: &Did, ids: &[String]) -> ApiResult<Vec<UserKeyPair>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let pair = self
                .keypair_by_id(id)?
                .filter(|p| &p.author_did == author)
                .ok_or_else(|| ApiError::NotFound("keypair not found".into()))?;
            out.push(pair);
        }

        let mut owners: Vec<&Did> = out.iter().map(|p| &p.author_did).collect();
        owners.dedup();
        if owners.len() > 1 || owners.iter().any(|d| *d != author) {
            return Err(ApiError::Internal(
                "private key response crosses author boundary".into(),
            ));
        }
        Ok(out)
    }

    /// Rotate the author's keypair to client-supplied material.
    ///
    /// Serialised per author by the transaction over the `current` slot:
    /// tombstone the old pair, insert the new one, repoint the slot. A
    /// current pair younger than the minimum age is a `Conflict`. On
    /// success, a key-migration job is published to every session-owning
    /// service with the previous private key sealed in the payload.
    pub fn rotate(
        &self,
        author: &Did,
        new_public_key: &[u8],
        new_private_key: &[u8],
    ) -> ApiResult<UserKeyPair> {
        // Length validation up front; bad material must never reach disk.
        crypto::KemPublicKey::from_bytes(new_public_key)
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        crypto::KemPrivateKey::from_bytes(new_private_key)
            .map_err(|e| ApiError::Validation(e.to_string()))?;

        let now_ms = self.clock.now_ms();
        let replacement = UserKeyPair {
            id: Uuid::new_v4().to_string(),
            author_did: author.clone(),
            public_key: new_public_key.to_vec(),
            private_key: new_private_key.to_vec(),
            created_at_ms: now_ms,
            deleted_at_ms: None,
        };
        let encoded = bincode::serialize(&replacement)?;
        let min_age_ms = self.rotate_min_age.as_millis() as i64;

        let previous: Result<Option<UserKeyPair>, TransactionError<ApiError>> =
            (&self.keypairs, &self.current).transaction(|(keypairs, current)| {
                let prev = match current.get(author.as_str().as_bytes())? {
                    Some(prev_id) => {
                        let raw = keypairs.get(&prev_id)?.ok_or_else(|| {
                            ConflictableTransactionError::Abort(ApiError::Internal(
                                "current points at missing keypair".into(),
                            ))
                        })?;
                        let mut prev: UserKeyPair =
                            bincode::deserialize(&raw).map_err(|e| {
                                ConflictableTransactionError::Abort(ApiError::Internal(format!(
                                    "corrupt keypair record: {e}"
                                )))
                            })?;
                        if now_ms - prev.created_at_ms < min_age_ms {
                            return Err(ConflictableTransactionError::Abort(ApiError::Conflict(
                                "current keypair is too recent to rotate".into(),
                            )));
                        }
                        prev.deleted_at_ms = Some(now_ms);
                        let tombstoned = bincode::serialize(&prev).map_err(|e| {
                            ConflictableTransactionError::Abort(ApiError::Internal(e.to_string()))
                        })?;
                        keypairs.insert(prev.id.as_bytes(), tombstoned)?;
                        Some(prev)
                    }
                    // First keypair for this author; nothing to migrate.
                    None => None,
                };
                keypairs.insert(replacement.id.as_bytes(), encoded.as_slice())?;
                current.insert(author.as_str().as_bytes(), replacement.id.as_bytes())?;
                Ok(prev)
            });

        let previous = previous.map_err(|e| match e {
            TransactionError::Abort(api) => api,
            TransactionError::Storage(s) => s.into(),
        })?;

        if let Some(prev) = previous {
            let job = UpdateSessionKeysJob {
                prev_key_pair_id: prev.id.clone(),
                new_key_pair_id: replacement.id.clone(),
                prev_private_key: crypto::to_base64url(&prev.private_key),
                new_public_key: crypto::to_base64url(&replacement.public_key),
            };
            let opts = JobOptions {
                encrypted_fields: UPDATE_SESSION_KEYS_SEALED_FIELDS.to_vec(),
                ..Default::default()
            };
            for service in ServiceName::SESSION_OWNERS {
                self.queue
                    .publish(&queue_name(service, UPDATE_SESSION_KEYS), &job, &opts)?;
            }
        }
        Ok(replacement)
    }

    /// The author's current keypair, if any.
    pub fn current_keypair(&self, author: &Did) -> ApiResult<Option<UserKeyPair>> {
        let Some(id) = self.current.get(author.as_str().as_bytes())? else {
            return Ok(None);
        };
        let pair = self
            .keypair_by_id(&ivec_to_string(&id))?
            .ok_or_else(|| ApiError::Internal("current points at missing keypair".into()))?;
        if pair.deleted_at_ms.is_some() {
            return Err(ApiError::Internal(
                "current points at tombstoned keypair".into(),
            ));
        }
        Ok(Some(pair))
    }

    /// Any keypair by id, current or tombstoned.
    pub fn keypair_by_id(&self, id: &str) -> ApiResult<Option<UserKeyPair>> {
        match self.keypairs.get(id.as_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }
}

fn ivec_to_string(ivec: &sled::IVec) -> String {
    String::from_utf8_lossy(ivec).into_owned()
}

fn flatten_tx(e: TransactionError<()>) -> ApiError {
    match e {
        TransactionError::Abort(()) => ApiError::Internal("transaction aborted".into()),
        TransactionError::Storage(s) => s.into(),
    }
}
