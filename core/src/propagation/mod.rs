//! # Propagation Engine
//!
//! The job handlers that make the trust graph, the keystore, and the
//! session stores agree with each other. There are no foreign keys
//! between those schemas; there is only this module, running
//! at-least-once behind the queue.
//!
//! Every handler follows the same discipline:
//!
//! 1. **Re-derive, don't remember.** The job payload names the pair or
//!    keypair involved; everything else is read fresh from authoritative
//!    stores at execution time. A job delayed two minutes or retried two
//!    hours later still does the right thing.
//! 2. **Re-check before destroying.** Deleting keys and skipping adds
//!    both start with a live trust-edge check, which is what resolves the
//!    one genuinely non-commuting job pair (add-recipient vs
//!    delete-session-keys for the same pair).
//! 3. **Conflicts are victories.** A primary-key collision on insert
//!    means another worker finished first. That is completion, not error.
//!
//! The handlers are generic over where their collaborators live: in
//! production the trust re-check and key fetches cross service
//! boundaries over [`crate::rpc::client`], in tests and single-process
//! dev mode they hit the local stores through [`local`].

pub mod handlers;
pub mod jobs;
pub mod local;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::crypto::{KemPrivateKey, KemPublicKey};
use crate::error::ApiResult;
use crate::identity::Did;
use crate::queue::Worker;
use crate::rpc::ServiceName;
use crate::sessions::SessionStore;

pub use handlers::{
    AddRecipientHandler, DeleteSessionKeysHandler, RevokeSessionHandler, UpdateSessionKeysHandler,
};

/// The trust-graph question every destructive handler asks first.
#[async_trait]
pub trait TrustChecker: Send + Sync {
    async fn is_trusted(&self, author: &Did, recipient: &Did) -> ApiResult<bool>;
}

/// The keystore surface the propagation engine needs.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// The recipient's current public key, created if they have none yet.
    async fn current_public_key(&self, did: &Did) -> ApiResult<(String, KemPublicKey)>;

    /// The author's private keys for specific keypair ids, keyed by id.
    async fn private_keys(
        &self,
        did: &Did,
        key_pair_ids: &[String],
    ) -> ApiResult<HashMap<String, KemPrivateKey>>;
}

/// Everything one session-owning service's handlers need. Built once at
/// startup and shared; there is no global state behind it.
pub struct PropagationContext {
    /// Which session-owning service these handlers run inside.
    pub service: ServiceName,
    /// The service's own session store.
    pub store: Arc<SessionStore>,
    /// Trust re-checks, local or remote.
    pub graph: Arc<dyn TrustChecker>,
    /// Key fetches, local or remote.
    pub keys: Arc<dyn KeyFetcher>,
    /// Recency window for adding recipients to existing sessions.
    pub window: Duration,
}

/// The handler factory: wires one service's context into all four job
/// handlers and registers them under their queue names.
pub fn register_handlers(worker: &mut Worker, ctx: Arc<PropagationContext>) {
    let service = ctx.service;
    worker.register(
        jobs::queue_name(service, jobs::ADD_RECIPIENT_TO_SESSIONS),
        Arc::new(AddRecipientHandler::new(Arc::clone(&ctx))),
    );
    worker.register(
        jobs::queue_name(service, jobs::REVOKE_SESSION),
        Arc::new(RevokeSessionHandler::new(Arc::clone(&ctx))),
    );
    worker.register(
        jobs::queue_name(service, jobs::DELETE_SESSION_KEYS),
        Arc::new(DeleteSessionKeysHandler::new(Arc::clone(&ctx))),
    );
    worker.register(
        jobs::queue_name(service, jobs::UPDATE_SESSION_KEYS),
        Arc::new(UpdateSessionKeysHandler::new(ctx)),
    );
}
