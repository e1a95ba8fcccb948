//! # The Four Handlers
//!
//! `add-recipient-to-sessions`, `revoke-session`, `delete-session-keys`,
//! and `update-session-keys`. Each is a thin [`crate::queue::JobHandler`]
//! around reads from the service's own store, a trust or key call, the
//! recryption kernel, and idempotent writes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ROTATION_BATCH_SIZE;
use crate::crypto::{self, recrypt, KemPrivateKey, KemPublicKey};
use crate::error::{ApiError, ApiResult};
use crate::propagation::jobs::{
    AddRecipientJob, DeleteSessionKeysJob, RevokeSessionJob, UpdateSessionKeysJob,
};
use crate::propagation::PropagationContext;
use crate::queue::{Job, JobHandler, JobOutcome};

/// Fan a newly trusted recipient into the author's recent sessions.
pub struct AddRecipientHandler {
    ctx: Arc<PropagationContext>,
}

impl AddRecipientHandler {
    pub fn new(ctx: Arc<PropagationContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for AddRecipientHandler {
    async fn handle(&self, job: Job) -> ApiResult<JobOutcome> {
        let payload: AddRecipientJob = job.parse()?;
        let author = &payload.author_did;
        let recipient = &payload.recipient_did;

        // The bulk-add undo window exists precisely so this check can
        // observe a change of heart.
        if !self.ctx.graph.is_trusted(author, recipient).await? {
            return Ok(JobOutcome::abort("no longer trusted"));
        }

        // Candidate sessions: recent, readable by the author (there is a
        // DEK to recrypt from), not yet readable by the recipient.
        let mut work = Vec::new();
        for session in self
            .ctx
            .store
            .sessions_for_author(author, Some(self.ctx.window))?
        {
            let Some(author_row) = self.ctx.store.session_key(&session.id, author)? else {
                continue;
            };
            if self.ctx.store.session_key(&session.id, recipient)?.is_some() {
                continue;
            }
            work.push(author_row);
        }
        if work.is_empty() {
            return Ok(JobOutcome::Complete);
        }

        let mut key_pair_ids: Vec<String> =
            work.iter().map(|row| row.user_key_pair_id.clone()).collect();
        key_pair_ids.sort();
        key_pair_ids.dedup();

        // Both fetches are independent; overlap them.
        let (private_keys, recipient_key) = tokio::join!(
            self.ctx.keys.private_keys(author, &key_pair_ids),
            self.ctx.keys.current_public_key(recipient),
        );
        let private_keys = private_keys?;
        let (recipient_key_pair_id, recipient_public) = recipient_key?;

        for row in work {
            let author_private = private_keys.get(&row.user_key_pair_id).ok_or_else(|| {
                ApiError::Internal(format!(
                    "keystore returned no private key for referenced keypair {}",
                    row.user_key_pair_id
                ))
            })?;
            let new_dek = recrypt(&row.encrypted_dek, author_private, &recipient_public)
                .map_err(|e| ApiError::Internal(format!("recryption failed: {e}")))?;
            // A false return means another worker inserted first. Fine.
            self.ctx.store.add_recipient_key(
                &row.session_id,
                recipient,
                &new_dek,
                &recipient_key_pair_id,
            )?;
        }
        Ok(JobOutcome::Complete)
    }
}

/// Revoke the author's active sessions; with a recipient attached, also
/// drop that recipient's keys immediately.
pub struct RevokeSessionHandler {
    ctx: Arc<PropagationContext>,
}

impl RevokeSessionHandler {
    pub fn new(ctx: Arc<PropagationContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for RevokeSessionHandler {
    async fn handle(&self, job: Job) -> ApiResult<JobOutcome> {
        let payload: RevokeSessionJob = job.parse()?;
        let revoked = self.ctx.store.revoke_all_active(&payload.author_did)?;
        tracing::debug!(revoked, "revoked active sessions");
        if let Some(recipient) = &payload.recipient_did {
            self.ctx
                .store
                .delete_recipient_keys(&payload.author_did, recipient)?;
        }
        Ok(JobOutcome::Complete)
    }
}

/// Remove a recipient's keys from the author's sessions, unless the pair
/// re-trusted while this job waited out the undo delay.
pub struct DeleteSessionKeysHandler {
    ctx: Arc<PropagationContext>,
}

impl DeleteSessionKeysHandler {
    pub fn new(ctx: Arc<PropagationContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for DeleteSessionKeysHandler {
    async fn handle(&self, job: Job) -> ApiResult<JobOutcome> {
        let payload: DeleteSessionKeysJob = job.parse()?;
        // Destructive work re-checks the authority. A re-trust during the
        // delay turns this delete into a no-op instead of a data loss.
        if self
            .ctx
            .graph
            .is_trusted(&payload.author_did, &payload.recipient_did)
            .await?
        {
            return Ok(JobOutcome::abort("trusted again"));
        }
        let deleted = self
            .ctx
            .store
            .delete_recipient_keys(&payload.author_did, &payload.recipient_did)?;
        tracing::debug!(deleted, "deleted session keys");
        Ok(JobOutcome::Complete)
    }
}

/// Migrate every session key referencing a rotated-out keypair onto its
/// replacement, in bounded batches.
pub struct UpdateSessionKeysHandler {
    ctx: Arc<PropagationContext>,
}

impl UpdateSessionKeysHandler {
    pub fn new(ctx: Arc<PropagationContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for UpdateSessionKeysHandler {
    async fn handle(&self, job: Job) -> ApiResult<JobOutcome> {
        let payload: UpdateSessionKeysJob = job.parse()?;
        let prev_private = decode_private_key(&payload.prev_private_key)?;
        let new_public = decode_public_key(&payload.new_public_key)?;

        // Each migrated row leaves the scan set, so progress is monotone
        // and a crash mid-batch resumes from wherever it died.
        loop {
            let batch = self
                .ctx
                .store
                .scan_by_keypair(&payload.prev_key_pair_id, ROTATION_BATCH_SIZE)?;
            if batch.is_empty() {
                return Ok(JobOutcome::Complete);
            }
            for row in batch {
                let new_dek = recrypt(&row.encrypted_dek, &prev_private, &new_public)
                    .map_err(|e| ApiError::Internal(format!("recryption failed: {e}")))?;
                let updated = self.ctx.store.update_key(
                    &row.session_id,
                    &row.recipient_did,
                    &payload.prev_key_pair_id,
                    &payload.new_key_pair_id,
                    &new_dek,
                )?;
                if !updated {
                    // A concurrent migrator got here first; make sure the
                    // stale index entry cannot keep feeding the scan.
                    self.ctx.store.remove_stale_keypair_index(
                        &payload.prev_key_pair_id,
                        &row.session_id,
                        &row.recipient_did,
                    )?;
                }
            }
        }
    }
}

fn decode_private_key(b64: &str) -> ApiResult<KemPrivateKey> {
    let bytes = crypto::from_base64url(b64)
        .map_err(|e| ApiError::Validation(format!("bad private key encoding: {e}")))?;
    KemPrivateKey::from_bytes(&bytes).map_err(|e| ApiError::Validation(e.to_string()))
}

fn decode_public_key(b64: &str) -> ApiResult<KemPublicKey> {
    let bytes = crypto::from_base64url(b64)
        .map_err(|e| ApiError::Validation(format!("bad public key encoding: {e}")))?;
    KemPublicKey::from_bytes(&bytes).map_err(|e| ApiError::Validation(e.to_string()))
}
