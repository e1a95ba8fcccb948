//! # Session Store
//!
//! Per-author sessions and their per-recipient encrypted DEKs. Two
//! instances of this store run in production, one inside each
//! session-owning service (posts and profiles); they differ only in
//! configuration, never in shape.
//!
//! A session is a bundle: one `Session` row and one `SessionKey` row per
//! recipient, each key row carrying the session DEK encrypted to that
//! recipient's keypair. The author is always among the recipients; a
//! session the author cannot read is a bug upstream and is rejected at
//! creation.
//!
//! ## Tree Layout
//!
//! | Tree         | Key                                       | Value                 |
//! |--------------|-------------------------------------------|-----------------------|
//! | `sessions`   | session id (UTF-8)                        | `bincode(Session)`    |
//! | `by_author`  | author ‖ NUL ‖ created ts (BE) ‖ NUL ‖ id | ()                    |
//! | `keys`       | session id ‖ NUL ‖ recipient              | `bincode(SessionKey)` |
//! | `by_keypair` | keypair id ‖ NUL ‖ session id ‖ NUL ‖ recipient | ()              |
//!
//! `by_author` leads with a big-endian timestamp so the recency-window
//! scan the propagation engine runs is one bounded range read.
//! `by_keypair` is the rotation driver: every key row is findable by the
//! keypair that encrypted it, and migrating a row moves its index entry,
//! so a crashed migration resumes exactly where it died.

use serde::{Deserialize, Serialize};
use sled::transaction::{TransactionError, Transactional};
use sled::Tree;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::crypto::envelope::{self, Envelope};
use crate::error::{ApiError, ApiResult};
use crate::identity::Did;
use crate::storage::{composite_key, millis_be, SchemaDb};

/// One session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub author_did: Did,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub revoked_at_ms: Option<i64>,
}

impl Session {
    /// Active = not revoked and not past expiry.
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.revoked_at_ms.is_none() && self.expires_at_ms > now_ms
    }
}

/// One recipient's encrypted copy of a session DEK.
///
/// `user_key_pair_id` always names the keypair whose public key produced
/// `encrypted_dek`; the two fields only ever change together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKey {
    pub session_id: String,
    pub recipient_did: Did,
    /// base64url `KEMv1|` envelope.
    pub encrypted_dek: String,
    pub user_key_pair_id: String,
}

/// Input for one recipient key at session creation.
#[derive(Debug, Clone)]
pub struct NewSessionKey {
    pub recipient_did: Did,
    pub encrypted_dek: String,
    pub user_key_pair_id: String,
}

/// The session store. One instance per session-owning service.
pub struct SessionStore {
    sessions: Tree,
    by_author: Tree,
    keys: Tree,
    by_keypair: Tree,
    clock: Clock,
}

impl SessionStore {
    pub fn new(db: &SchemaDb, clock: Clock) -> ApiResult<Self> {
        Ok(Self {
            sessions: db.open_tree("sessions")?,
            by_author: db.open_tree("by_author")?,
            keys: db.open_tree("keys")?,
            by_keypair: db.open_tree("by_keypair")?,
            clock,
        })
    }

    /// Create a session with its full recipient key set, atomically.
    ///
    /// The author's own key row is mandatory: without it there is no DEK
    /// to recrypt from when the trust graph later grows. Every envelope
    /// is structurally validated before anything is written.
    pub fn create_session(
        &self,
        author: &Did,
        expires_at_ms: i64,
        new_keys: &[NewSessionKey],
    ) -> ApiResult<Session> {
        if !new_keys.iter().any(|k| &k.recipient_did == author) {
            return Err(ApiError::Validation(
                "session must include the author's own key".into(),
            ));
        }
        for key in new_keys {
            let bytes = envelope::decode_wire(&key.encrypted_dek)
                .map_err(|e| ApiError::Validation(format!("bad envelope: {e}")))?;
            Envelope::parse(&bytes)
                .map_err(|e| ApiError::Validation(format!("bad envelope: {e}")))?;
        }

        let now_ms = self.clock.now_ms();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            author_did: author.clone(),
            created_at_ms: now_ms,
            expires_at_ms,
            revoked_at_ms: None,
        };
        let session_v = bincode::serialize(&session)?;
        let author_k = author_key(author, now_ms, &session.id);

        let rows: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = new_keys
            .iter()
            .map(|input| {
                let row = SessionKey {
                    session_id: session.id.clone(),
                    recipient_did: input.recipient_did.clone(),
                    encrypted_dek: input.encrypted_dek.clone(),
                    user_key_pair_id: input.user_key_pair_id.clone(),
                };
                Ok((
                    key_row_key(&session.id, &input.recipient_did),
                    bincode::serialize(&row)?,
                    keypair_index_key(&input.user_key_pair_id, &session.id, &input.recipient_did),
                ))
            })
            .collect::<ApiResult<_>>()?;

        // Key rows land first; the session row is the commit point. A
        // crash in between leaves key rows pointing at a session id that
        // never existed, which no read path can reach.
        let keys_result: Result<(), TransactionError<()>> = (&self.keys, &self.by_keypair)
            .transaction(|(keys_t, by_keypair_t)| {
                for (key_k, key_v, idx_k) in &rows {
                    keys_t.insert(key_k.as_slice(), key_v.as_slice())?;
                    by_keypair_t.insert(idx_k.as_slice(), &[][..])?;
                }
                Ok(())
            });
        keys_result.map_err(|e| match e {
            TransactionError::Abort(()) => ApiError::Internal("session keys insert aborted".into()),
            TransactionError::Storage(s) => s.into(),
        })?;

        let result: Result<(), TransactionError<()>> = (&self.sessions, &self.by_author)
            .transaction(|(sessions_t, by_author_t)| {
                sessions_t.insert(session.id.as_bytes(), session_v.as_slice())?;
                by_author_t.insert(author_k.as_slice(), &[][..])?;
                Ok(())
            });
        result.map_err(|e| match e {
            TransactionError::Abort(()) => ApiError::Internal("session insert aborted".into()),
            TransactionError::Storage(s) => s.into(),
        })?;
        Ok(session)
    }

    /// Revoke every active session of an author. Idempotent; returns the
    /// number of sessions newly revoked.
    pub fn revoke_all_active(&self, author: &Did) -> ApiResult<usize> {
        let now_ms = self.clock.now_ms();
        let mut revoked = 0;
        for session in self.sessions_for_author(author, None)? {
            if !session.is_active(now_ms) {
                continue;
            }
            let mut updated = session.clone();
            updated.revoked_at_ms = Some(now_ms);
            self.sessions
                .insert(session.id.as_bytes(), bincode::serialize(&updated)?)?;
            revoked += 1;
        }
        Ok(revoked)
    }

    /// Insert one recipient key row; a no-op when the row already exists
    /// (another worker, or a previous delivery of the same job, won).
    pub fn add_recipient_key(
        &self,
        session_id: &str,
        recipient: &Did,
        encrypted_dek: &str,
        user_key_pair_id: &str,
    ) -> ApiResult<bool> {
        if self.session(session_id)?.is_none() {
            return Err(ApiError::NotFound("session not found".into()));
        }
        let row = SessionKey {
            session_id: session_id.to_string(),
            recipient_did: recipient.clone(),
            encrypted_dek: encrypted_dek.to_string(),
            user_key_pair_id: user_key_pair_id.to_string(),
        };
        let key_k = key_row_key(session_id, recipient);
        let key_v = bincode::serialize(&row)?;
        let idx_k = keypair_index_key(user_key_pair_id, session_id, recipient);

        let inserted: Result<bool, TransactionError<()>> = (&self.keys, &self.by_keypair)
            .transaction(|(keys_t, by_keypair_t)| {
                if keys_t.get(key_k.as_slice())?.is_some() {
                    return Ok(false);
                }
                keys_t.insert(key_k.as_slice(), key_v.as_slice())?;
                by_keypair_t.insert(idx_k.as_slice(), &[][..])?;
                Ok(true)
            });
        inserted.map_err(|e| match e {
            TransactionError::Abort(()) => ApiError::Internal("key insert aborted".into()),
            TransactionError::Storage(s) => s.into(),
        })
    }

    /// Delete every key row addressed to `recipient` across all of the
    /// author's sessions. Returns the number deleted.
    pub fn delete_recipient_keys(&self, author: &Did, recipient: &Did) -> ApiResult<usize> {
        let mut deleted = 0;
        for session in self.sessions_for_author(author, None)? {
            let key_k = key_row_key(&session.id, recipient);
            let Some(raw) = self.keys.get(&key_k)? else {
                continue;
            };
            let row: SessionKey = bincode::deserialize(&raw)?;
            let idx_k = keypair_index_key(&row.user_key_pair_id, &session.id, recipient);

            let result: Result<(), TransactionError<()>> = (&self.keys, &self.by_keypair)
                .transaction(|(keys_t, by_keypair_t)| {
                    keys_t.remove(key_k.as_slice())?;
                    by_keypair_t.remove(idx_k.as_slice())?;
                    Ok(())
                });
            result.map_err(|e| match e {
                TransactionError::Abort(()) => ApiError::Internal("key delete aborted".into()),
                TransactionError::Storage(s) => s.into(),
            })?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Key rows still referencing a keypair, up to `limit`. The rotation
    /// driver: migrated rows leave this result set, so repeated calls
    /// walk the full set even across crashes.
    pub fn scan_by_keypair(&self, key_pair_id: &str, limit: usize) -> ApiResult<Vec<SessionKey>> {
        let prefix = composite_key(&[key_pair_id.as_bytes(), &[]]);
        let mut out = Vec::new();
        for entry in self.by_keypair.scan_prefix(&prefix) {
            if out.len() >= limit {
                break;
            }
            let (idx_k, _) = entry?;
            // Index key layout: kp ‖ NUL ‖ session ‖ NUL ‖ recipient.
            let rest = &idx_k[prefix.len()..];
            let Some(sep) = rest.iter().position(|&b| b == 0) else {
                return Err(ApiError::Internal("corrupt keypair index".into()));
            };
            let row_k = composite_key(&[&rest[..sep], &rest[sep + 1..]]);
            match self.keys.get(&row_k)? {
                Some(raw) => out.push(bincode::deserialize(&raw)?),
                // Row deleted between index scan and load; the index entry
                // is stale and can go.
                None => {
                    self.by_keypair.remove(&idx_k)?;
                }
            }
        }
        Ok(out)
    }

    /// Atomically re-point one key row at a new keypair with a freshly
    /// recrypted DEK. Returns false when the row no longer references
    /// `prev_key_pair_id` (a concurrent migrator won, or the row is gone).
    pub fn update_key(
        &self,
        session_id: &str,
        recipient: &Did,
        prev_key_pair_id: &str,
        new_key_pair_id: &str,
        new_encrypted_dek: &str,
    ) -> ApiResult<bool> {
        let key_k = key_row_key(session_id, recipient);
        let old_idx = keypair_index_key(prev_key_pair_id, session_id, recipient);
        let new_idx = keypair_index_key(new_key_pair_id, session_id, recipient);

        let updated: Result<bool, TransactionError<ApiError>> = (&self.keys, &self.by_keypair)
            .transaction(|(keys_t, by_keypair_t)| {
                let Some(raw) = keys_t.get(key_k.as_slice())? else {
                    return Ok(false);
                };
                let mut row: SessionKey = bincode::deserialize(&raw).map_err(|e| {
                    sled::transaction::ConflictableTransactionError::Abort(ApiError::Internal(
                        format!("corrupt session key row: {e}"),
                    ))
                })?;
                if row.user_key_pair_id != prev_key_pair_id {
                    return Ok(false);
                }
                row.encrypted_dek = new_encrypted_dek.to_string();
                row.user_key_pair_id = new_key_pair_id.to_string();
                let row_v = bincode::serialize(&row).map_err(|e| {
                    sled::transaction::ConflictableTransactionError::Abort(ApiError::Internal(
                        e.to_string(),
                    ))
                })?;
                keys_t.insert(key_k.as_slice(), row_v)?;
                by_keypair_t.remove(old_idx.as_slice())?;
                by_keypair_t.insert(new_idx.as_slice(), &[][..])?;
                Ok(true)
            });
        updated.map_err(|e| match e {
            TransactionError::Abort(api) => api,
            TransactionError::Storage(s) => s.into(),
        })
    }

    /// Drop a keypair-index entry that no longer matches its row. Only
    /// the rotation handler calls this, and only for entries it has just
    /// observed to be stale.
    pub fn remove_stale_keypair_index(
        &self,
        key_pair_id: &str,
        session_id: &str,
        recipient: &Did,
    ) -> ApiResult<()> {
        self.by_keypair
            .remove(keypair_index_key(key_pair_id, session_id, recipient))?;
        Ok(())
    }

    /// Sessions for an author, newest window first when bounded. `None`
    /// returns everything.
    pub fn sessions_for_author(
        &self,
        author: &Did,
        window: Option<Duration>,
    ) -> ApiResult<Vec<Session>> {
        let prefix = composite_key(&[author.as_str().as_bytes(), &[]]);
        let start = match window {
            Some(window) => {
                let cutoff_ms = self.clock.now_ms() - window.as_millis() as i64;
                let mut k = prefix.clone();
                k.extend_from_slice(&millis_be(cutoff_ms.max(0)));
                k
            }
            None => prefix.clone(),
        };
        let mut end = prefix.clone();
        end.push(0xFF);

        let mut out = Vec::new();
        for entry in self.by_author.range(start..end) {
            let (idx_k, _) = entry?;
            // Index key layout: author ‖ NUL ‖ ts ‖ NUL ‖ session id.
            let id_start = prefix.len() + 8 + 1;
            if idx_k.len() <= id_start {
                return Err(ApiError::Internal("corrupt author-session index".into()));
            }
            let session_id = String::from_utf8_lossy(&idx_k[id_start..]).into_owned();
            let session = self
                .session(&session_id)?
                .ok_or_else(|| ApiError::Internal("author index points at missing session".into()))?;
            out.push(session);
        }
        Ok(out)
    }

    /// One session by id.
    pub fn session(&self, session_id: &str) -> ApiResult<Option<Session>> {
        match self.sessions.get(session_id.as_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// One key row by (session, recipient).
    pub fn session_key(&self, session_id: &str, recipient: &Did) -> ApiResult<Option<SessionKey>> {
        match self.keys.get(key_row_key(session_id, recipient))? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// All key rows of one session.
    pub fn session_keys(&self, session_id: &str) -> ApiResult<Vec<SessionKey>> {
        let prefix = composite_key(&[session_id.as_bytes(), &[]]);
        let mut out = Vec::new();
        for entry in self.keys.scan_prefix(&prefix) {
            let (_, raw) = entry?;
            out.push(bincode::deserialize(&raw)?);
        }
        Ok(out)
    }
}

fn key_row_key(session_id: &str, recipient: &Did) -> Vec<u8> {
    composite_key(&[session_id.as_bytes(), recipient.as_str().as_bytes()])
}

fn keypair_index_key(key_pair_id: &str, session_id: &str, recipient: &Did) -> Vec<u8> {
    composite_key(&[
        key_pair_id.as_bytes(),
        session_id.as_bytes(),
        recipient.as_str().as_bytes(),
    ])
}

fn author_key(author: &Did, created_at_ms: i64, session_id: &str) -> Vec<u8> {
    composite_key(&[
        author.as_str().as_bytes(),
        &millis_be(created_at_ms),
        session_id.as_bytes(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encrypt_dek, kem::KemKeyPair};

    fn did(s: &str) -> Did {
        Did::new(s).unwrap()
    }

    fn store() -> (SessionStore, Clock) {
        let clock = Clock::manual(1_700_000_000_000);
        let db = SchemaDb::open_temporary().unwrap();
        (SessionStore::new(&db, clock.clone()).unwrap(), clock)
    }

    fn envelope_for(pair: &KemKeyPair) -> String {
        encrypt_dek(&[7u8; 32], &pair.public)
    }

    fn author_session(store: &SessionStore, author: &Did, kp_id: &str) -> Session {
        let pair = KemKeyPair::generate();
        store
            .create_session(
                author,
                store.clock.now_ms() + 86_400_000,
                &[NewSessionKey {
                    recipient_did: author.clone(),
                    encrypted_dek: envelope_for(&pair),
                    user_key_pair_id: kp_id.to_string(),
                }],
            )
            .unwrap()
    }

    #[test]
    fn create_requires_author_key() {
        let (store, clock) = store();
        let alice = did("did:plc:alice");
        let bob = did("did:plc:bob");
        let pair = KemKeyPair::generate();

        let err = store
            .create_session(
                &alice,
                clock.now_ms() + 1000,
                &[NewSessionKey {
                    recipient_did: bob,
                    encrypted_dek: envelope_for(&pair),
                    user_key_pair_id: "kp".into(),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn create_rejects_garbage_envelopes() {
        let (store, clock) = store();
        let alice = did("did:plc:alice");
        let err = store
            .create_session(
                &alice,
                clock.now_ms() + 1000,
                &[NewSessionKey {
                    recipient_did: alice.clone(),
                    encrypted_dek: "bm90IGFuIGVudmVsb3Bl".into(),
                    user_key_pair_id: "kp".into(),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn create_and_read_back() {
        let (store, _clock) = store();
        let alice = did("did:plc:alice");
        let session = author_session(&store, &alice, "kp-1");

        let loaded = store.session(&session.id).unwrap().unwrap();
        assert_eq!(loaded.author_did, alice);
        assert!(loaded.is_active(store.clock.now_ms()));

        let key = store.session_key(&session.id, &alice).unwrap().unwrap();
        assert_eq!(key.user_key_pair_id, "kp-1");
    }

    #[test]
    fn revoke_all_is_idempotent_and_terminal() {
        let (store, clock) = store();
        let alice = did("did:plc:alice");
        let session = author_session(&store, &alice, "kp-1");

        assert_eq!(store.revoke_all_active(&alice).unwrap(), 1);
        assert_eq!(store.revoke_all_active(&alice).unwrap(), 0);

        let loaded = store.session(&session.id).unwrap().unwrap();
        assert!(!loaded.is_active(clock.now_ms()));
        assert!(loaded.revoked_at_ms.is_some());
    }

    #[test]
    fn expiry_deactivates_without_revocation() {
        let (store, clock) = store();
        let alice = did("did:plc:alice");
        let session = author_session(&store, &alice, "kp-1");

        clock.advance_ms(86_400_000 + 1);
        let loaded = store.session(&session.id).unwrap().unwrap();
        assert!(!loaded.is_active(clock.now_ms()));
        assert!(loaded.revoked_at_ms.is_none());
        // Nothing active left to revoke.
        assert_eq!(store.revoke_all_active(&alice).unwrap(), 0);
    }

    #[test]
    fn add_recipient_key_is_insert_or_ignore() {
        let (store, _clock) = store();
        let alice = did("did:plc:alice");
        let bob = did("did:plc:bob");
        let session = author_session(&store, &alice, "kp-1");
        let bob_pair = KemKeyPair::generate();
        let dek = envelope_for(&bob_pair);

        assert!(store
            .add_recipient_key(&session.id, &bob, &dek, "kp-bob")
            .unwrap());
        // Second delivery of the same job: no-op, not an error.
        assert!(!store
            .add_recipient_key(&session.id, &bob, &dek, "kp-bob")
            .unwrap());
        assert_eq!(store.session_keys(&session.id).unwrap().len(), 2);
    }

    #[test]
    fn add_recipient_key_to_missing_session_is_not_found() {
        let (store, _clock) = store();
        let err = store
            .add_recipient_key("no-such-session", &did("did:plc:bob"), "x", "kp")
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn delete_recipient_keys_spares_other_recipients() {
        let (store, _clock) = store();
        let alice = did("did:plc:alice");
        let bob = did("did:plc:bob");
        let carol = did("did:plc:carol");
        let s1 = author_session(&store, &alice, "kp-1");
        let s2 = author_session(&store, &alice, "kp-1");
        for s in [&s1, &s2] {
            let pair = KemKeyPair::generate();
            store
                .add_recipient_key(&s.id, &bob, &envelope_for(&pair), "kp-bob")
                .unwrap();
            store
                .add_recipient_key(&s.id, &carol, &envelope_for(&pair), "kp-carol")
                .unwrap();
        }

        assert_eq!(store.delete_recipient_keys(&alice, &bob).unwrap(), 2);
        for s in [&s1, &s2] {
            assert!(store.session_key(&s.id, &bob).unwrap().is_none());
            assert!(store.session_key(&s.id, &carol).unwrap().is_some());
            assert!(store.session_key(&s.id, &alice).unwrap().is_some());
        }
        // And the rotation index no longer mentions bob's rows.
        assert!(store.scan_by_keypair("kp-bob", 10).unwrap().is_empty());
    }

    #[test]
    fn window_scan_excludes_old_sessions() {
        let (store, clock) = store();
        let alice = did("did:plc:alice");
        let old = author_session(&store, &alice, "kp-1");
        clock.advance_ms(40 * 86_400_000); // 40 days
        let recent = author_session(&store, &alice, "kp-1");

        let in_window = store
            .sessions_for_author(&alice, Some(Duration::from_secs(30 * 86_400)))
            .unwrap();
        assert_eq!(in_window.len(), 1);
        assert_eq!(in_window[0].id, recent.id);

        let all = store.sessions_for_author(&alice, None).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|s| s.id == old.id));
    }

    #[test]
    fn update_key_migrates_row_and_index_together() {
        let (store, _clock) = store();
        let alice = did("did:plc:alice");
        let session = author_session(&store, &alice, "kp-old");
        let new_pair = KemKeyPair::generate();
        let new_dek = envelope_for(&new_pair);

        assert!(store
            .update_key(&session.id, &alice, "kp-old", "kp-new", &new_dek)
            .unwrap());

        let row = store.session_key(&session.id, &alice).unwrap().unwrap();
        assert_eq!(row.user_key_pair_id, "kp-new");
        assert_eq!(row.encrypted_dek, new_dek);
        assert!(store.scan_by_keypair("kp-old", 10).unwrap().is_empty());
        assert_eq!(store.scan_by_keypair("kp-new", 10).unwrap().len(), 1);
    }

    #[test]
    fn update_key_loses_gracefully_to_a_prior_migration() {
        let (store, _clock) = store();
        let alice = did("did:plc:alice");
        let session = author_session(&store, &alice, "kp-old");
        let new_pair = KemKeyPair::generate();
        let new_dek = envelope_for(&new_pair);

        assert!(store
            .update_key(&session.id, &alice, "kp-old", "kp-new", &new_dek)
            .unwrap());
        // Replaying the same migration: the row no longer references
        // kp-old, so this must be a no-op "false", not corruption.
        assert!(!store
            .update_key(&session.id, &alice, "kp-old", "kp-new", &new_dek)
            .unwrap());
    }

    #[test]
    fn scan_by_keypair_respects_batch_limit() {
        let (store, _clock) = store();
        let alice = did("did:plc:alice");
        for _ in 0..5 {
            author_session(&store, &alice, "kp-batch");
        }
        assert_eq!(store.scan_by_keypair("kp-batch", 3).unwrap().len(), 3);
        assert_eq!(store.scan_by_keypair("kp-batch", 100).unwrap().len(), 5);
    }
}
