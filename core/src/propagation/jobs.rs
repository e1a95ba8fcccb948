//! # Job Names & Payloads
//!
//! The four job kinds that flow between services, and the queue-name
//! scheme that addresses them. Queue names are `<service>.<job>`, so each
//! session-owning service drains its own copy of a fan-out independently:
//! a poison job in the profile store's queue cannot stall the post store.

use serde::{Deserialize, Serialize};

use crate::identity::Did;
use crate::rpc::ServiceName;

/// Job kind names. These are wire-visible (they appear in queue names and
/// operator tooling) and must stay stable.
pub const ADD_RECIPIENT_TO_SESSIONS: &str = "add-recipient-to-sessions";
pub const REVOKE_SESSION: &str = "revoke-session";
pub const DELETE_SESSION_KEYS: &str = "delete-session-keys";
pub const UPDATE_SESSION_KEYS: &str = "update-session-keys";

/// The queue name addressing one job kind at one service.
pub fn queue_name(service: ServiceName, job: &str) -> String {
    format!("{service}.{job}")
}

/// Fan a recipient into the author's recent sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRecipientJob {
    pub author_did: Did,
    pub recipient_did: Did,
}

/// Revoke the author's active sessions; optionally also drop one
/// recipient's keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeSessionJob {
    pub author_did: Did,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_did: Option<Did>,
}

/// Remove one recipient's keys from the author's sessions, unless the
/// pair re-trusted while this job waited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSessionKeysJob {
    pub author_did: Did,
    pub recipient_did: Did,
}

/// Migrate every session key referencing the previous keypair onto the
/// new one. `prev_private_key` is sealed at rest by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionKeysJob {
    pub prev_key_pair_id: String,
    pub new_key_pair_id: String,
    /// base64url ML-KEM-768 private key. Field-encrypted in the queue.
    pub prev_private_key: String,
    /// base64url ML-KEM-768 public key.
    pub new_public_key: String,
}

/// The payload fields of [`UpdateSessionKeysJob`] that must be ciphertext
/// at rest. Key name matches the serialized (camelCase) form.
pub const UPDATE_SESSION_KEYS_SEALED_FIELDS: &[&str] = &["prevPrivateKey"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_are_per_service() {
        assert_eq!(
            queue_name(ServiceName::PrivateSessions, ADD_RECIPIENT_TO_SESSIONS),
            "private-sessions.add-recipient-to-sessions"
        );
        assert_ne!(
            queue_name(ServiceName::PrivateSessions, REVOKE_SESSION),
            queue_name(ServiceName::PrivateProfiles, REVOKE_SESSION)
        );
    }

    #[test]
    fn sealed_field_name_matches_wire_form() {
        let job = UpdateSessionKeysJob {
            prev_key_pair_id: "a".into(),
            new_key_pair_id: "b".into(),
            prev_private_key: "secret".into(),
            new_public_key: "public".into(),
        };
        let value = serde_json::to_value(&job).unwrap();
        for field in UPDATE_SESSION_KEYS_SEALED_FIELDS {
            assert!(value.get(*field).is_some(), "missing {field}");
        }
    }
}
