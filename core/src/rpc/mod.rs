//! # Inter-service RPC
//!
//! Type-safe definitions for the XRPC surface the services speak, both to
//! users and to each other. This module defines the method names, the
//! request/response types (the IDL), and the schema registry; the HTTP
//! client lives in [`client`] and the server routing lives in the node
//! binary.
//!
//! ## Method Index
//!
//! | Method                                      | Auth     | Description                      |
//! |---------------------------------------------|----------|----------------------------------|
//! | `social.spkeasy.graph.getTrusted`           | user     | List active trust edges          |
//! | `social.spkeasy.graph.addTrusted`           | user     | Trust one recipient              |
//! | `social.spkeasy.graph.bulkAddTrusted`       | user     | Trust many recipients            |
//! | `social.spkeasy.graph.removeTrusted`        | user     | Untrust one recipient            |
//! | `social.spkeasy.graph.bulkRemoveTrusted`    | user     | Untrust many recipients          |
//! | `social.spkeasy.key.getPublicKey`           | any      | Current public key (create if none) |
//! | `social.spkeasy.key.getPublicKeys`          | any      | Batch public keys                |
//! | `social.spkeasy.key.getPrivateKey`          | service  | One private key by id            |
//! | `social.spkeasy.key.getPrivateKeys`         | service  | Author's private keys by id      |
//! | `social.spkeasy.key.rotate`                 | user     | Rotate the author's keypair      |
//! | `social.spkeasy.privateSession.create`      | user     | New session + recipient DEKs     |
//! | `social.spkeasy.privateSession.revoke`      | user     | Revoke active sessions           |
//! | `social.spkeasy.privateSession.addUser`     | service  | Insert one recipient DEK         |
//! | `social.spkeasy.privateSession.updateKeys`  | service  | Migrate DEKs to a new keypair    |
//! | `social.spkeasy.profileSession.*`           | (same)   | Same shape, profile store        |

pub mod client;
pub mod registry;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

// ---------------------------------------------------------------------------
// Service Names
// ---------------------------------------------------------------------------

/// The four cooperating services. Used for inter-service addressing, API
/// key lookup, and queue job routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceName {
    /// Trust-graph authority.
    TrustedUsers,
    /// Long-lived keypair store.
    UserKeys,
    /// Encrypted post sessions.
    PrivateSessions,
    /// Encrypted profile sessions.
    PrivateProfiles,
}

impl ServiceName {
    /// The two services that own `Session` rows; trust mutations fan out
    /// to exactly this set.
    pub const SESSION_OWNERS: [ServiceName; 2] =
        [ServiceName::PrivateSessions, ServiceName::PrivateProfiles];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::TrustedUsers => "trusted-users",
            ServiceName::UserKeys => "user-keys",
            ServiceName::PrivateSessions => "private-sessions",
            ServiceName::PrivateProfiles => "private-profiles",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ApiError> {
        match s {
            "trusted-users" => Ok(ServiceName::TrustedUsers),
            "user-keys" => Ok(ServiceName::UserKeys),
            "private-sessions" => Ok(ServiceName::PrivateSessions),
            "private-profiles" => Ok(ServiceName::PrivateProfiles),
            other => Err(ApiError::Authentication(format!(
                "unrecognised service: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Method Names
// ---------------------------------------------------------------------------

/// XRPC method names. Kept as constants rather than a closed enum because
/// the session methods exist once per session-owning service and the
/// namespace segment is the only difference.
pub mod methods {
    pub const GRAPH_GET_TRUSTED: &str = "social.spkeasy.graph.getTrusted";
    pub const GRAPH_ADD_TRUSTED: &str = "social.spkeasy.graph.addTrusted";
    pub const GRAPH_BULK_ADD_TRUSTED: &str = "social.spkeasy.graph.bulkAddTrusted";
    pub const GRAPH_REMOVE_TRUSTED: &str = "social.spkeasy.graph.removeTrusted";
    pub const GRAPH_BULK_REMOVE_TRUSTED: &str = "social.spkeasy.graph.bulkRemoveTrusted";

    pub const KEY_GET_PUBLIC_KEY: &str = "social.spkeasy.key.getPublicKey";
    pub const KEY_GET_PUBLIC_KEYS: &str = "social.spkeasy.key.getPublicKeys";
    pub const KEY_GET_PRIVATE_KEY: &str = "social.spkeasy.key.getPrivateKey";
    pub const KEY_GET_PRIVATE_KEYS: &str = "social.spkeasy.key.getPrivateKeys";
    pub const KEY_ROTATE: &str = "social.spkeasy.key.rotate";

    pub const PRIVATE_SESSION_CREATE: &str = "social.spkeasy.privateSession.create";
    pub const PRIVATE_SESSION_REVOKE: &str = "social.spkeasy.privateSession.revoke";
    pub const PRIVATE_SESSION_ADD_USER: &str = "social.spkeasy.privateSession.addUser";
    pub const PRIVATE_SESSION_UPDATE_KEYS: &str = "social.spkeasy.privateSession.updateKeys";

    pub const PROFILE_SESSION_CREATE: &str = "social.spkeasy.profileSession.create";
    pub const PROFILE_SESSION_REVOKE: &str = "social.spkeasy.profileSession.revoke";
    pub const PROFILE_SESSION_ADD_USER: &str = "social.spkeasy.profileSession.addUser";
    pub const PROFILE_SESSION_UPDATE_KEYS: &str = "social.spkeasy.profileSession.updateKeys";
}

// ---------------------------------------------------------------------------
// Request / Response types (the IDL)
// ---------------------------------------------------------------------------

/// `key.getPublicKey` response. Also the element type of the batch form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyView {
    pub did: String,
    pub key_pair_id: String,
    /// base64url-encoded ML-KEM-768 public key.
    pub public_key: String,
}

/// `key.getPublicKeys` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPublicKeysRequest {
    pub dids: Vec<String>,
}

/// `key.getPublicKeys` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPublicKeysResponse {
    pub keys: Vec<PublicKeyView>,
}

/// `key.getPrivateKeys` request. Service-principal only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPrivateKeysRequest {
    pub did: String,
    pub key_pair_ids: Vec<String>,
}

/// One private key in a `key.getPrivateKeys` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateKeyView {
    pub did: String,
    pub key_pair_id: String,
    /// base64url-encoded ML-KEM-768 private key.
    pub private_key: String,
}

/// `key.getPrivateKeys` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPrivateKeysResponse {
    pub keys: Vec<PrivateKeyView>,
}

/// `key.rotate` request. Key material is generated client-side; the
/// server never sees a private key except to store and forward it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateKeyRequest {
    /// base64url-encoded new public key.
    pub new_public_key: String,
    /// base64url-encoded new private key.
    pub new_private_key: String,
}

/// `key.rotate` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateKeyResponse {
    pub key_pair_id: String,
}

/// `graph.getTrusted` response element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedView {
    pub recipient_did: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// `graph.getTrusted` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTrustedResponse {
    pub trusted: Vec<TrustedView>,
}

/// `graph.addTrusted` / `graph.removeTrusted` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedRequest {
    pub recipient_did: String,
}

/// `graph.bulkAddTrusted` / `graph.bulkRemoveTrusted` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkTrustedRequest {
    pub recipient_dids: Vec<String>,
}

/// `graph.bulkAddTrusted` response: the recipients actually added.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAddTrustedResponse {
    pub added_dids: Vec<String>,
}

/// One recipient key in a `session.create` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKeyInput {
    pub recipient_did: String,
    /// base64url `KEMv1|` envelope.
    pub encrypted_dek: String,
    pub user_key_pair_id: String,
}

/// `session.create` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub keys: Vec<SessionKeyInput>,
}

/// `session.create` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
}

/// `session.addUser` request. Service-principal only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSessionUserRequest {
    pub session_id: String,
    pub recipient_did: String,
    pub encrypted_dek: String,
    pub user_key_pair_id: String,
}

/// `session.updateKeys` request. Service-principal only: the keystore
/// hands the migration to a session-owning service, which enqueues it
/// with the private key field sealed at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionKeysRequest {
    pub prev_key_pair_id: String,
    pub new_key_pair_id: String,
    /// base64url ML-KEM-768 private key of the rotated-out pair.
    pub prev_private_key: String,
    /// base64url ML-KEM-768 public key of the replacement pair.
    pub new_public_key: String,
}

/// Generic empty-object response for mutations with nothing to say.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyResponse {}
