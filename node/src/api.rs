//! # XRPC HTTP Surface
//!
//! Builds the axum router exposing the control plane's `/xrpc/<method>`
//! endpoints. Which methods answer depends on which logical services this
//! node hosts; a method whose backing store is not hosted here returns
//! the same 404 shape as an unknown method.
//!
//! ## Endpoint Index
//!
//! | Method | Path                                              | Auth    |
//! |--------|---------------------------------------------------|---------|
//! | GET    | `/health`                                         | none    |
//! | GET    | `/metrics`                                        | none    |
//! | GET    | `/xrpc/social.spkeasy.graph.getTrusted`           | any     |
//! | POST   | `/xrpc/social.spkeasy.graph.addTrusted`           | user    |
//! | POST   | `/xrpc/social.spkeasy.graph.bulkAddTrusted`       | user    |
//! | POST   | `/xrpc/social.spkeasy.graph.removeTrusted`        | user    |
//! | POST   | `/xrpc/social.spkeasy.graph.bulkRemoveTrusted`    | user    |
//! | GET    | `/xrpc/social.spkeasy.key.getPublicKey`           | any     |
//! | GET    | `/xrpc/social.spkeasy.key.getPublicKeys`          | any     |
//! | GET    | `/xrpc/social.spkeasy.key.getPrivateKey`          | service |
//! | GET    | `/xrpc/social.spkeasy.key.getPrivateKeys`         | service |
//! | POST   | `/xrpc/social.spkeasy.key.rotate`                 | user    |
//! | POST   | `/xrpc/social.spkeasy.privateSession.create`      | user    |
//! | POST   | `/xrpc/social.spkeasy.privateSession.revoke`      | user    |
//! | POST   | `/xrpc/social.spkeasy.privateSession.addUser`     | service |
//! | POST   | `/xrpc/social.spkeasy.privateSession.updateKeys`  | service |
//! | POST   | `/xrpc/social.spkeasy.profileSession.*`           | (same)  |

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use spkeasy_core::crypto;
use spkeasy_core::crypto::anonymize::LogAnonymizer;
use spkeasy_core::error::{ApiError, ApiResult};
use spkeasy_core::graph::TrustGraph;
use spkeasy_core::identity::{Did, IdentityVerifier, Principal};
use spkeasy_core::keystore::KeyStore;
use spkeasy_core::propagation::jobs::{
    queue_name, UpdateSessionKeysJob, UPDATE_SESSION_KEYS, UPDATE_SESSION_KEYS_SEALED_FIELDS,
};
use spkeasy_core::queue::{JobOptions, Queue};
use spkeasy_core::rpc::{self, methods, registry::SchemaRegistry, ServiceName};
use spkeasy_core::sessions::{NewSessionKey, SessionStore};

use crate::metrics::NodeMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for all request handlers. Cheap to clone; everything is
/// behind `Arc` or internally shared.
#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<IdentityVerifier>,
    pub registry: Arc<SchemaRegistry>,
    pub queue: Queue,
    /// Stores for the services hosted by this node. `None` means the
    /// corresponding methods 404 here.
    pub graph: Option<Arc<TrustGraph>>,
    pub keystore: Option<Arc<KeyStore>>,
    pub post_sessions: Option<Arc<SessionStore>>,
    pub profile_sessions: Option<Arc<SessionStore>>,
    pub metrics: NodeMetrics,
    /// DIDs only reach log lines through this.
    pub anonymizer: Arc<LogAnonymizer>,
    pub version: String,
}

impl AppState {
    fn graph(&self) -> ApiResult<&Arc<TrustGraph>> {
        self.graph.as_ref().ok_or_else(not_hosted)
    }

    fn keystore(&self) -> ApiResult<&Arc<KeyStore>> {
        self.keystore.as_ref().ok_or_else(not_hosted)
    }

    fn session_store(&self, service: ServiceName) -> ApiResult<&Arc<SessionStore>> {
        let store = match service {
            ServiceName::PrivateSessions => self.post_sessions.as_ref(),
            ServiceName::PrivateProfiles => self.profile_sessions.as_ref(),
            _ => None,
        };
        store.ok_or_else(not_hosted)
    }
}

/// Unhosted services answer exactly like unknown methods.
fn not_hosted() -> ApiError {
    ApiError::NotFound("method not available on this node".into())
}

// ---------------------------------------------------------------------------
// Error and Auth plumbing
// ---------------------------------------------------------------------------

/// Wraps [`ApiError`] so axum can render the standard error body:
/// `{"error": kind, "message": text, "code": symbolic}`.
pub struct ApiFailure(pub ApiError);

impl From<ApiError> for ApiFailure {
    fn from(e: ApiError) -> Self {
        ApiFailure(e)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let e = &self.0;
        if matches!(e, ApiError::Internal(_)) {
            tracing::error!(error = %e, "internal error reached the http boundary");
        }
        let status =
            StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": e.kind_name(),
            "message": e.to_string(),
            "code": e.code(),
        });
        (status, Json(body)).into_response()
    }
}

type Handled<T> = Result<Json<T>, ApiFailure>;

/// Extracts and verifies the bearer token into a [`Principal`].
pub struct Auth(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = ApiFailure;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiFailure(ApiError::Authentication("missing authorization header".into()))
            })?;
        let token = header.strip_prefix("Bearer ").ok_or_else(|| {
            ApiFailure(ApiError::Authentication("malformed authorization header".into()))
        })?;
        let verification = state.verifier.verify(token).await.map_err(ApiFailure)?;
        if verification.cache_hit {
            state.metrics.identity_cache_hits_total.inc();
        }
        Ok(Auth(verification.principal))
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route(&xrpc(methods::GRAPH_GET_TRUSTED), get(get_trusted))
        .route(&xrpc(methods::GRAPH_ADD_TRUSTED), post(add_trusted))
        .route(&xrpc(methods::GRAPH_BULK_ADD_TRUSTED), post(bulk_add_trusted))
        .route(&xrpc(methods::GRAPH_REMOVE_TRUSTED), post(remove_trusted))
        .route(
            &xrpc(methods::GRAPH_BULK_REMOVE_TRUSTED),
            post(bulk_remove_trusted),
        )
        .route(&xrpc(methods::KEY_GET_PUBLIC_KEY), get(get_public_key))
        .route(&xrpc(methods::KEY_GET_PUBLIC_KEYS), get(get_public_keys))
        .route(&xrpc(methods::KEY_GET_PRIVATE_KEY), get(get_private_key))
        .route(&xrpc(methods::KEY_GET_PRIVATE_KEYS), get(get_private_keys))
        .route(&xrpc(methods::KEY_ROTATE), post(rotate_key))
        .route(
            &xrpc(methods::PRIVATE_SESSION_CREATE),
            post(create_post_session),
        )
        .route(
            &xrpc(methods::PRIVATE_SESSION_REVOKE),
            post(revoke_post_sessions),
        )
        .route(
            &xrpc(methods::PRIVATE_SESSION_ADD_USER),
            post(add_post_session_user),
        )
        .route(
            &xrpc(methods::PRIVATE_SESSION_UPDATE_KEYS),
            post(update_post_session_keys),
        )
        .route(
            &xrpc(methods::PROFILE_SESSION_CREATE),
            post(create_profile_session),
        )
        .route(
            &xrpc(methods::PROFILE_SESSION_REVOKE),
            post(revoke_profile_sessions),
        )
        .route(
            &xrpc(methods::PROFILE_SESSION_ADD_USER),
            post(add_profile_session_user),
        )
        .route(
            &xrpc(methods::PROFILE_SESSION_UPDATE_KEYS),
            post(update_profile_session_keys),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            track_metrics,
        ))
        .with_state(state)
}

fn xrpc(method: &str) -> String {
    format!("/xrpc/{method}")
}

/// Counts every request and observes handling latency; errors (4xx/5xx)
/// bump their own counter.
async fn track_metrics(
    State(state): State<AppState>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    state.metrics.http_requests_total.inc();
    let timer = state.metrics.request_latency_seconds.start_timer();
    let resp = next.run(req).await;
    timer.observe_duration();
    if resp.status().is_client_error() || resp.status().is_server_error() {
        state.metrics.http_errors_total.inc();
    }
    resp
}

/// Validate a POST body against the registry, then parse it into its
/// typed form. Every mutation endpoint goes through here.
fn typed_body<T: serde::de::DeserializeOwned>(
    state: &AppState,
    method: &str,
    body: &Value,
) -> ApiResult<T> {
    state.registry.validate_request(method, body)?;
    serde_json::from_value(body.clone())
        .map_err(|e| ApiError::Validation(format!("body does not match schema: {e}")))
}

fn parse_did(s: &str) -> ApiResult<Did> {
    Did::new(s).map_err(|e| ApiError::Validation(e.to_string()))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
    }))
}

// ---------------------------------------------------------------------------
// Trust graph endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetTrustedParams {
    author_did: Option<String>,
    recipient_did: Option<String>,
}

async fn get_trusted(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Query(params): Query<GetTrustedParams>,
) -> Handled<rpc::GetTrustedResponse> {
    let graph = state.graph()?;
    // Users read their own list; services may ask about any author (the
    // propagation re-check path).
    let author = match &principal {
        Principal::User { did, .. } => {
            if let Some(requested) = &params.author_did {
                if requested != did.as_str() {
                    return Err(ApiFailure(ApiError::Authorization(
                        "users may only read their own trust list".into(),
                    )));
                }
            }
            did.clone()
        }
        Principal::Service(_) => parse_did(params.author_did.as_deref().ok_or_else(|| {
            ApiError::Validation("authorDid is required for service callers".into())
        })?)?,
    };
    let recipient = params.recipient_did.as_deref().map(parse_did).transpose()?;

    let edges = graph.list_trusted(&author, recipient.as_ref())?;
    let trusted = edges
        .into_iter()
        .map(|e| rpc::TrustedView {
            recipient_did: e.recipient_did.as_str().to_string(),
            created_at: chrono::DateTime::from_timestamp_millis(e.created_at_ms)
                .unwrap_or_default(),
        })
        .collect();
    Ok(Json(rpc::GetTrustedResponse { trusted }))
}

async fn add_trusted(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<Value>,
) -> Handled<rpc::EmptyResponse> {
    let req: rpc::TrustedRequest = typed_body(&state, methods::GRAPH_ADD_TRUSTED, &body)?;
    let author = principal.require_user()?;
    let recipient = parse_did(&req.recipient_did)?;
    state.graph()?.add_trusted(author, &recipient)?;
    tracing::info!(
        author = %state.anonymizer.digest(author.as_str()),
        recipient = %state.anonymizer.digest(recipient.as_str()),
        "trust edge added"
    );
    Ok(Json(rpc::EmptyResponse::default()))
}

async fn bulk_add_trusted(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<Value>,
) -> Handled<rpc::BulkAddTrustedResponse> {
    let req: rpc::BulkTrustedRequest = typed_body(&state, methods::GRAPH_BULK_ADD_TRUSTED, &body)?;
    let author = principal.require_user()?;
    let recipients = req
        .recipient_dids
        .iter()
        .map(|s| parse_did(s))
        .collect::<ApiResult<Vec<_>>>()?;
    let added = state.graph()?.bulk_add_trusted(author, &recipients)?;
    Ok(Json(rpc::BulkAddTrustedResponse {
        added_dids: added.into_iter().map(|d| d.as_str().to_string()).collect(),
    }))
}

async fn remove_trusted(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<Value>,
) -> Handled<rpc::EmptyResponse> {
    let req: rpc::TrustedRequest = typed_body(&state, methods::GRAPH_REMOVE_TRUSTED, &body)?;
    let author = principal.require_user()?;
    let recipient = parse_did(&req.recipient_did)?;
    state.graph()?.remove_trusted(author, &recipient)?;
    tracing::info!(
        author = %state.anonymizer.digest(author.as_str()),
        recipient = %state.anonymizer.digest(recipient.as_str()),
        "trust edge removed"
    );
    Ok(Json(rpc::EmptyResponse::default()))
}

async fn bulk_remove_trusted(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<Value>,
) -> Handled<rpc::EmptyResponse> {
    let req: rpc::BulkTrustedRequest =
        typed_body(&state, methods::GRAPH_BULK_REMOVE_TRUSTED, &body)?;
    let author = principal.require_user()?;
    let recipients = req
        .recipient_dids
        .iter()
        .map(|s| parse_did(s))
        .collect::<ApiResult<Vec<_>>>()?;
    state.graph()?.bulk_remove_trusted(author, &recipients)?;
    Ok(Json(rpc::EmptyResponse::default()))
}

// ---------------------------------------------------------------------------
// Keystore endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetPublicKeyParams {
    did: String,
}

async fn get_public_key(
    State(state): State<AppState>,
    Auth(_principal): Auth,
    Query(params): Query<GetPublicKeyParams>,
) -> Handled<rpc::PublicKeyView> {
    let did = parse_did(&params.did)?;
    let pair = state.keystore()?.get_or_create(&did)?;
    Ok(Json(rpc::PublicKeyView {
        did: pair.author_did.as_str().to_string(),
        key_pair_id: pair.id,
        public_key: crypto::to_base64url(&pair.public_key),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetPublicKeysParams {
    /// Comma-separated DID list.
    dids: String,
}

async fn get_public_keys(
    State(state): State<AppState>,
    Auth(_principal): Auth,
    Query(params): Query<GetPublicKeysParams>,
) -> Handled<rpc::GetPublicKeysResponse> {
    let dids = params
        .dids
        .split(',')
        .filter(|s| !s.is_empty())
        .map(parse_did)
        .collect::<ApiResult<Vec<_>>>()?;
    let pairs = state.keystore()?.get_public_keys(&dids)?;
    Ok(Json(rpc::GetPublicKeysResponse {
        keys: pairs
            .into_iter()
            .map(|pair| rpc::PublicKeyView {
                did: pair.author_did.as_str().to_string(),
                key_pair_id: pair.id,
                public_key: crypto::to_base64url(&pair.public_key),
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetPrivateKeyParams {
    did: String,
    key_pair_id: String,
}

async fn get_private_key(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Query(params): Query<GetPrivateKeyParams>,
) -> Handled<rpc::PrivateKeyView> {
    principal.require_service()?;
    let did = parse_did(&params.did)?;
    let pairs = state
        .keystore()?
        .get_private_keys(&did, std::slice::from_ref(&params.key_pair_id))?;
    let pair = pairs
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::NotFound("keypair not found".into()))?;
    Ok(Json(rpc::PrivateKeyView {
        did: pair.author_did.as_str().to_string(),
        key_pair_id: pair.id,
        private_key: crypto::to_base64url(&pair.private_key),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetPrivateKeysParams {
    did: String,
    /// Comma-separated keypair id list.
    key_pair_ids: String,
}

async fn get_private_keys(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Query(params): Query<GetPrivateKeysParams>,
) -> Handled<rpc::GetPrivateKeysResponse> {
    // Private keys cross the wire only between services.
    principal.require_service()?;
    let did = parse_did(&params.did)?;
    let ids: Vec<String> = params
        .key_pair_ids
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err(ApiFailure(ApiError::Validation(
            "keyPairIds must not be empty".into(),
        )));
    }
    let pairs = state.keystore()?.get_private_keys(&did, &ids)?;
    Ok(Json(rpc::GetPrivateKeysResponse {
        keys: pairs
            .into_iter()
            .map(|pair| rpc::PrivateKeyView {
                did: pair.author_did.as_str().to_string(),
                key_pair_id: pair.id,
                private_key: crypto::to_base64url(&pair.private_key),
            })
            .collect(),
    }))
}

async fn rotate_key(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<Value>,
) -> Handled<rpc::RotateKeyResponse> {
    let req: rpc::RotateKeyRequest = typed_body(&state, methods::KEY_ROTATE, &body)?;
    let author = principal.require_user()?;
    let new_public = crypto::from_base64url(&req.new_public_key)
        .map_err(|e| ApiError::Validation(format!("bad public key encoding: {e}")))?;
    let new_private = crypto::from_base64url(&req.new_private_key)
        .map_err(|e| ApiError::Validation(format!("bad private key encoding: {e}")))?;
    let pair = state.keystore()?.rotate(author, &new_public, &new_private)?;
    tracing::info!(
        author = %state.anonymizer.digest(author.as_str()),
        key_pair_id = %pair.id,
        "keypair rotated"
    );
    Ok(Json(rpc::RotateKeyResponse { key_pair_id: pair.id }))
}

// ---------------------------------------------------------------------------
// Session endpoints (one set per session-owning service)
// ---------------------------------------------------------------------------

async fn create_session_impl(
    state: &AppState,
    service: ServiceName,
    method: &str,
    principal: Principal,
    body: Value,
) -> ApiResult<rpc::CreateSessionResponse> {
    let req: rpc::CreateSessionRequest = typed_body(state, method, &body)?;
    let author = principal.require_user()?;
    let keys = req
        .keys
        .iter()
        .map(|k| {
            Ok(NewSessionKey {
                recipient_did: parse_did(&k.recipient_did)?,
                encrypted_dek: k.encrypted_dek.clone(),
                user_key_pair_id: k.user_key_pair_id.clone(),
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;
    let session = state.session_store(service)?.create_session(
        author,
        req.expires_at.timestamp_millis(),
        &keys,
    )?;
    Ok(rpc::CreateSessionResponse {
        session_id: session.id,
    })
}

async fn revoke_sessions_impl(
    state: &AppState,
    service: ServiceName,
    principal: Principal,
) -> ApiResult<rpc::EmptyResponse> {
    let author = principal.require_user()?;
    state.session_store(service)?.revoke_all_active(author)?;
    Ok(rpc::EmptyResponse::default())
}

async fn add_session_user_impl(
    state: &AppState,
    service: ServiceName,
    method: &str,
    principal: Principal,
    body: Value,
) -> ApiResult<rpc::EmptyResponse> {
    let req: rpc::AddSessionUserRequest = typed_body(state, method, &body)?;
    principal.require_service()?;
    let recipient = parse_did(&req.recipient_did)?;
    state.session_store(service)?.add_recipient_key(
        &req.session_id,
        &recipient,
        &req.encrypted_dek,
        &req.user_key_pair_id,
    )?;
    Ok(rpc::EmptyResponse::default())
}

/// `session.updateKeys`: accept a key migration from the keystore and
/// park it on this service's queue with the private key sealed.
async fn update_session_keys_impl(
    state: &AppState,
    service: ServiceName,
    method: &str,
    principal: Principal,
    body: Value,
) -> ApiResult<rpc::EmptyResponse> {
    let req: rpc::UpdateSessionKeysRequest = typed_body(state, method, &body)?;
    principal.require_service()?;
    // The store must be hosted here for the local worker to drain this.
    state.session_store(service)?;
    let job = UpdateSessionKeysJob {
        prev_key_pair_id: req.prev_key_pair_id,
        new_key_pair_id: req.new_key_pair_id,
        prev_private_key: req.prev_private_key,
        new_public_key: req.new_public_key,
    };
    state.queue.publish(
        &queue_name(service, UPDATE_SESSION_KEYS),
        &job,
        &JobOptions {
            encrypted_fields: UPDATE_SESSION_KEYS_SEALED_FIELDS.to_vec(),
            ..Default::default()
        },
    )?;
    Ok(rpc::EmptyResponse::default())
}

macro_rules! session_routes {
    ($create:ident, $revoke:ident, $add_user:ident, $update_keys:ident,
     $service:expr, $create_m:expr, $add_user_m:expr, $update_keys_m:expr) => {
        async fn $create(
            State(state): State<AppState>,
            Auth(principal): Auth,
            Json(body): Json<Value>,
        ) -> Handled<rpc::CreateSessionResponse> {
            Ok(Json(
                create_session_impl(&state, $service, $create_m, principal, body).await?,
            ))
        }

        async fn $revoke(
            State(state): State<AppState>,
            Auth(principal): Auth,
        ) -> Handled<rpc::EmptyResponse> {
            Ok(Json(revoke_sessions_impl(&state, $service, principal).await?))
        }

        async fn $add_user(
            State(state): State<AppState>,
            Auth(principal): Auth,
            Json(body): Json<Value>,
        ) -> Handled<rpc::EmptyResponse> {
            Ok(Json(
                add_session_user_impl(&state, $service, $add_user_m, principal, body).await?,
            ))
        }

        async fn $update_keys(
            State(state): State<AppState>,
            Auth(principal): Auth,
            Json(body): Json<Value>,
        ) -> Handled<rpc::EmptyResponse> {
            Ok(Json(
                update_session_keys_impl(&state, $service, $update_keys_m, principal, body)
                    .await?,
            ))
        }
    };
}

session_routes!(
    create_post_session,
    revoke_post_sessions,
    add_post_session_user,
    update_post_session_keys,
    ServiceName::PrivateSessions,
    methods::PRIVATE_SESSION_CREATE,
    methods::PRIVATE_SESSION_ADD_USER,
    methods::PRIVATE_SESSION_UPDATE_KEYS
);

session_routes!(
    create_profile_session,
    revoke_profile_sessions,
    add_profile_session_user,
    update_profile_session_keys,
    ServiceName::PrivateProfiles,
    methods::PROFILE_SESSION_CREATE,
    methods::PROFILE_SESSION_ADD_USER,
    methods::PROFILE_SESSION_UPDATE_KEYS
);

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    use spkeasy_core::clock::Clock;
    use spkeasy_core::config::{
        DEFAULT_BULK_DELAY, DEFAULT_ROTATE_MIN_AGE, DEFAULT_TRUST_QUOTA, TRUST_QUOTA_WINDOW,
    };
    use spkeasy_core::identity::VerifierConfig;
    use spkeasy_core::storage::SchemaDb;

    const SECRET: &str = "svc-secret";

    fn test_state(host_graph: bool) -> AppState {
        let clock = Clock::manual(1_700_000_000_000);
        let queue = Queue::new(
            SchemaDb::open_temporary().unwrap(),
            [1u8; 32],
            clock.clone(),
        );
        let graph = host_graph.then(|| {
            Arc::new(
                TrustGraph::new(
                    &SchemaDb::open_temporary().unwrap(),
                    queue.clone(),
                    clock.clone(),
                    DEFAULT_TRUST_QUOTA,
                    TRUST_QUOTA_WINDOW,
                    DEFAULT_BULK_DELAY,
                )
                .unwrap(),
            )
        });
        let keystore = Arc::new(
            KeyStore::new(
                &SchemaDb::open_temporary().unwrap(),
                queue.clone(),
                clock.clone(),
                DEFAULT_ROTATE_MIN_AGE,
            )
            .unwrap(),
        );
        let post_sessions = Arc::new(
            SessionStore::new(&SchemaDb::open_temporary().unwrap(), clock.clone()).unwrap(),
        );
        let profile_sessions =
            Arc::new(SessionStore::new(&SchemaDb::open_temporary().unwrap(), clock).unwrap());

        let mut secrets = HashMap::new();
        for service in [
            ServiceName::TrustedUsers,
            ServiceName::UserKeys,
            ServiceName::PrivateSessions,
            ServiceName::PrivateProfiles,
        ] {
            secrets.insert(service, SECRET.to_string());
        }

        AppState {
            verifier: Arc::new(IdentityVerifier::new(VerifierConfig::new(vec![], secrets))),
            registry: Arc::new(SchemaRegistry::standard()),
            queue,
            graph,
            keystore: Some(keystore),
            post_sessions: Some(post_sessions),
            profile_sessions: Some(profile_sessions),
            metrics: NodeMetrics::new(),
            anonymizer: Arc::new(LogAnonymizer::new([3u8; 32], "test")),
            version: "test".into(),
        }
    }

    async fn send(state: AppState, req: Request<Body>) -> (StatusCode, Value) {
        let resp = create_router(state).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn service_bearer() -> String {
        format!("Bearer api-key:private-sessions:{SECRET}")
    }

    #[tokio::test]
    async fn health_is_open() {
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(test_state(true), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_auth_is_401_with_error_body() {
        let req = Request::get("/xrpc/social.spkeasy.graph.getTrusted")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(test_state(true), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "AuthenticationError");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn wrong_service_secret_is_401() {
        let req = Request::get("/xrpc/social.spkeasy.key.getPublicKey?did=did:plc:alice")
            .header("authorization", "Bearer api-key:private-sessions:nope")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(test_state(true), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "AuthenticationError");
    }

    #[tokio::test]
    async fn service_key_fetches_public_key() {
        let req = Request::get("/xrpc/social.spkeasy.key.getPublicKey?did=did:plc:alice")
            .header("authorization", service_bearer())
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(test_state(true), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["did"], "did:plc:alice");
        assert!(body["keyPairId"].is_string());
        assert!(body["publicKey"].is_string());
    }

    #[tokio::test]
    async fn user_only_endpoints_refuse_service_principals() {
        let req = Request::post("/xrpc/social.spkeasy.graph.addTrusted")
            .header("authorization", service_bearer())
            .header("content-type", "application/json")
            .body(Body::from(r#"{"recipientDid": "did:plc:bob"}"#))
            .unwrap();
        let (status, body) = send(test_state(true), req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "AuthorizationError");
    }

    #[tokio::test]
    async fn schema_mismatch_is_400() {
        let req = Request::post("/xrpc/social.spkeasy.graph.addTrusted")
            .header("authorization", service_bearer())
            .header("content-type", "application/json")
            .body(Body::from(r#"{"recipient": 42}"#))
            .unwrap();
        let (status, body) = send(test_state(true), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationError");
    }

    #[tokio::test]
    async fn unhosted_service_answers_like_unknown_method() {
        // No graph hosted here: a graph call and a bogus method must be
        // indistinguishable in status.
        let state = test_state(false);
        let req = Request::get("/xrpc/social.spkeasy.graph.getTrusted?authorDid=did:plc:alice")
            .header("authorization", service_bearer())
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(state.clone(), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let req = Request::get("/xrpc/social.spkeasy.mystery.doThing")
            .header("authorization", service_bearer())
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(state, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn private_keys_require_a_service_principal_and_scoping() {
        let state = test_state(true);
        // Seed a keypair for alice through the public-key endpoint.
        let req = Request::get("/xrpc/social.spkeasy.key.getPublicKey?did=did:plc:alice")
            .header("authorization", service_bearer())
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(state.clone(), req).await;
        assert_eq!(status, StatusCode::OK);
        let kp_id = body["keyPairId"].as_str().unwrap().to_string();

        let uri = format!(
            "/xrpc/social.spkeasy.key.getPrivateKeys?did=did:plc:alice&keyPairIds={kp_id}"
        );
        let req = Request::get(uri.as_str())
            .header("authorization", service_bearer())
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(state.clone(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["keys"][0]["did"], "did:plc:alice");

        // The same id requested for another author: uniform 404.
        let uri = format!(
            "/xrpc/social.spkeasy.key.getPrivateKeys?did=did:plc:mallory&keyPairIds={kp_id}"
        );
        let req = Request::get(uri.as_str())
            .header("authorization", service_bearer())
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(state, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFoundError");
    }
}
