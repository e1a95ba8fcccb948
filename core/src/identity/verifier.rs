//! # Bearer-Token Verification
//!
//! Every inbound request carries `Authorization: Bearer <token>`. Two
//! token shapes exist:
//!
//! - `api-key:<service>:<secret>` authenticates a sibling service against
//!   the shared secret configured for that service name.
//! - Anything else is treated as a federated PDS session token. The
//!   `aud` claim (`did:web:<host>`) names the host that minted it. Hosts
//!   on the allow-list are trusted outright; any other host must serve a
//!   profile whose handle is a subdomain of (or equal to) the host itself,
//!   which stops a hostile PDS from minting tokens for handles it does
//!   not control. Liveness is then confirmed against the host's
//!   `getSession` endpoint.
//!
//! Verified `(did, handle)` bindings are cached for a short TTL, keyed by
//! a digest of the token so raw tokens never sit in a long-lived map.
//! Token revocation therefore reconverges within the TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use serde::Deserialize;

use crate::config::{IDENTITY_CACHE_TTL, RPC_TIMEOUT};
use crate::error::{ApiError, ApiResult};
use crate::identity::{Did, Principal};
use crate::rpc::ServiceName;

/// Verifier configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Federation hosts trusted to mint tokens without the subdomain proof.
    pub trusted_hosts: Vec<String>,
    /// Shared secrets per sibling service.
    pub service_secrets: HashMap<ServiceName, String>,
    /// TTL for verified user identities.
    pub cache_ttl: Duration,
    /// URL scheme for federation calls. `https` everywhere except tests.
    pub scheme: String,
}

impl VerifierConfig {
    pub fn new(
        trusted_hosts: Vec<String>,
        service_secrets: HashMap<ServiceName, String>,
    ) -> Self {
        Self {
            trusted_hosts,
            service_secrets,
            cache_ttl: IDENTITY_CACHE_TTL,
            scheme: "https".into(),
        }
    }
}

/// Claims we read out of a PDS session token. The token is *not* verified
/// locally; `aud` routes us to the host whose `getSession` endpoint is
/// the actual oracle.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    aud: String,
    #[serde(default)]
    sub: Option<String>,
}

/// `com.atproto.server.getSession` response subset.
#[derive(Debug, Deserialize)]
struct SessionView {
    did: String,
    handle: String,
}

/// `app.bsky.actor.getProfile` response subset.
#[derive(Debug, Deserialize)]
struct ProfileView {
    handle: String,
}

struct CacheEntry {
    principal: Principal,
    verified_at: Instant,
}

/// A successful verification: who called, and whether the identity cache
/// answered. Service keys are checked locally and never touch the cache.
#[derive(Debug, Clone)]
pub struct Verification {
    pub principal: Principal,
    pub cache_hit: bool,
}

/// Verifies bearer tokens and resolves caller identity.
pub struct IdentityVerifier {
    config: VerifierConfig,
    http: reqwest::Client,
    cache: DashMap<[u8; 32], CacheEntry>,
}

impl IdentityVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self {
            config,
            http,
            cache: DashMap::new(),
        }
    }

    /// Verify a bearer token and produce the caller's principal.
    pub async fn verify(&self, token: &str) -> ApiResult<Verification> {
        if let Some(rest) = token.strip_prefix("api-key:") {
            return Ok(Verification {
                principal: self.verify_service(rest)?,
                cache_hit: false,
            });
        }
        self.verify_user(token).await
    }

    /// Validate `api-key:<service>:<secret>` against configured secrets.
    fn verify_service(&self, rest: &str) -> ApiResult<Principal> {
        let (service, secret) = rest.split_once(':').ok_or_else(|| {
            ApiError::Authentication("malformed api-key token".into())
        })?;
        let name = ServiceName::parse(service)?;
        let expected = self.config.service_secrets.get(&name).ok_or_else(|| {
            ApiError::Authentication(format!("no secret configured for {name}"))
        })?;
        if !constant_time_eq(expected.as_bytes(), secret.as_bytes()) {
            return Err(ApiError::Authentication("invalid service secret".into()));
        }
        Ok(Principal::Service(name))
    }

    /// Validate a federated session token via its issuing host.
    async fn verify_user(&self, token: &str) -> ApiResult<Verification> {
        let cache_key = *blake3::hash(token.as_bytes()).as_bytes();
        if let Some(entry) = self.cache.get(&cache_key) {
            if entry.verified_at.elapsed() < self.config.cache_ttl {
                return Ok(Verification {
                    principal: entry.principal.clone(),
                    cache_hit: true,
                });
            }
        }
        // Expired entries are dropped lazily, on the read that notices.
        self.cache.remove(&cache_key);

        let claims = parse_claims(token)?;
        let host = audience_host(&claims.aud)?;

        if !self.is_trusted_host(&host) {
            self.require_handle_matches_host(&claims, &host).await?;
        }

        let session = self.fetch_session(&host, token).await?;
        let did = Did::new(session.did)
            .map_err(|e| ApiError::Authentication(format!("host returned bad did: {e}")))?;
        if let Some(sub) = &claims.sub {
            if sub != did.as_str() {
                return Err(ApiError::Authentication(
                    "token subject does not match session identity".into(),
                ));
            }
        }

        let principal = Principal::User {
            did,
            handle: session.handle,
        };
        self.cache.insert(
            cache_key,
            CacheEntry {
                principal: principal.clone(),
                verified_at: Instant::now(),
            },
        );
        Ok(Verification {
            principal,
            cache_hit: false,
        })
    }

    fn is_trusted_host(&self, host: &str) -> bool {
        self.config.trusted_hosts.iter().any(|h| h == host)
    }

    /// The subdomain proof for hosts off the allow-list: the profile the
    /// host serves for the token's subject must carry a handle under the
    /// host's own domain.
    async fn require_handle_matches_host(
        &self,
        claims: &TokenClaims,
        host: &str,
    ) -> ApiResult<()> {
        let subject = claims.sub.as_deref().ok_or_else(|| {
            ApiError::Authentication("token from unrecognised host carries no subject".into())
        })?;
        let url = format!(
            "{}://{}/xrpc/app.bsky.actor.getProfile?actor={}",
            self.config.scheme, host, subject
        );
        let profile: ProfileView = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .map_err(|_| ApiError::Authentication("host refused profile lookup".into()))?
            .json()
            .await?;

        if !handle_within_host(&profile.handle, host) {
            return Err(ApiError::Authentication(format!(
                "handle {} is not under host {host}",
                profile.handle
            )));
        }
        Ok(())
    }

    /// Confirm the token is live with the issuing host.
    async fn fetch_session(&self, host: &str, token: &str) -> ApiResult<SessionView> {
        let url = format!(
            "{}://{}/xrpc/com.atproto.server.getSession",
            self.config.scheme, host
        );
        let resp = self.http.get(&url).bearer_auth(token).send().await?;
        if !resp.status().is_success() {
            return Err(ApiError::Authentication(
                "session token rejected by issuing host".into(),
            ));
        }
        Ok(resp.json().await?)
    }
}

/// Decode the claims segment of a JWT without verifying the signature.
/// The issuing host's `getSession` endpoint is the verification oracle;
/// we only need routing information out of the payload.
fn parse_claims(token: &str) -> ApiResult<TokenClaims> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_sig)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(ApiError::Authentication("malformed session token".into()));
    };
    if parts.next().is_some() {
        return Err(ApiError::Authentication("malformed session token".into()));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| ApiError::Authentication("malformed token payload".into()))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::Authentication("malformed token claims".into()))
}

/// Extract the host from an `aud` claim shaped `did:web:<host>`.
fn audience_host(aud: &str) -> ApiResult<String> {
    let host = aud.strip_prefix("did:web:").ok_or_else(|| {
        ApiError::Authentication("token audience is not a did:web host".into())
    })?;
    if host.is_empty() || host.contains('/') {
        return Err(ApiError::Authentication("token audience host malformed".into()));
    }
    Ok(host.to_string())
}

/// True when `handle` equals `host` or is a subdomain of it.
fn handle_within_host(handle: &str, host: &str) -> bool {
    handle == host || handle.ends_with(&format!(".{host}"))
}

/// Byte-wise constant-time equality for shared secrets.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_token(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"HS256\"}");
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        format!("{header}.{payload}.sig")
    }

    fn verifier_with_secret(secret: &str) -> IdentityVerifier {
        let mut secrets = HashMap::new();
        secrets.insert(ServiceName::PrivateSessions, secret.to_string());
        IdentityVerifier::new(VerifierConfig::new(
            vec!["bsky.social".into()],
            secrets,
        ))
    }

    #[tokio::test]
    async fn api_key_token_yields_service_principal() {
        let v = verifier_with_secret("s3cret");
        let got = v.verify("api-key:private-sessions:s3cret").await.unwrap();
        assert_eq!(got.principal, Principal::Service(ServiceName::PrivateSessions));
        // Service keys never consult the identity cache.
        assert!(!got.cache_hit);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let v = verifier_with_secret("s3cret");
        let err = v.verify("api-key:private-sessions:nope").await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let v = verifier_with_secret("s3cret");
        let err = v.verify("api-key:mystery:s3cret").await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
    }

    #[test]
    fn claims_parse_and_audience_extraction() {
        let token = make_token(&serde_json::json!({
            "aud": "did:web:pds.example.com",
            "sub": "did:plc:alice",
        }));
        let claims = parse_claims(&token).unwrap();
        assert_eq!(claims.aud, "did:web:pds.example.com");
        assert_eq!(audience_host(&claims.aud).unwrap(), "pds.example.com");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(parse_claims("only.two").is_err());
        assert!(parse_claims("a.b.c.d").is_err());
        assert!(parse_claims("a.!!!.c").is_err());
        assert!(audience_host("https://pds.example.com").is_err());
        assert!(audience_host("did:web:").is_err());
    }

    #[test]
    fn subdomain_rule() {
        assert!(handle_within_host("pds.example.com", "pds.example.com"));
        assert!(handle_within_host("alice.pds.example.com", "pds.example.com"));
        assert!(!handle_within_host("alice.evil.com", "pds.example.com"));
        // Suffix tricks without the dot boundary must not pass.
        assert!(!handle_within_host("evilpds.example.com", "pds.example.com"));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
