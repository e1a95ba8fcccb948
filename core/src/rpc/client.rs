//! # Service Client
//!
//! The typed HTTP client one service uses to call another. Every call
//! names the callee, resolves its base URL and attaches the caller's own
//! `api-key:<service>:<secret>` identity; the callee answers with a
//! service principal attached.
//!
//! Retries live in the queue, not here: a failed call surfaces as
//! [`ApiError::Upstream`] and the surrounding job retries with back-off.
//! The one exception is idempotent GETs, which get a single immediate
//! retry on transport errors to shave off connection blips.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::RPC_TIMEOUT;
use crate::crypto::{self, KemPrivateKey, KemPublicKey};
use crate::error::{ApiError, ApiResult};
use crate::identity::Did;
use crate::propagation::{KeyFetcher, TrustChecker};
use crate::rpc::registry::SchemaRegistry;
use crate::rpc::{
    methods, GetPrivateKeysResponse, GetTrustedResponse, PublicKeyView, ServiceName,
};

/// Typed inter-service caller for one service.
pub struct ServiceClient {
    from: ServiceName,
    urls: HashMap<ServiceName, String>,
    secrets: HashMap<ServiceName, String>,
    registry: Arc<SchemaRegistry>,
    http: reqwest::Client,
}

impl ServiceClient {
    pub fn new(
        from: ServiceName,
        urls: HashMap<ServiceName, String>,
        secrets: HashMap<ServiceName, String>,
        registry: Arc<SchemaRegistry>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self {
            from,
            urls,
            secrets,
            registry,
            http,
        }
    }

    /// The caller's own bearer credential.
    fn authorization(&self) -> ApiResult<String> {
        let secret = self.secrets.get(&self.from).ok_or_else(|| {
            ApiError::Internal(format!("no api secret configured for {}", self.from))
        })?;
        Ok(format!("api-key:{}:{}", self.from, secret))
    }

    fn endpoint(&self, to: ServiceName, method: &str) -> ApiResult<String> {
        let base = self
            .urls
            .get(&to)
            .ok_or_else(|| ApiError::Internal(format!("no base url configured for {to}")))?;
        Ok(format!("{}/xrpc/{}", base.trim_end_matches('/'), method))
    }

    /// GET with one transport-level retry, response validated against
    /// the registry before deserialization.
    async fn get_validated<T: DeserializeOwned>(
        &self,
        to: ServiceName,
        method: &str,
        query: &[(&str, String)],
    ) -> ApiResult<T> {
        let url = self.endpoint(to, method)?;
        let auth = self.authorization()?;

        let mut last_err = None;
        for _ in 0..2 {
            match self
                .http
                .get(&url)
                .bearer_auth(&auth)
                .query(query)
                .send()
                .await
            {
                Ok(resp) => return self.decode_response(method, resp).await,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.expect("retry loop ran at least once").into())
    }

    async fn decode_response<T: DeserializeOwned>(
        &self,
        method: &str,
        resp: reqwest::Response,
    ) -> ApiResult<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                404 => ApiError::NotFound(format!("{method}: {body}")),
                401 | 403 => ApiError::Internal(format!(
                    "service credential rejected calling {method}: {body}"
                )),
                _ => ApiError::Upstream(format!("{method} returned {status}: {body}")),
            });
        }
        let value: serde_json::Value = resp.json().await?;
        self.registry.validate_response(method, &value)?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::Upstream(format!("{method} response malformed: {e}")))
    }

    // -- typed calls --------------------------------------------------------

    /// `key.getPublicKey` against the keystore service. Creates the
    /// keypair server-side when the DID has none.
    pub async fn get_public_key(&self, did: &Did) -> ApiResult<PublicKeyView> {
        self.get_validated(
            ServiceName::UserKeys,
            methods::KEY_GET_PUBLIC_KEY,
            &[("did", did.as_str().to_string())],
        )
        .await
    }

    /// `key.getPrivateKeys` against the keystore service. Service
    /// principals only; the keystore enforces author scoping.
    pub async fn get_private_keys(
        &self,
        did: &Did,
        key_pair_ids: &[String],
    ) -> ApiResult<GetPrivateKeysResponse> {
        self.get_validated(
            ServiceName::UserKeys,
            methods::KEY_GET_PRIVATE_KEYS,
            &[
                ("did", did.as_str().to_string()),
                ("keyPairIds", key_pair_ids.join(",")),
            ],
        )
        .await
    }

    /// `graph.getTrusted` against the trust-graph service, narrowed to
    /// one recipient.
    pub async fn get_trusted(
        &self,
        author: &Did,
        recipient: &Did,
    ) -> ApiResult<GetTrustedResponse> {
        self.get_validated(
            ServiceName::TrustedUsers,
            methods::GRAPH_GET_TRUSTED,
            &[
                ("authorDid", author.as_str().to_string()),
                ("recipientDid", recipient.as_str().to_string()),
            ],
        )
        .await
    }
}

#[async_trait]
impl TrustChecker for ServiceClient {
    async fn is_trusted(&self, author: &Did, recipient: &Did) -> ApiResult<bool> {
        let resp = self.get_trusted(author, recipient).await?;
        Ok(!resp.trusted.is_empty())
    }
}

#[async_trait]
impl KeyFetcher for ServiceClient {
    async fn current_public_key(&self, did: &Did) -> ApiResult<(String, KemPublicKey)> {
        let view = self.get_public_key(did).await?;
        let bytes = crypto::from_base64url(&view.public_key)
            .map_err(|e| ApiError::Upstream(format!("keystore sent undecodable key: {e}")))?;
        let key = KemPublicKey::from_bytes(&bytes)
            .map_err(|e| ApiError::Upstream(format!("keystore sent malformed key: {e}")))?;
        Ok((view.key_pair_id, key))
    }

    async fn private_keys(
        &self,
        did: &Did,
        key_pair_ids: &[String],
    ) -> ApiResult<HashMap<String, KemPrivateKey>> {
        let resp = self.get_private_keys(did, key_pair_ids).await?;
        let mut out = HashMap::with_capacity(resp.keys.len());
        for view in resp.keys {
            // Defence in depth: a response mixing authors means the
            // keystore's scoping is broken. Stop the line.
            if view.did != did.as_str() {
                return Err(ApiError::Internal(
                    "private key response crosses author boundary".into(),
                ));
            }
            let bytes = crypto::from_base64url(&view.private_key)
                .map_err(|e| ApiError::Upstream(format!("keystore sent undecodable key: {e}")))?;
            let key = KemPrivateKey::from_bytes(&bytes)
                .map_err(|e| ApiError::Upstream(format!("keystore sent malformed key: {e}")))?;
            out.insert(view.key_pair_id, key);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ServiceClient {
        let mut urls = HashMap::new();
        urls.insert(ServiceName::UserKeys, "http://keys.internal:8585/".to_string());
        let mut secrets = HashMap::new();
        secrets.insert(ServiceName::PrivateSessions, "s3cret".to_string());
        ServiceClient::new(
            ServiceName::PrivateSessions,
            urls,
            secrets,
            Arc::new(SchemaRegistry::standard()),
        )
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let c = client();
        assert_eq!(
            c.endpoint(ServiceName::UserKeys, methods::KEY_GET_PUBLIC_KEY)
                .unwrap(),
            "http://keys.internal:8585/xrpc/social.spkeasy.key.getPublicKey"
        );
    }

    #[test]
    fn authorization_names_the_caller() {
        let c = client();
        assert_eq!(c.authorization().unwrap(), "api-key:private-sessions:s3cret");
    }

    #[test]
    fn missing_url_is_an_internal_error() {
        let c = client();
        let err = c
            .endpoint(ServiceName::TrustedUsers, methods::GRAPH_GET_TRUSTED)
            .unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));
    }
}
