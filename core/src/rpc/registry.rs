//! # Schema Registry
//!
//! The one piece of runtime reflection in the system: a map from method
//! name to request/response validators. Everything else is statically
//! typed; the registry exists so the HTTP boundary can reject a
//! mis-shaped body with a 400 before any handler logic runs, and so the
//! client can assert a sibling service answered in the shape the IDL
//! promises.
//!
//! A validator is just "does this JSON deserialize into the IDL type".
//! The types are the schema; the registry only indexes them by name.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::rpc::{self, methods};

type Validator = fn(&Value) -> ApiResult<()>;

fn check<T: DeserializeOwned>(value: &Value) -> ApiResult<()> {
    serde_json::from_value::<T>(value.clone())
        .map(|_| ())
        .map_err(|e| ApiError::Validation(format!("body does not match schema: {e}")))
}

/// Request and response validators for one method.
#[derive(Clone, Copy)]
pub struct MethodSchema {
    pub request: Validator,
    pub response: Validator,
}

/// Method-name-indexed schema registry.
pub struct SchemaRegistry {
    methods: HashMap<&'static str, MethodSchema>,
}

impl SchemaRegistry {
    /// The registry covering every method in the IDL.
    pub fn standard() -> Self {
        let mut methods: HashMap<&'static str, MethodSchema> = HashMap::new();

        methods.insert(
            methods::GRAPH_ADD_TRUSTED,
            MethodSchema {
                request: check::<rpc::TrustedRequest>,
                response: check::<rpc::EmptyResponse>,
            },
        );
        methods.insert(
            methods::GRAPH_REMOVE_TRUSTED,
            MethodSchema {
                request: check::<rpc::TrustedRequest>,
                response: check::<rpc::EmptyResponse>,
            },
        );
        methods.insert(
            methods::GRAPH_BULK_ADD_TRUSTED,
            MethodSchema {
                request: check::<rpc::BulkTrustedRequest>,
                response: check::<rpc::BulkAddTrustedResponse>,
            },
        );
        methods.insert(
            methods::GRAPH_BULK_REMOVE_TRUSTED,
            MethodSchema {
                request: check::<rpc::BulkTrustedRequest>,
                response: check::<rpc::EmptyResponse>,
            },
        );
        methods.insert(
            methods::GRAPH_GET_TRUSTED,
            MethodSchema {
                request: check::<Value>,
                response: check::<rpc::GetTrustedResponse>,
            },
        );

        methods.insert(
            methods::KEY_GET_PUBLIC_KEY,
            MethodSchema {
                request: check::<Value>,
                response: check::<rpc::PublicKeyView>,
            },
        );
        methods.insert(
            methods::KEY_GET_PUBLIC_KEYS,
            MethodSchema {
                request: check::<rpc::GetPublicKeysRequest>,
                response: check::<rpc::GetPublicKeysResponse>,
            },
        );
        methods.insert(
            methods::KEY_GET_PRIVATE_KEY,
            MethodSchema {
                request: check::<Value>,
                response: check::<rpc::PrivateKeyView>,
            },
        );
        methods.insert(
            methods::KEY_GET_PRIVATE_KEYS,
            MethodSchema {
                request: check::<rpc::GetPrivateKeysRequest>,
                response: check::<rpc::GetPrivateKeysResponse>,
            },
        );
        methods.insert(
            methods::KEY_ROTATE,
            MethodSchema {
                request: check::<rpc::RotateKeyRequest>,
                response: check::<rpc::RotateKeyResponse>,
            },
        );

        for (create, revoke, add_user, update_keys) in [
            (
                methods::PRIVATE_SESSION_CREATE,
                methods::PRIVATE_SESSION_REVOKE,
                methods::PRIVATE_SESSION_ADD_USER,
                methods::PRIVATE_SESSION_UPDATE_KEYS,
            ),
            (
                methods::PROFILE_SESSION_CREATE,
                methods::PROFILE_SESSION_REVOKE,
                methods::PROFILE_SESSION_ADD_USER,
                methods::PROFILE_SESSION_UPDATE_KEYS,
            ),
        ] {
            methods.insert(
                create,
                MethodSchema {
                    request: check::<rpc::CreateSessionRequest>,
                    response: check::<rpc::CreateSessionResponse>,
                },
            );
            methods.insert(
                revoke,
                MethodSchema {
                    request: check::<Value>,
                    response: check::<rpc::EmptyResponse>,
                },
            );
            methods.insert(
                add_user,
                MethodSchema {
                    request: check::<rpc::AddSessionUserRequest>,
                    response: check::<rpc::EmptyResponse>,
                },
            );
            methods.insert(
                update_keys,
                MethodSchema {
                    request: check::<rpc::UpdateSessionKeysRequest>,
                    response: check::<rpc::EmptyResponse>,
                },
            );
        }

        Self { methods }
    }

    /// Validate an inbound request body for a method. Unknown methods are
    /// `NotFound`, matching the router's behaviour for unknown paths.
    pub fn validate_request(&self, method: &str, body: &Value) -> ApiResult<()> {
        let schema = self.schema(method)?;
        (schema.request)(body)
    }

    /// Validate a response body for a method.
    pub fn validate_response(&self, method: &str, body: &Value) -> ApiResult<()> {
        let schema = self.schema(method)?;
        (schema.response)(body)
    }

    fn schema(&self, method: &str) -> ApiResult<MethodSchema> {
        self.methods
            .get(method)
            .copied()
            .ok_or_else(|| ApiError::NotFound(format!("unknown method: {method}")))
    }
}
