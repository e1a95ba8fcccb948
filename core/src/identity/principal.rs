//! # Principals
//!
//! The authenticated caller attached to every request after verification.
//! Service principals are not user principals wearing a different hat;
//! authorisation rules key off the variant, and a handler that accepts
//! either says so explicitly.

use crate::identity::Did;
use crate::rpc::ServiceName;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// A federated user, resolved through their PDS.
    User {
        did: Did,
        handle: String,
    },
    /// A sibling service authenticated by shared API key.
    Service(ServiceName),
}

impl Principal {
    /// The caller's DID, if the caller is a user.
    pub fn user_did(&self) -> Option<&Did> {
        match self {
            Principal::User { did, .. } => Some(did),
            Principal::Service(_) => None,
        }
    }

    /// Require a user principal, yielding the DID.
    pub fn require_user(&self) -> Result<&Did, crate::error::ApiError> {
        self.user_did().ok_or_else(|| {
            crate::error::ApiError::Authorization("user principal required".into())
        })
    }

    /// Require a service principal.
    pub fn require_service(&self) -> Result<ServiceName, crate::error::ApiError> {
        match self {
            Principal::Service(name) => Ok(*name),
            Principal::User { .. } => Err(crate::error::ApiError::Authorization(
                "service principal required".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_and_service_requirements() {
        let user = Principal::User {
            did: Did::new("did:plc:alice").unwrap(),
            handle: "alice.bsky.social".into(),
        };
        let svc = Principal::Service(ServiceName::UserKeys);

        assert!(user.require_user().is_ok());
        assert!(user.require_service().is_err());
        assert!(svc.require_service().is_ok());
        assert!(svc.require_user().is_err());
    }
}
