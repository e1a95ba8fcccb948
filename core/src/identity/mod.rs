//! # Identity
//!
//! Who is calling, and who are they talking about. Two principal shapes
//! exist: federated users (bearer token from their home PDS, resolved to
//! a DID) and sibling services (shared API-key secret). Nothing in this
//! system ever mints a DID; they arrive from the federation and we treat
//! them as opaque.

pub mod did;
pub mod principal;
pub mod verifier;

pub use did::{Did, DidError};
pub use principal::Principal;
pub use verifier::{IdentityVerifier, Verification, VerifierConfig};
