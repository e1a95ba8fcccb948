//! # Persistence
//!
//! Embedded storage, one isolated schema per service. Schemas
//! cross-reference only by opaque strings (`authorDid`, `userKeyPairId`);
//! no key in one schema dereferences into another, which is what lets the
//! services migrate and deploy independently.

pub mod db;

pub use db::{composite_key, millis_be, millis_from_be, SchemaDb};
