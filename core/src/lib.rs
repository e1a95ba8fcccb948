// Copyright (c) 2026 Speakeasy Social. MIT License.
// See LICENSE for details.

//! # Speakeasy Core — Private-Content Control Plane
//!
//! This is the machinery behind end-to-end encrypted posts and profiles on
//! a federated social network. The server in this repository never sees a
//! byte of plaintext content: clients encrypt with a per-session Data
//! Encryption Key (DEK), and our whole job is making sure every recipient
//! an author trusts holds a copy of that DEK encrypted to *their* key —
//! and nobody else does.
//!
//! That sounds simple until the trust graph moves. Authors trust and
//! untrust people, rotate their keypairs, and post from three devices at
//! once, and the database must converge to "exactly the trusted set can
//! read" without a single foreign key between the trust graph and the
//! session stores. The glue is a durable job queue and a set of handlers
//! that re-derive their target state from authoritative reads every time
//! they run.
//!
//! ## Architecture
//!
//! The modules mirror the services of the deployed system:
//!
//! - **crypto** — ML-KEM-768 + AES-GCM recryption kernel. Pure functions.
//! - **identity** — DIDs, principals, and bearer-token verification.
//! - **keystore** — per-author long-lived keypairs, with rotation.
//! - **graph** — the trust graph: append-only edges with tombstones.
//! - **sessions** — per-author sessions and per-recipient encrypted DEKs.
//! - **queue** — durable at-least-once job queue with back-off.
//! - **propagation** — the job handlers that close the loop.
//! - **rpc** — typed inter-service calls authenticated by API key.
//! - **storage** — embedded persistence, one schema per service.
//! - **config** — protocol constants and tunables.
//! - **env** — process-environment configuration.
//! - **error** — the error taxonomy every surface maps onto.
//!
//! ## Design Philosophy
//!
//! 1. Handlers are idempotent or they are bugs.
//! 2. Destructive work re-checks the authoritative store first.
//! 3. Plaintext DEKs live for the lexical scope of one function call.
//! 4. If it touches a key, it has tests. Plural.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod env;
pub mod error;
pub mod graph;
pub mod identity;
pub mod keystore;
pub mod propagation;
pub mod queue;
pub mod rpc;
pub mod sessions;
pub mod storage;
