//! # Trust Graph
//!
//! The `trusted-users` service's store: directed edges from an author to
//! the recipients allowed to read their private content. Edges are
//! append-only with tombstones; re-trusting someone after a removal makes
//! a *new* edge with a new creation time.
//!
//! ## Tree Layout
//!
//! | Tree     | Key                                      | Value               |
//! |----------|------------------------------------------|---------------------|
//! | `edges`  | author ‖ NUL ‖ recipient ‖ NUL ‖ ts (BE) | `bincode(TrustEdge)`|
//! | `active` | author ‖ NUL ‖ recipient                 | ts (8B BE)          |
//! | `recent` | author ‖ NUL ‖ ts (BE) ‖ NUL ‖ recipient | ()                  |
//!
//! `active` is the uniqueness invariant: one slot per (author, recipient)
//! pair, present exactly when an untombstoned edge exists. `recent` is an
//! insertion log driving the 24-hour quota; removals do not erase it, so
//! the quota counts every edge *created* in the window, tombstoned or
//! not.
//!
//! Mutations for one author are serialised by a per-author lock, which is
//! what lets the quota check (a range scan, which storage transactions
//! cannot do) compose with the insert without overshooting under
//! concurrency.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::transaction::{TransactionError, Transactional};
use sled::Tree;

use crate::clock::Clock;
use crate::error::{ApiError, ApiResult};
use crate::identity::Did;
use crate::propagation::jobs::{
    queue_name, AddRecipientJob, DeleteSessionKeysJob, RevokeSessionJob,
    ADD_RECIPIENT_TO_SESSIONS, DELETE_SESSION_KEYS, REVOKE_SESSION,
};
use crate::queue::{JobOptions, Queue};
use crate::rpc::ServiceName;
use crate::storage::{composite_key, millis_be, millis_from_be, SchemaDb};

/// One trust edge, active or tombstoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEdge {
    pub author_did: Did,
    pub recipient_did: Did,
    pub created_at_ms: i64,
    pub deleted_at_ms: Option<i64>,
}

/// The trust graph store. Owns the `trusted_users` schema and fans trust
/// mutations out to the session-owning services through the queue.
pub struct TrustGraph {
    edges: Tree,
    active: Tree,
    recent: Tree,
    queue: Queue,
    clock: Clock,
    quota: usize,
    quota_window: Duration,
    bulk_delay: Duration,
    author_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TrustGraph {
    pub fn new(
        db: &SchemaDb,
        queue: Queue,
        clock: Clock,
        quota: usize,
        quota_window: Duration,
        bulk_delay: Duration,
    ) -> ApiResult<Self> {
        Ok(Self {
            edges: db.open_tree("edges")?,
            active: db.open_tree("active")?,
            recent: db.open_tree("recent")?,
            queue,
            clock,
            quota,
            quota_window,
            bulk_delay,
            author_locks: DashMap::new(),
        })
    }

    /// Active edges for an author, optionally narrowed to one recipient.
    pub fn list_trusted(
        &self,
        author: &Did,
        recipient: Option<&Did>,
    ) -> ApiResult<Vec<TrustEdge>> {
        match recipient {
            Some(recipient) => Ok(self.active_edge(author, recipient)?.into_iter().collect()),
            None => {
                let prefix = composite_key(&[author.as_str().as_bytes(), &[]]);
                let mut out = Vec::new();
                for entry in self.active.scan_prefix(&prefix) {
                    let (key, ts) = entry?;
                    let created_at_ms = millis_from_be(&ts)
                        .ok_or_else(|| ApiError::Internal("corrupt active-edge index".into()))?;
                    out.push(self.load_edge(&key, created_at_ms)?);
                }
                Ok(out)
            }
        }
    }

    /// Whether an active edge exists. The re-check every destructive
    /// propagation handler runs first.
    pub fn is_trusted(&self, author: &Did, recipient: &Did) -> ApiResult<bool> {
        Ok(self.active_edge(author, recipient)?.is_some())
    }

    /// Trust one recipient. Fans out immediately; single adds carry no
    /// undo delay.
    pub fn add_trusted(&self, author: &Did, recipient: &Did) -> ApiResult<TrustEdge> {
        let added = self.add_many(author, std::slice::from_ref(recipient), true)?;
        let edge = added
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::Internal("edge insert returned no edge".into()))?;
        self.publish_adds(author, &[edge.recipient_did.clone()], None)?;
        Ok(edge)
    }

    /// Trust many recipients in one transaction. Returns the novel ones;
    /// recipients already trusted are skipped silently. Fan-out jobs are
    /// delayed by the bulk-undo window.
    pub fn bulk_add_trusted(&self, author: &Did, recipients: &[Did]) -> ApiResult<Vec<Did>> {
        let edges = self.add_many(author, recipients, false)?;
        let added: Vec<Did> = edges.into_iter().map(|e| e.recipient_did).collect();
        self.publish_adds(author, &added, Some(self.bulk_delay))?;
        Ok(added)
    }

    /// Untrust one recipient. `NotFound` when no active edge exists.
    pub fn remove_trusted(&self, author: &Did, recipient: &Did) -> ApiResult<()> {
        self.remove_many(author, std::slice::from_ref(recipient), true)?;
        let revoke = RevokeSessionJob {
            author_did: author.clone(),
            recipient_did: Some(recipient.clone()),
        };
        let delete = DeleteSessionKeysJob {
            author_did: author.clone(),
            recipient_did: recipient.clone(),
        };
        for service in ServiceName::SESSION_OWNERS {
            self.queue.publish(
                &queue_name(service, REVOKE_SESSION),
                &revoke,
                &JobOptions::default(),
            )?;
            self.queue.publish(
                &queue_name(service, DELETE_SESSION_KEYS),
                &delete,
                &JobOptions {
                    start_after: Some(self.bulk_delay),
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    /// Untrust many recipients. Recipients without an active edge are
    /// skipped; removing nobody is still `NotFound`.
    pub fn bulk_remove_trusted(&self, author: &Did, recipients: &[Did]) -> ApiResult<Vec<Did>> {
        let removed = self.remove_many(author, recipients, false)?;
        let revoke = RevokeSessionJob {
            author_did: author.clone(),
            recipient_did: None,
        };
        for service in ServiceName::SESSION_OWNERS {
            self.queue.publish(
                &queue_name(service, REVOKE_SESSION),
                &revoke,
                &JobOptions::default(),
            )?;
            let deletes: Vec<DeleteSessionKeysJob> = removed
                .iter()
                .map(|recipient| DeleteSessionKeysJob {
                    author_did: author.clone(),
                    recipient_did: recipient.clone(),
                })
                .collect();
            self.queue.bulk_publish(
                &queue_name(service, DELETE_SESSION_KEYS),
                &deletes,
                &JobOptions {
                    start_after: Some(self.bulk_delay),
                    ..Default::default()
                },
            )?;
        }
        Ok(removed)
    }

    // -- internals ----------------------------------------------------------

    /// Create edges for the novel subset of `recipients`, enforcing the
    /// quota over existing-in-window plus novel. With `strict` set, an
    /// already-active recipient is a `Conflict` instead of a skip.
    fn add_many(&self, author: &Did, recipients: &[Did], strict: bool) -> ApiResult<Vec<TrustEdge>> {
        let lock = self.lock_author(author);
        let _guard = lock.lock();
        let now_ms = self.clock.now_ms();

        let mut novel: Vec<&Did> = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            if recipient == author {
                return Err(ApiError::Validation(
                    "authors always hold their own access; self-trust is meaningless".into(),
                ));
            }
            if self.active_edge(author, recipient)?.is_some() {
                if strict {
                    return Err(ApiError::Conflict(format!(
                        "already trusted: {recipient}"
                    )));
                }
                continue;
            }
            if novel.iter().any(|d| *d == recipient) {
                continue;
            }
            novel.push(recipient);
        }
        if novel.is_empty() && !strict {
            return Ok(Vec::new());
        }

        let in_window = self.count_recent(author, now_ms)?;
        if in_window + novel.len() > self.quota {
            return Err(ApiError::RateLimited(format!(
                "trust additions capped at {} per 24h ({} used)",
                self.quota, in_window
            )));
        }

        let edges: Vec<TrustEdge> = novel
            .iter()
            .map(|recipient| TrustEdge {
                author_did: author.clone(),
                recipient_did: (*recipient).clone(),
                created_at_ms: now_ms,
                deleted_at_ms: None,
            })
            .collect();

        let encoded: Vec<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>)> = edges
            .iter()
            .map(|edge| {
                Ok((
                    edge_key(author, &edge.recipient_did, now_ms),
                    bincode::serialize(edge)?,
                    pair_key(author, &edge.recipient_did),
                    recent_key(author, now_ms, &edge.recipient_did),
                ))
            })
            .collect::<ApiResult<_>>()?;

        // Quota log first: a crash between here and the edge write leaves
        // an over-count, which refuses adds rather than admitting extras.
        for (_, _, _, recent_k) in &encoded {
            self.recent.insert(recent_k.as_slice(), &[][..])?;
        }

        let result: Result<(), TransactionError<()>> = (&self.edges, &self.active)
            .transaction(|(edges_t, active_t)| {
                for (edge_k, edge_v, pair_k, _) in &encoded {
                    edges_t.insert(edge_k.as_slice(), edge_v.as_slice())?;
                    active_t.insert(pair_k.as_slice(), &millis_be(now_ms)[..])?;
                }
                Ok(())
            });
        result.map_err(|e| match e {
            TransactionError::Abort(()) => ApiError::Internal("edge insert aborted".into()),
            TransactionError::Storage(s) => s.into(),
        })?;
        Ok(edges)
    }

    /// Tombstone edges for the active subset of `recipients`. With
    /// `strict`, a missing edge is `NotFound`; bulk mode only requires
    /// that at least one edge existed.
    fn remove_many(&self, author: &Did, recipients: &[Did], strict: bool) -> ApiResult<Vec<Did>> {
        let lock = self.lock_author(author);
        let _guard = lock.lock();
        let now_ms = self.clock.now_ms();

        let mut removed = Vec::new();
        for recipient in recipients {
            let Some(edge) = self.active_edge(author, recipient)? else {
                if strict {
                    return Err(ApiError::NotFound(format!("not trusted: {recipient}")));
                }
                continue;
            };

            let mut tombstoned = edge.clone();
            tombstoned.deleted_at_ms = Some(now_ms);
            let edge_k = edge_key(author, recipient, edge.created_at_ms);
            let edge_v = bincode::serialize(&tombstoned)?;
            let pair_k = pair_key(author, recipient);

            let result: Result<(), TransactionError<()>> = (&self.edges, &self.active)
                .transaction(|(edges_t, active_t)| {
                    edges_t.insert(edge_k.as_slice(), edge_v.as_slice())?;
                    active_t.remove(pair_k.as_slice())?;
                    Ok(())
                });
            result.map_err(|e| match e {
                TransactionError::Abort(()) => ApiError::Internal("edge remove aborted".into()),
                TransactionError::Storage(s) => s.into(),
            })?;
            removed.push(recipient.clone());
        }

        if removed.is_empty() {
            return Err(ApiError::NotFound("no active trust edges to remove".into()));
        }
        Ok(removed)
    }

    fn publish_adds(
        &self,
        author: &Did,
        recipients: &[Did],
        start_after: Option<Duration>,
    ) -> ApiResult<()> {
        if recipients.is_empty() {
            return Ok(());
        }
        let jobs: Vec<AddRecipientJob> = recipients
            .iter()
            .map(|recipient| AddRecipientJob {
                author_did: author.clone(),
                recipient_did: recipient.clone(),
            })
            .collect();
        let opts = JobOptions {
            start_after,
            ..Default::default()
        };
        for service in ServiceName::SESSION_OWNERS {
            self.queue.bulk_publish(
                &queue_name(service, ADD_RECIPIENT_TO_SESSIONS),
                &jobs,
                &opts,
            )?;
        }
        Ok(())
    }

    /// Edges created by this author inside the quota window. Prunes
    /// expired log entries as a side effect of counting them.
    fn count_recent(&self, author: &Did, now_ms: i64) -> ApiResult<usize> {
        let window_ms = self.quota_window.as_millis() as i64;
        let cutoff_ms = now_ms - window_ms;
        let prefix = composite_key(&[author.as_str().as_bytes(), &[]]);

        let mut count = 0;
        for entry in self.recent.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let ts_bytes = &key[prefix.len()..prefix.len() + 8];
            let created_ms = millis_from_be(ts_bytes)
                .ok_or_else(|| ApiError::Internal("corrupt recent-edge index".into()))?;
            if created_ms < cutoff_ms {
                self.recent.remove(&key)?;
            } else {
                count += 1;
            }
        }
        Ok(count)
    }

    fn active_edge(&self, author: &Did, recipient: &Did) -> ApiResult<Option<TrustEdge>> {
        let Some(ts) = self.active.get(pair_key(author, recipient))? else {
            return Ok(None);
        };
        let created_at_ms = millis_from_be(&ts)
            .ok_or_else(|| ApiError::Internal("corrupt active-edge index".into()))?;
        let raw = self
            .edges
            .get(edge_key(author, recipient, created_at_ms))?
            .ok_or_else(|| ApiError::Internal("active index points at missing edge".into()))?;
        Ok(Some(bincode::deserialize(&raw)?))
    }

    fn load_edge(&self, active_key: &[u8], created_at_ms: i64) -> ApiResult<TrustEdge> {
        let mut edge_k = active_key.to_vec();
        edge_k.push(0);
        edge_k.extend_from_slice(&millis_be(created_at_ms));
        let raw = self
            .edges
            .get(&edge_k)?
            .ok_or_else(|| ApiError::Internal("active index points at missing edge".into()))?;
        Ok(bincode::deserialize(&raw)?)
    }

    fn lock_author(&self, author: &Did) -> Arc<Mutex<()>> {
        self.author_locks
            .entry(author.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn pair_key(author: &Did, recipient: &Did) -> Vec<u8> {
    composite_key(&[author.as_str().as_bytes(), recipient.as_str().as_bytes()])
}

fn edge_key(author: &Did, recipient: &Did, created_at_ms: i64) -> Vec<u8> {
    composite_key(&[
        author.as_str().as_bytes(),
        recipient.as_str().as_bytes(),
        &millis_be(created_at_ms),
    ])
}

fn recent_key(author: &Did, created_at_ms: i64, recipient: &Did) -> Vec<u8> {
    composite_key(&[
        author.as_str().as_bytes(),
        &millis_be(created_at_ms),
        recipient.as_str().as_bytes(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_BULK_DELAY, TRUST_QUOTA_WINDOW};

    fn did(s: &str) -> Did {
        Did::new(s).unwrap()
    }

    fn graph_with_quota(quota: usize) -> (TrustGraph, Queue, Clock) {
        let clock = Clock::manual(1_700_000_000_000);
        let db = SchemaDb::open_temporary().unwrap();
        let queue_db = SchemaDb::open_temporary().unwrap();
        let queue = Queue::new(queue_db, [5u8; 32], clock.clone());
        let graph = TrustGraph::new(
            &db,
            queue.clone(),
            clock.clone(),
            quota,
            TRUST_QUOTA_WINDOW,
            DEFAULT_BULK_DELAY,
        )
        .unwrap();
        (graph, queue, clock)
    }

    #[test]
    fn add_list_remove_roundtrip() {
        let (graph, _q, _c) = graph_with_quota(10);
        let alice = did("did:plc:alice");
        let bob = did("did:plc:bob");

        graph.add_trusted(&alice, &bob).unwrap();
        assert!(graph.is_trusted(&alice, &bob).unwrap());
        // Trust is directed.
        assert!(!graph.is_trusted(&bob, &alice).unwrap());

        let listed = graph.list_trusted(&alice, None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].recipient_did, bob);

        graph.remove_trusted(&alice, &bob).unwrap();
        assert!(!graph.is_trusted(&alice, &bob).unwrap());
        assert!(graph.list_trusted(&alice, None).unwrap().is_empty());
    }

    #[test]
    fn duplicate_add_is_a_conflict() {
        let (graph, _q, _c) = graph_with_quota(10);
        let alice = did("did:plc:alice");
        let bob = did("did:plc:bob");
        graph.add_trusted(&alice, &bob).unwrap();
        let err = graph.add_trusted(&alice, &bob).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn remove_of_absent_edge_is_not_found() {
        let (graph, _q, _c) = graph_with_quota(10);
        let err = graph
            .remove_trusted(&did("did:plc:alice"), &did("did:plc:bob"))
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn self_trust_is_rejected() {
        let (graph, _q, _c) = graph_with_quota(10);
        let alice = did("did:plc:alice");
        let err = graph.add_trusted(&alice, &alice).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn retrust_creates_a_new_edge() {
        let (graph, _q, clock) = graph_with_quota(10);
        let alice = did("did:plc:alice");
        let bob = did("did:plc:bob");

        let first = graph.add_trusted(&alice, &bob).unwrap();
        clock.advance_ms(60_000);
        graph.remove_trusted(&alice, &bob).unwrap();
        clock.advance_ms(60_000);
        let second = graph.add_trusted(&alice, &bob).unwrap();

        assert!(second.created_at_ms > first.created_at_ms);
        // Exactly one active edge for the pair.
        let listed = graph.list_trusted(&alice, Some(&bob)).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].created_at_ms, second.created_at_ms);
    }

    #[test]
    fn quota_blocks_the_eleventh_add() {
        let (graph, _q, _c) = graph_with_quota(10);
        let alice = did("did:plc:alice");
        for i in 0..10 {
            graph
                .add_trusted(&alice, &did(&format!("did:plc:r{i}")))
                .unwrap();
        }
        let err = graph
            .add_trusted(&alice, &did("did:plc:onemore"))
            .unwrap_err();
        assert!(matches!(err, ApiError::RateLimited(_)));
    }

    #[test]
    fn quota_window_slides() {
        let (graph, _q, clock) = graph_with_quota(10);
        let alice = did("did:plc:alice");
        for i in 0..10 {
            graph
                .add_trusted(&alice, &did(&format!("did:plc:r{i}")))
                .unwrap();
        }
        // A day later the window has drained.
        clock.advance_ms(TRUST_QUOTA_WINDOW.as_millis() as i64 + 1);
        graph.add_trusted(&alice, &did("did:plc:fresh")).unwrap();
    }

    #[test]
    fn removal_does_not_refund_quota() {
        let (graph, _q, _c) = graph_with_quota(3);
        let alice = did("did:plc:alice");
        for i in 0..3 {
            let r = did(&format!("did:plc:r{i}"));
            graph.add_trusted(&alice, &r).unwrap();
            graph.remove_trusted(&alice, &r).unwrap();
        }
        // All three edges were removed, but their creations still count.
        let err = graph.add_trusted(&alice, &did("did:plc:r9")).unwrap_err();
        assert!(matches!(err, ApiError::RateLimited(_)));
    }

    #[test]
    fn bulk_add_is_all_or_nothing_under_quota() {
        let (graph, _q, _c) = graph_with_quota(10);
        let alice = did("did:plc:alice");
        for i in 0..9 {
            graph
                .add_trusted(&alice, &did(&format!("did:plc:r{i}")))
                .unwrap();
        }
        // 9 used + 3 requested > 10: nothing lands.
        let recipients: Vec<Did> = (0..3).map(|i| did(&format!("did:plc:new{i}"))).collect();
        let err = graph.bulk_add_trusted(&alice, &recipients).unwrap_err();
        assert!(matches!(err, ApiError::RateLimited(_)));
        for r in &recipients {
            assert!(!graph.is_trusted(&alice, r).unwrap());
        }
        // One more still fits.
        graph.add_trusted(&alice, &did("did:plc:fits")).unwrap();
    }

    #[test]
    fn bulk_add_skips_existing_and_returns_novel() {
        let (graph, _q, _c) = graph_with_quota(10);
        let alice = did("did:plc:alice");
        let bob = did("did:plc:bob");
        let carol = did("did:plc:carol");
        graph.add_trusted(&alice, &bob).unwrap();

        let added = graph
            .bulk_add_trusted(&alice, &[bob.clone(), carol.clone(), carol.clone()])
            .unwrap();
        assert_eq!(added, vec![carol]);
    }

    #[test]
    fn add_fans_out_to_both_session_services() {
        let (graph, queue, _c) = graph_with_quota(10);
        graph
            .add_trusted(&did("did:plc:alice"), &did("did:plc:bob"))
            .unwrap();
        for service in ServiceName::SESSION_OWNERS {
            let name = queue_name(service, ADD_RECIPIENT_TO_SESSIONS);
            assert_eq!(queue.pending_count(&name).unwrap(), 1);
        }
    }

    #[test]
    fn remove_fans_out_revoke_and_delayed_delete() {
        let (graph, queue, _c) = graph_with_quota(10);
        let alice = did("did:plc:alice");
        let bob = did("did:plc:bob");
        graph.add_trusted(&alice, &bob).unwrap();
        graph.remove_trusted(&alice, &bob).unwrap();
        for service in ServiceName::SESSION_OWNERS {
            assert_eq!(
                queue
                    .pending_count(&queue_name(service, REVOKE_SESSION))
                    .unwrap(),
                1
            );
            assert_eq!(
                queue
                    .pending_count(&queue_name(service, DELETE_SESSION_KEYS))
                    .unwrap(),
                1
            );
        }
    }

    #[test]
    fn bulk_remove_requires_at_least_one_edge() {
        let (graph, _q, _c) = graph_with_quota(10);
        let err = graph
            .bulk_remove_trusted(&did("did:plc:alice"), &[did("did:plc:bob")])
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
