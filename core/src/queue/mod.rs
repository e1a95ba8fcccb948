//! # Durable Job Queue
//!
//! At-least-once delivery over named queues, backed by the queue's own
//! storage schema. This is the only channel between the trust graph, the
//! keystore, and the session stores; nothing else crosses service
//! boundaries asynchronously.
//!
//! ## Tree Layout
//!
//! | Tree               | Key                       | Value                   |
//! |--------------------|---------------------------|-------------------------|
//! | `pending_<name>`   | `due_ms (8B BE) ‖ id (8B BE)` | `bincode(StoredJob)` |
//! | `active_<name>`    | `id (8B BE)`              | `bincode(StoredJob)`    |
//! | `quarantine`       | `name ‖ NUL ‖ id (8B BE)` | `bincode(QuarantinedJob)` |
//!
//! Because pending keys lead with the due timestamp, "everything ready to
//! run" is one range scan, and FIFO order within a name falls out of the
//! key encoding. Claiming moves a job from pending to active in one
//! storage transaction, so a crashed worker leaves jobs parked in
//! `active_*` where startup recovery re-pends them. A worker that dies
//! after finishing but before deleting the active row causes a duplicate
//! delivery; handlers are idempotent, which is what at-least-once means.
//!
//! ## Field encryption
//!
//! A publish may mark payload fields sensitive. Those fields are sealed
//! with the process-wide queue key before the record is written and opened
//! on dispatch, so private keys and bearer tokens exist in plaintext only
//! inside the consuming handler's memory.

pub mod job;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Tree;
use tokio::sync::{watch, Notify};

use crate::clock::Clock;
use crate::config::{AES_KEY_LENGTH, WORKER_POLL_INTERVAL};
use crate::crypto::encryption;
use crate::error::{ApiError, ApiResult};
use crate::storage::{composite_key, millis_be, SchemaDb};

pub use job::{Job, JobOptions, JobOutcome, QuarantinedJob, RetryPolicy, StoredJob};

/// A queue job handler. Registered per queue name; invoked once per
/// delivery with the decrypted payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> ApiResult<JobOutcome>;
}

/// The durable queue. Clone-friendly; clones share storage and wakeups.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    db: SchemaDb,
    key: [u8; AES_KEY_LENGTH],
    clock: Clock,
    notify: Notify,
}

impl Queue {
    /// Open a queue over its own schema with the process-wide field
    /// encryption key.
    pub fn new(db: SchemaDb, key: [u8; AES_KEY_LENGTH], clock: Clock) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                db,
                key,
                clock,
                notify: Notify::new(),
            }),
        }
    }

    /// Schedule exactly one job.
    pub fn publish<T: serde::Serialize>(
        &self,
        name: &str,
        payload: &T,
        opts: &JobOptions,
    ) -> ApiResult<u64> {
        let ids = self.publish_batch(name, std::slice::from_ref(payload), opts)?;
        Ok(ids[0])
    }

    /// Atomically schedule many same-named jobs. All land or none do.
    pub fn bulk_publish<T: serde::Serialize>(
        &self,
        name: &str,
        payloads: &[T],
        opts: &JobOptions,
    ) -> ApiResult<Vec<u64>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        self.publish_batch(name, payloads, opts)
    }

    fn publish_batch<T: serde::Serialize>(
        &self,
        name: &str,
        payloads: &[T],
        opts: &JobOptions,
    ) -> ApiResult<Vec<u64>> {
        let now_ms = self.inner.clock.now_ms();
        let due_ms = now_ms + opts.start_after.map_or(0, |d| d.as_millis() as i64);

        let mut batch = sled::Batch::default();
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let data = self.seal_payload(payload, &opts.encrypted_fields)?;
            let id = self.inner.db.generate_id()?;
            let stored = StoredJob {
                id,
                name: name.to_string(),
                data,
                encrypted_fields: opts.encrypted_fields.iter().map(|s| s.to_string()).collect(),
                retry: opts.retry.clone(),
                attempt: 0,
                created_at_ms: now_ms,
                due_ms,
            };
            batch.insert(pending_key(due_ms, id), bincode::serialize(&stored)?);
            ids.push(id);
        }
        self.pending_tree(name)?.apply_batch(batch)?;
        self.inner.notify.notify_waiters();
        Ok(ids)
    }

    /// Serialize a payload, sealing the named fields in place.
    fn seal_payload<T: serde::Serialize>(
        &self,
        payload: &T,
        encrypted_fields: &[&'static str],
    ) -> ApiResult<String> {
        let mut value = serde_json::to_value(payload)
            .map_err(|e| ApiError::Internal(format!("unserializable job payload: {e}")))?;
        if !encrypted_fields.is_empty() {
            let obj = value.as_object_mut().ok_or_else(|| {
                ApiError::Validation("field encryption requires an object payload".into())
            })?;
            for field in encrypted_fields {
                let Some(plain) = obj.get(*field) else {
                    return Err(ApiError::Validation(format!(
                        "encrypted field {field} missing from payload"
                    )));
                };
                let raw = serde_json::to_vec(plain)
                    .map_err(|e| ApiError::Internal(format!("unserializable field: {e}")))?;
                let sealed = encryption::seal(&self.inner.key, &raw)
                    .map_err(|e| ApiError::Internal(format!("field seal failed: {e}")))?;
                obj.insert(field.to_string(), serde_json::Value::String(BASE64.encode(sealed)));
            }
        }
        Ok(value.to_string())
    }

    /// Parse a stored payload, opening sealed fields. The result lives in
    /// handler memory only.
    fn open_payload(&self, stored: &StoredJob) -> ApiResult<serde_json::Value> {
        let mut value: serde_json::Value = serde_json::from_str(&stored.data)
            .map_err(|e| ApiError::Internal(format!("corrupt stored payload: {e}")))?;
        if !stored.encrypted_fields.is_empty() {
            let obj = value.as_object_mut().ok_or_else(|| {
                ApiError::Internal("stored encrypted payload is not an object".into())
            })?;
            for field in &stored.encrypted_fields {
                let Some(serde_json::Value::String(b64)) = obj.get(field) else {
                    return Err(ApiError::Internal(format!(
                        "sealed field {field} missing or not a string"
                    )));
                };
                let sealed = BASE64
                    .decode(b64)
                    .map_err(|e| ApiError::Internal(format!("sealed field corrupt: {e}")))?;
                let raw = encryption::open(&self.inner.key, &sealed)
                    .map_err(|e| ApiError::Internal(format!("field open failed: {e}")))?;
                let plain: serde_json::Value = serde_json::from_slice(&raw)
                    .map_err(|e| ApiError::Internal(format!("sealed field corrupt: {e}")))?;
                obj.insert(field.clone(), plain);
            }
        }
        Ok(value)
    }

    /// Jobs currently pending for a name, due or not.
    pub fn pending_count(&self, name: &str) -> ApiResult<usize> {
        Ok(self.pending_tree(name)?.len())
    }

    /// Quarantined jobs for a name, oldest first.
    pub fn quarantined(&self, name: &str) -> ApiResult<Vec<QuarantinedJob>> {
        let tree = self.inner.db.open_tree("quarantine")?;
        let prefix = composite_key(&[name.as_bytes(), &[]]);
        let mut out = Vec::new();
        for entry in tree.scan_prefix(&prefix) {
            let (_, v) = entry?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }

    fn pending_tree(&self, name: &str) -> sled::Result<Tree> {
        self.inner.db.open_tree(&format!("pending_{name}"))
    }

    fn active_tree(&self, name: &str) -> sled::Result<Tree> {
        self.inner.db.open_tree(&format!("active_{name}"))
    }

    /// Claim every job due at or before now: each moves from pending to
    /// active in one storage transaction, so two workers scanning the
    /// same range cannot both own a job.
    fn claim_due(&self, name: &str) -> ApiResult<Vec<StoredJob>> {
        let pending = self.pending_tree(name)?;
        let active = self.active_tree(name)?;
        let horizon = pending_key(self.inner.clock.now_ms(), u64::MAX);

        let mut claimed = Vec::new();
        for entry in pending.range(..=horizon) {
            let (key, _) = entry?;
            let moved: Result<Option<sled::IVec>, TransactionError<()>> = (&pending, &active)
                .transaction(|(p, a)| {
                    match p.remove(key.as_ref())? {
                        Some(value) => {
                            let stored: StoredJob = bincode::deserialize(&value)
                                .map_err(|_| {
                                    ConflictableTransactionError::Storage(sled::Error::Unsupported(
                                        "corrupt job record".into(),
                                    ))
                                })?;
                            a.insert(&stored.id.to_be_bytes(), value.clone())?;
                            Ok(Some(value))
                        }
                        // Another worker won the race for this key.
                        None => Ok(None),
                    }
                });
            match moved {
                Ok(Some(value)) => claimed.push(bincode::deserialize::<StoredJob>(&value)?),
                Ok(None) => {}
                Err(TransactionError::Storage(e)) => return Err(e.into()),
                Err(TransactionError::Abort(())) => {}
            }
        }
        Ok(claimed)
    }

    /// Delivery bookkeeping after a handler ran (or errored).
    fn settle(&self, stored: StoredJob, result: SettleAction) -> ApiResult<()> {
        let active = self.active_tree(&stored.name)?;
        match result {
            SettleAction::Done => {
                active.remove(stored.id.to_be_bytes())?;
            }
            SettleAction::Retry { delay_ms } => {
                let mut next = stored.clone();
                next.due_ms = self.inner.clock.now_ms() + delay_ms;
                self.pending_tree(&stored.name)?
                    .insert(pending_key(next.due_ms, next.id), bincode::serialize(&next)?)?;
                active.remove(stored.id.to_be_bytes())?;
            }
            SettleAction::Quarantine { error } => {
                let record = QuarantinedJob {
                    quarantined_at_ms: self.inner.clock.now_ms(),
                    last_error: error,
                    job: stored.clone(),
                };
                self.inner.db.open_tree("quarantine")?.insert(
                    composite_key(&[stored.name.as_bytes(), &stored.id.to_be_bytes()]),
                    bincode::serialize(&record)?,
                )?;
                active.remove(stored.id.to_be_bytes())?;
            }
        }
        Ok(())
    }

    /// Move orphaned active jobs (a previous process died mid-flight)
    /// back to pending. Called once at worker startup.
    fn recover_active(&self, name: &str) -> ApiResult<usize> {
        let active = self.active_tree(name)?;
        let pending = self.pending_tree(name)?;
        let now_ms = self.inner.clock.now_ms();
        let mut recovered = 0;
        for entry in active.iter() {
            let (key, value) = entry?;
            let mut stored: StoredJob = bincode::deserialize(&value)?;
            stored.due_ms = now_ms;
            pending.insert(pending_key(stored.due_ms, stored.id), bincode::serialize(&stored)?)?;
            active.remove(key)?;
            recovered += 1;
        }
        Ok(recovered)
    }
}

fn pending_key(due_ms: i64, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&millis_be(due_ms));
    key.extend_from_slice(&id.to_be_bytes());
    key
}

enum SettleAction {
    Done,
    Retry { delay_ms: i64 },
    Quarantine { error: String },
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Per-tick delivery statistics, for metrics and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub completed: usize,
    pub aborted: usize,
    pub retried: usize,
    pub quarantined: usize,
}

impl TickStats {
    pub fn processed(&self) -> usize {
        self.completed + self.aborted + self.retried + self.quarantined
    }

    fn merge(&mut self, other: TickStats) {
        self.completed += other.completed;
        self.aborted += other.aborted;
        self.retried += other.retried;
        self.quarantined += other.quarantined;
    }
}

/// Drains registered queue names with bounded concurrency per name.
pub struct Worker {
    queue: Queue,
    concurrency: usize,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    stats_hook: Option<Box<dyn Fn(TickStats) + Send + Sync>>,
}

impl Worker {
    pub fn new(queue: Queue, concurrency: usize) -> Self {
        Self {
            queue,
            concurrency: concurrency.max(1),
            handlers: HashMap::new(),
            stats_hook: None,
        }
    }

    /// Register a handler for a queue name. Last registration wins.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Observe every non-empty tick. The node uses this to feed metrics.
    pub fn on_stats(&mut self, hook: Box<dyn Fn(TickStats) + Send + Sync>) {
        self.stats_hook = Some(hook);
    }

    /// Queue names with a registered handler.
    pub fn registered_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// The queue this worker drains.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// One pass: claim and run everything currently due, across all
    /// registered names.
    pub async fn tick(&self) -> ApiResult<TickStats> {
        let mut stats = TickStats::default();
        for (name, handler) in &self.handlers {
            stats.merge(self.tick_name(name, handler).await?);
        }
        Ok(stats)
    }

    async fn tick_name(&self, name: &str, handler: &Arc<dyn JobHandler>) -> ApiResult<TickStats> {
        let claimed = self.queue.claim_due(name)?;
        if claimed.is_empty() {
            return Ok(TickStats::default());
        }

        let results = futures::stream::iter(claimed)
            .map(|stored| {
                let queue = self.queue.clone();
                let handler = Arc::clone(handler);
                async move {
                    let outcome = deliver(&queue, &handler, &stored).await;
                    settle_outcome(&queue, stored, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut stats = TickStats::default();
        for r in results {
            stats.merge(r?);
        }
        Ok(stats)
    }

    /// Run ticks until nothing is due. Delayed jobs stay parked; this
    /// returns once the *currently due* backlog is empty.
    pub async fn drain(&self) -> ApiResult<TickStats> {
        let mut total = TickStats::default();
        loop {
            let stats = self.tick().await?;
            if stats.processed() == 0 {
                return Ok(total);
            }
            total.merge(stats);
        }
    }

    /// Long-running worker loop. Wakes on local publishes, polls on an
    /// interval for cross-process publishes and delayed jobs, exits when
    /// the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ApiResult<()> {
        for name in self.handlers.keys() {
            let recovered = self.queue.recover_active(name)?;
            if recovered > 0 {
                tracing::info!(queue = %name, recovered, "recovered in-flight jobs");
            }
        }
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let stats = self.tick().await?;
            if stats.processed() == 0 {
                tokio::select! {
                    _ = self.queue.inner.notify.notified() => {}
                    _ = tokio::time::sleep(WORKER_POLL_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
            } else if let Some(hook) = &self.stats_hook {
                hook(stats);
            }
        }
    }
}

async fn deliver(
    queue: &Queue,
    handler: &Arc<dyn JobHandler>,
    stored: &StoredJob,
) -> ApiResult<JobOutcome> {
    let data = queue.open_payload(stored)?;
    let job = Job {
        id: stored.id,
        name: stored.name.clone(),
        attempt: stored.attempt + 1,
        data,
    };
    handler.handle(job).await
}

fn settle_outcome(
    queue: &Queue,
    mut stored: StoredJob,
    outcome: ApiResult<JobOutcome>,
) -> ApiResult<TickStats> {
    stored.attempt += 1;
    let mut stats = TickStats::default();
    match outcome {
        Ok(JobOutcome::Complete) => {
            queue.settle(stored, SettleAction::Done)?;
            stats.completed = 1;
        }
        Ok(JobOutcome::Abort { reason }) => {
            tracing::info!(name = %stored.name, id = stored.id, %reason, "job aborted");
            queue.settle(stored, SettleAction::Done)?;
            stats.aborted = 1;
        }
        Err(e) if e.is_retryable() && stored.attempt < stored.retry.limit => {
            let delay = stored.retry.delay_after(stored.attempt);
            tracing::warn!(
                name = %stored.name,
                id = stored.id,
                attempt = stored.attempt,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "job failed, will retry"
            );
            let delay_ms = delay.as_millis() as i64;
            queue.settle(stored, SettleAction::Retry { delay_ms })?;
            stats.retried = 1;
        }
        Err(e) => {
            tracing::error!(
                name = %stored.name,
                id = stored.id,
                attempt = stored.attempt,
                error = %e,
                "job quarantined"
            );
            let error = e.to_string();
            queue.settle(stored, SettleAction::Quarantine { error })?;
            stats.quarantined = 1;
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        who: String,
        private_key: String,
    }

    fn test_queue() -> (Queue, Clock) {
        let clock = Clock::manual(1_700_000_000_000);
        let db = SchemaDb::open_temporary().unwrap();
        (Queue::new(db, [9u8; 32], clock.clone()), clock)
    }

    struct Recorder {
        seen: Mutex<Vec<Job>>,
        outcome: Box<dyn Fn(&Job) -> ApiResult<JobOutcome> + Send + Sync>,
    }

    impl Recorder {
        fn completing() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                outcome: Box::new(|_| Ok(JobOutcome::Complete)),
            })
        }

        fn failing_with(err: fn() -> ApiError) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                outcome: Box::new(move |_| Err(err())),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: Job) -> ApiResult<JobOutcome> {
            let outcome = (self.outcome)(&job);
            self.seen.lock().push(job);
            outcome
        }
    }

    fn worker_with(queue: &Queue, name: &str, handler: Arc<Recorder>) -> Worker {
        let mut w = Worker::new(queue.clone(), 4);
        w.register(name, handler);
        w
    }

    #[tokio::test]
    async fn publish_and_deliver_plaintext_payload() {
        let (queue, _clock) = test_queue();
        let handler = Recorder::completing();
        let worker = worker_with(&queue, "jobs", Arc::clone(&handler));

        queue
            .publish(
                "jobs",
                &Payload {
                    who: "alice".into(),
                    private_key: "hunter2".into(),
                },
                &JobOptions::default(),
            )
            .unwrap();

        let stats = worker.drain().await.unwrap();
        assert_eq!(stats.completed, 1);
        let seen = handler.seen.lock();
        let got: Payload = seen[0].parse().unwrap();
        assert_eq!(got.who, "alice");
    }

    #[tokio::test]
    async fn sealed_fields_are_ciphertext_at_rest_and_plaintext_in_handler() {
        let (queue, _clock) = test_queue();
        let handler = Recorder::completing();
        let worker = worker_with(&queue, "jobs", Arc::clone(&handler));

        let opts = JobOptions {
            encrypted_fields: vec!["privateKey"],
            ..Default::default()
        };
        queue
            .publish(
                "jobs",
                &Payload {
                    who: "alice".into(),
                    private_key: "very-secret-key".into(),
                },
                &opts,
            )
            .unwrap();

        // At rest: the stored JSON must not contain the plaintext.
        let pending = queue.pending_tree("jobs").unwrap();
        let (_, raw) = pending.iter().next().unwrap().unwrap();
        let stored: StoredJob = bincode::deserialize(&raw).unwrap();
        assert!(!stored.data.contains("very-secret-key"));
        assert!(stored.data.contains("alice"));

        // In the handler: plaintext restored.
        worker.drain().await.unwrap();
        let seen = handler.seen.lock();
        let got: Payload = seen[0].parse().unwrap();
        assert_eq!(got.private_key, "very-secret-key");
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_their_start_time() {
        let (queue, clock) = test_queue();
        let handler = Recorder::completing();
        let worker = worker_with(&queue, "jobs", Arc::clone(&handler));

        let opts = JobOptions {
            start_after: Some(Duration::from_secs(120)),
            ..Default::default()
        };
        queue
            .publish(
                "jobs",
                &Payload {
                    who: "late".into(),
                    private_key: String::new(),
                },
                &opts,
            )
            .unwrap();

        assert_eq!(worker.drain().await.unwrap().processed(), 0);
        clock.advance_ms(119_999);
        assert_eq!(worker.drain().await.unwrap().processed(), 0);
        clock.advance_ms(1);
        assert_eq!(worker.drain().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn failed_jobs_retry_with_backoff_then_quarantine() {
        let (queue, clock) = test_queue();
        let handler = Recorder::failing_with(|| ApiError::Upstream("down".into()));
        let worker = worker_with(&queue, "jobs", Arc::clone(&handler));

        let opts = JobOptions {
            retry: RetryPolicy {
                limit: 3,
                delay_ms: 60_000,
                backoff: 2.0,
            },
            ..Default::default()
        };
        queue
            .publish(
                "jobs",
                &Payload {
                    who: "doomed".into(),
                    private_key: String::new(),
                },
                &opts,
            )
            .unwrap();

        // Attempt 1 fails, schedules retry at +60 s.
        assert_eq!(worker.drain().await.unwrap().retried, 1);
        assert_eq!(worker.drain().await.unwrap().processed(), 0);

        clock.advance_ms(60_000);
        // Attempt 2 fails, retry at +120 s.
        assert_eq!(worker.drain().await.unwrap().retried, 1);

        clock.advance_ms(120_000);
        // Attempt 3 exhausts the limit.
        let stats = worker.drain().await.unwrap();
        assert_eq!(stats.quarantined, 1);
        assert_eq!(handler.seen.lock().len(), 3);

        let q = queue.quarantined("jobs").unwrap();
        assert_eq!(q.len(), 1);
        assert!(q[0].last_error.contains("down"));
    }

    #[tokio::test]
    async fn non_retryable_errors_quarantine_immediately() {
        let (queue, _clock) = test_queue();
        let handler = Recorder::failing_with(|| ApiError::Internal("invariant broken".into()));
        let worker = worker_with(&queue, "jobs", Arc::clone(&handler));

        queue
            .publish(
                "jobs",
                &Payload {
                    who: "x".into(),
                    private_key: String::new(),
                },
                &JobOptions::default(),
            )
            .unwrap();

        let stats = worker.drain().await.unwrap();
        assert_eq!(stats.quarantined, 1);
        assert_eq!(handler.seen.lock().len(), 1);
    }

    struct Aborter;

    #[async_trait]
    impl JobHandler for Aborter {
        async fn handle(&self, _job: Job) -> ApiResult<JobOutcome> {
            Ok(JobOutcome::abort("no longer trusted"))
        }
    }

    #[tokio::test]
    async fn aborted_jobs_are_dropped_without_retry() {
        let (queue, _clock) = test_queue();
        let mut worker = Worker::new(queue.clone(), 2);
        worker.register("jobs", Arc::new(Aborter));

        queue
            .publish(
                "jobs",
                &Payload {
                    who: "x".into(),
                    private_key: String::new(),
                },
                &JobOptions::default(),
            )
            .unwrap();

        let stats = worker.drain().await.unwrap();
        assert_eq!(stats.aborted, 1);
        assert_eq!(queue.pending_count("jobs").unwrap(), 0);
        assert!(queue.quarantined("jobs").unwrap().is_empty());
    }

    #[tokio::test]
    async fn bulk_publish_is_atomic_and_fifo() {
        let (queue, _clock) = test_queue();
        let handler = Recorder::completing();
        let worker = worker_with(&queue, "jobs", Arc::clone(&handler));

        let payloads: Vec<Payload> = (0..5)
            .map(|i| Payload {
                who: format!("user-{i}"),
                private_key: String::new(),
            })
            .collect();
        let ids = queue
            .bulk_publish("jobs", &payloads, &JobOptions::default())
            .unwrap();
        assert_eq!(ids.len(), 5);
        assert_eq!(queue.pending_count("jobs").unwrap(), 5);

        worker.drain().await.unwrap();
        let seen = handler.seen.lock();
        let order: Vec<String> = seen
            .iter()
            .map(|j| j.parse::<Payload>().unwrap().who)
            .collect();
        assert_eq!(order, vec!["user-0", "user-1", "user-2", "user-3", "user-4"]);
    }

    #[tokio::test]
    async fn names_are_independent() {
        let (queue, _clock) = test_queue();
        let handler = Recorder::completing();
        let worker = worker_with(&queue, "a", Arc::clone(&handler));

        queue
            .publish(
                "b",
                &Payload {
                    who: "other".into(),
                    private_key: String::new(),
                },
                &JobOptions::default(),
            )
            .unwrap();

        // Worker only registered for "a"; "b" stays put.
        assert_eq!(worker.drain().await.unwrap().processed(), 0);
        assert_eq!(queue.pending_count("b").unwrap(), 1);
    }

    #[tokio::test]
    async fn recover_active_reschedules_orphans() {
        let (queue, _clock) = test_queue();
        queue
            .publish(
                "jobs",
                &Payload {
                    who: "orphan".into(),
                    private_key: String::new(),
                },
                &JobOptions::default(),
            )
            .unwrap();

        // Simulate a crash: claim moves the job to active, then nothing
        // settles it.
        let claimed = queue.claim_due("jobs").unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(queue.pending_count("jobs").unwrap(), 0);

        assert_eq!(queue.recover_active("jobs").unwrap(), 1);
        assert_eq!(queue.pending_count("jobs").unwrap(), 1);
    }
}
