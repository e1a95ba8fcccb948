//! # Job Types
//!
//! What a job looks like to a publisher (options), to the store (the
//! persisted record), and to a handler (name, attempt, decrypted data).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{
    DEFAULT_RETRY_BACKOFF, DEFAULT_RETRY_DELAY, DEFAULT_RETRY_LIMIT, MAX_RETRY_DELAY,
};

/// Retry policy for a job: bounded attempts with exponential back-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before quarantine. Attempt 1 is the first delivery.
    pub limit: u32,
    /// Delay before the first retry.
    pub delay_ms: u64,
    /// Multiplier per subsequent retry.
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RETRY_LIMIT,
            delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `failed_attempt` (1-based),
    /// capped so back-off cannot push a job into next week.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let factor = self.backoff.powi(failed_attempt.saturating_sub(1) as i32);
        let ms = (self.delay_ms as f64 * factor).min(MAX_RETRY_DELAY.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Options supplied at publish time.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Earliest delivery time, as a delay from now. `None` is immediate.
    pub start_after: Option<Duration>,
    /// Retry policy. Defaults to 12 attempts, 60 s base, ×2 back-off.
    pub retry: RetryPolicy,
    /// Top-level payload fields to encrypt at rest. Names refer to the
    /// serialized (camelCase) JSON keys.
    pub encrypted_fields: Vec<&'static str>,
}

/// The persisted job record. The payload is stored as a JSON string with
/// any sensitive fields already sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredJob {
    pub id: u64,
    pub name: String,
    /// JSON object, sensitive fields base64-sealed in place.
    pub data: String,
    /// Which fields of `data` are sealed.
    pub encrypted_fields: Vec<String>,
    pub retry: RetryPolicy,
    /// Delivery attempts so far.
    pub attempt: u32,
    pub created_at_ms: i64,
    pub due_ms: i64,
}

/// What a handler receives: the payload with sensitive fields restored
/// to plaintext, in memory only.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub name: String,
    pub attempt: u32,
    pub data: serde_json::Value,
}

impl Job {
    /// Deserialize the payload into its typed form.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::error::ApiError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            crate::error::ApiError::Validation(format!("malformed {} payload: {e}", self.name))
        })
    }
}

/// A handler's verdict on a job it ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Work done (or idempotently already done).
    Complete,
    /// The world changed since enqueue; the job no longer applies and
    /// must not retry.
    Abort { reason: String },
}

impl JobOutcome {
    pub fn abort(reason: impl Into<String>) -> Self {
        JobOutcome::Abort {
            reason: reason.into(),
        }
    }
}

/// A quarantined job, kept for operator attention with the error that
/// exhausted or bypassed its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantinedJob {
    pub job: StoredJob,
    pub last_error: String,
    pub quarantined_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let retry = RetryPolicy {
            limit: 12,
            delay_ms: 60_000,
            backoff: 2.0,
        };
        assert_eq!(retry.delay_after(1), Duration::from_secs(60));
        assert_eq!(retry.delay_after(2), Duration::from_secs(120));
        assert_eq!(retry.delay_after(3), Duration::from_secs(240));
        // Attempt 40 would be ~2^39 minutes; the cap holds it down.
        assert_eq!(retry.delay_after(40), MAX_RETRY_DELAY);
    }

    #[test]
    fn default_policy_matches_deployment_defaults() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.limit, 12);
        assert_eq!(retry.delay_ms, 60_000);
    }

    #[test]
    fn job_parse_surfaces_validation_errors() {
        let job = Job {
            id: 1,
            name: "test-job".into(),
            attempt: 1,
            data: serde_json::json!({"unexpected": true}),
        };
        #[derive(serde::Deserialize)]
        struct Want {
            #[allow(dead_code)]
            required: String,
        }
        assert!(job.parse::<Want>().is_err());
    }
}
