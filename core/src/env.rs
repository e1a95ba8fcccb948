//! # Environment Configuration
//!
//! Everything a deployment varies lives in the process environment and is
//! parsed exactly once, at startup, into this module's structs. Handlers
//! receive explicit context; nothing reads `std::env` after boot.
//!
//! | Variable                         | Meaning                                   |
//! |----------------------------------|-------------------------------------------|
//! | `SPKEASY_DATA_DIR`               | Root directory for per-schema databases   |
//! | `SPKEASY_QUEUE_ENCRYPTION_KEY`   | 64 hex chars; queue field-encryption key  |
//! | `SPKEASY_LOG_HASH_KEY`           | 64 hex chars; log anonymisation key       |
//! | `SPKEASY_LOG_HASH_SALT`          | Log anonymisation salt                    |
//! | `SPKEASY_TRUSTED_HOSTS`          | Comma-separated federation allow-list     |
//! | `SPKEASY_API_KEY_<SERVICE>`      | Shared secret per service (4 variables)   |
//! | `SPKEASY_URL_<SERVICE>`          | Base URL per service (4 variables)        |
//! | `SPKEASY_TRUST_QUOTA`            | Daily trust-addition quota (default 10)   |
//! | `SPKEASY_BULK_DELAY_SECS`        | Undo window for bulk mutations            |
//! | `SPKEASY_ROTATE_MIN_AGE_SECS`    | Minimum keypair age before rotation       |
//! | `SPKEASY_POST_WINDOW_DAYS`       | Recipient-addition window, post store     |
//! | `SPKEASY_PROFILE_WINDOW_DAYS`    | Recipient-addition window, profile store  |
//! | `SPKEASY_WORKER_CONCURRENCY`     | Concurrent jobs per queue name            |

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config;
use crate::rpc::ServiceName;

/// Errors raised while reading the environment. These abort startup; a
/// half-configured control plane is worse than a dead one.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("missing environment variable: {0}")]
    Missing(String),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// A 32-byte key parsed from 64 hex characters.
fn parse_key_hex(name: &str, value: &str) -> Result<[u8; 32], EnvError> {
    let bytes = hex::decode(value).map_err(|e| EnvError::Invalid {
        name: name.into(),
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|_| EnvError::Invalid {
        name: name.into(),
        reason: "expected 64 hex characters".into(),
    })
}

fn var(name: &str) -> Result<String, EnvError> {
    std::env::var(name).map_err(|_| EnvError::Missing(name.into()))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, value: String) -> Result<T, EnvError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| EnvError::Invalid {
        name: name.into(),
        reason: e.to_string(),
    })
}

fn env_suffix(service: ServiceName) -> &'static str {
    match service {
        ServiceName::TrustedUsers => "TRUSTED_USERS",
        ServiceName::UserKeys => "USER_KEYS",
        ServiceName::PrivateSessions => "PRIVATE_SESSIONS",
        ServiceName::PrivateProfiles => "PRIVATE_PROFILES",
    }
}

const ALL_SERVICES: [ServiceName; 4] = [
    ServiceName::TrustedUsers,
    ServiceName::UserKeys,
    ServiceName::PrivateSessions,
    ServiceName::PrivateProfiles,
];

/// The full control-plane configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Root directory; each schema opens `<data_dir>/<schema>`.
    pub data_dir: PathBuf,
    /// Queue field-encryption key. Read-only after startup.
    pub queue_encryption_key: [u8; 32],
    /// Log anonymisation key and salt.
    pub log_hash_key: [u8; 32],
    pub log_hash_salt: String,
    /// Federation hosts trusted without the subdomain proof.
    pub trusted_hosts: Vec<String>,
    /// Shared secret per service.
    pub service_secrets: HashMap<ServiceName, String>,
    /// Base URL per service, e.g. `http://user-keys.internal:8585`.
    pub service_urls: HashMap<ServiceName, String>,
    /// Daily trust-addition quota per author.
    pub trust_quota: usize,
    /// Undo window applied to bulk-spawned jobs.
    pub bulk_delay: Duration,
    /// Minimum current-keypair age before rotation is accepted.
    pub rotate_min_age: Duration,
    /// Recipient-addition recency window per session store.
    pub post_session_window: Duration,
    pub profile_session_window: Duration,
    /// Concurrent jobs per queue name.
    pub worker_concurrency: usize,
}

impl CoreConfig {
    /// Read the full configuration from the process environment.
    pub fn from_env() -> Result<Self, EnvError> {
        let mut service_secrets = HashMap::new();
        let mut service_urls = HashMap::new();
        for service in ALL_SERVICES {
            let suffix = env_suffix(service);
            service_secrets.insert(service, var(&format!("SPKEASY_API_KEY_{suffix}"))?);
            service_urls.insert(service, var(&format!("SPKEASY_URL_{suffix}"))?);
        }

        let quota: usize = parse_var(
            "SPKEASY_TRUST_QUOTA",
            var_or(
                "SPKEASY_TRUST_QUOTA",
                &config::DEFAULT_TRUST_QUOTA.to_string(),
            ),
        )?;

        Ok(Self {
            data_dir: PathBuf::from(var_or("SPKEASY_DATA_DIR", "./data")),
            queue_encryption_key: parse_key_hex(
                "SPKEASY_QUEUE_ENCRYPTION_KEY",
                &var("SPKEASY_QUEUE_ENCRYPTION_KEY")?,
            )?,
            log_hash_key: parse_key_hex("SPKEASY_LOG_HASH_KEY", &var("SPKEASY_LOG_HASH_KEY")?)?,
            log_hash_salt: var_or("SPKEASY_LOG_HASH_SALT", "spkeasy"),
            trusted_hosts: parse_hosts(&var_or(
                "SPKEASY_TRUSTED_HOSTS",
                &config::DEFAULT_TRUSTED_HOSTS.join(","),
            )),
            service_secrets,
            service_urls,
            trust_quota: quota,
            bulk_delay: Duration::from_secs(parse_var(
                "SPKEASY_BULK_DELAY_SECS",
                var_or(
                    "SPKEASY_BULK_DELAY_SECS",
                    &config::DEFAULT_BULK_DELAY.as_secs().to_string(),
                ),
            )?),
            rotate_min_age: Duration::from_secs(parse_var(
                "SPKEASY_ROTATE_MIN_AGE_SECS",
                var_or(
                    "SPKEASY_ROTATE_MIN_AGE_SECS",
                    &config::DEFAULT_ROTATE_MIN_AGE.as_secs().to_string(),
                ),
            )?),
            post_session_window: Duration::from_secs(
                parse_var::<u64>(
                    "SPKEASY_POST_WINDOW_DAYS",
                    var_or("SPKEASY_POST_WINDOW_DAYS", "30"),
                )? * 24
                    * 60
                    * 60,
            ),
            profile_session_window: Duration::from_secs(
                parse_var::<u64>(
                    "SPKEASY_PROFILE_WINDOW_DAYS",
                    var_or("SPKEASY_PROFILE_WINDOW_DAYS", "365"),
                )? * 24
                    * 60
                    * 60,
            ),
            worker_concurrency: parse_var(
                "SPKEASY_WORKER_CONCURRENCY",
                var_or(
                    "SPKEASY_WORKER_CONCURRENCY",
                    &config::DEFAULT_WORKER_CONCURRENCY.to_string(),
                ),
            )?,
        })
    }

    /// A configuration for tests: fixed keys, default tunables, no
    /// environment reads, URLs that refuse connections fast.
    pub fn for_tests() -> Self {
        let mut service_secrets = HashMap::new();
        let mut service_urls = HashMap::new();
        for service in ALL_SERVICES {
            service_secrets.insert(service, format!("test-secret-{service}"));
            service_urls.insert(service, format!("http://127.0.0.1:1/{service}"));
        }
        Self {
            data_dir: PathBuf::from("/nonexistent-test-data"),
            queue_encryption_key: [0x11; 32],
            log_hash_key: [0x22; 32],
            log_hash_salt: "test".into(),
            trusted_hosts: config::DEFAULT_TRUSTED_HOSTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            service_secrets,
            service_urls,
            trust_quota: config::DEFAULT_TRUST_QUOTA,
            bulk_delay: config::DEFAULT_BULK_DELAY,
            rotate_min_age: config::DEFAULT_ROTATE_MIN_AGE,
            post_session_window: config::DEFAULT_POST_SESSION_WINDOW,
            profile_session_window: config::DEFAULT_PROFILE_SESSION_WINDOW,
            worker_concurrency: config::DEFAULT_WORKER_CONCURRENCY,
        }
    }

    /// The recipient-addition window for a session-owning service.
    pub fn session_window(&self, service: ServiceName) -> Duration {
        match service {
            ServiceName::PrivateProfiles => self.profile_session_window,
            _ => self.post_session_window,
        }
    }
}

fn parse_hosts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_list_parsing_trims_and_drops_empties() {
        let hosts = parse_hosts(" bsky.social, blacksky.app ,,bsky.network ");
        assert_eq!(hosts, vec!["bsky.social", "blacksky.app", "bsky.network"]);
    }

    #[test]
    fn key_hex_parsing() {
        let key = parse_key_hex("K", &"ab".repeat(32)).unwrap();
        assert_eq!(key[0], 0xab);
        assert!(parse_key_hex("K", "abcd").is_err());
        assert!(parse_key_hex("K", "not hex at all").is_err());
    }

    #[test]
    fn test_config_windows_differ_per_store() {
        let cfg = CoreConfig::for_tests();
        assert!(
            cfg.session_window(ServiceName::PrivateProfiles)
                > cfg.session_window(ServiceName::PrivateSessions)
        );
    }
}
