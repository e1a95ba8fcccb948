// Copyright (c) 2026 Speakeasy Social. MIT License.
// See LICENSE for details.

//! # Speakeasy Control-Plane Node
//!
//! Entry point for the `spkeasy-node` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the hosted services' schemas,
//! starts the queue worker, and serves the XRPC API.
//!
//! One process can host any subset of the four logical services. The
//! default hosts all four with in-memory wiring between them, which is
//! also the only mode in which the embedded queue is shared by publisher
//! and consumer; split deployments reach their collaborators over HTTP.

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;

use spkeasy_core::clock::Clock;
use spkeasy_core::crypto::anonymize::LogAnonymizer;
use spkeasy_core::env::CoreConfig;
use spkeasy_core::graph::TrustGraph;
use spkeasy_core::identity::{IdentityVerifier, VerifierConfig};
use spkeasy_core::keystore::KeyStore;
use spkeasy_core::propagation::local::{LocalKeys, LocalTrust};
use spkeasy_core::propagation::{
    register_handlers, KeyFetcher, PropagationContext, TrustChecker,
};
use spkeasy_core::queue::{Queue, Worker};
use spkeasy_core::rpc::client::ServiceClient;
use spkeasy_core::rpc::registry::SchemaRegistry;
use spkeasy_core::rpc::ServiceName;
use spkeasy_core::sessions::SessionStore;
use spkeasy_core::storage::SchemaDb;

use cli::{Commands, HostedServices, RunArgs, SpkeasyCli};
use logging::LogFormat;
use metrics::NodeMetrics;

/// How often the pending-jobs gauge is refreshed.
const QUEUE_DEPTH_SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SpkeasyCli::parse();
    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run — node startup sequence
// ---------------------------------------------------------------------------

/// Starts the node: schemas, stores, queue worker, API server.
///
/// Startup sequence:
/// 1.  Initialize logging
/// 2.  Load configuration (environment, or generated in --dev)
/// 3.  Open schemas for the hosted services + the queue
/// 4.  Build stores and the identity verifier
/// 5.  Wire propagation handlers into the worker
/// 6.  Spawn the worker loop and the queue-depth sampler
/// 7.  Serve the XRPC API until shutdown
async fn run_node(args: RunArgs) -> Result<()> {
    let log_filter = format!(
        "spkeasy_node={level},spkeasy_core={level},tower_http=info",
        level = args.log_level
    );
    logging::init_logging(&log_filter, LogFormat::from_str_lossy(&args.log_format));

    let mut config = if args.dev {
        dev_config()
    } else {
        CoreConfig::from_env().context("reading configuration from the environment")?
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }

    tracing::info!(
        listen = %args.listen,
        service = ?args.service,
        data_dir = %config.data_dir.display(),
        dev = args.dev,
        "starting spkeasy-node"
    );

    let clock = Clock::system();
    let metrics = NodeMetrics::new();
    let registry = Arc::new(SchemaRegistry::standard());

    // --- schemas -----------------------------------------------------------

    let queue_db = open_schema(&config, args.dev, "queue")?;
    let queue = Queue::new(queue_db, config.queue_encryption_key, clock.clone());

    let hosts = |s: HostedServices| args.service == HostedServices::All || args.service == s;

    let graph = if hosts(HostedServices::TrustedUsers) {
        let db = open_schema(&config, args.dev, "trusted_users")?;
        Some(Arc::new(TrustGraph::new(
            &db,
            queue.clone(),
            clock.clone(),
            config.trust_quota,
            spkeasy_core::config::TRUST_QUOTA_WINDOW,
            config.bulk_delay,
        )?))
    } else {
        None
    };

    let keystore = if hosts(HostedServices::UserKeys) {
        let db = open_schema(&config, args.dev, "user_keys")?;
        Some(Arc::new(KeyStore::new(
            &db,
            queue.clone(),
            clock.clone(),
            config.rotate_min_age,
        )?))
    } else {
        None
    };

    let post_sessions = if hosts(HostedServices::PrivateSessions) {
        let db = open_schema(&config, args.dev, "private_sessions")?;
        Some(Arc::new(SessionStore::new(&db, clock.clone())?))
    } else {
        None
    };

    let profile_sessions = if hosts(HostedServices::PrivateProfiles) {
        let db = open_schema(&config, args.dev, "private_profiles")?;
        Some(Arc::new(SessionStore::new(&db, clock.clone())?))
    } else {
        None
    };

    // --- propagation workers ----------------------------------------------

    let mut worker = Worker::new(queue.clone(), config.worker_concurrency);
    for (service, store) in [
        (ServiceName::PrivateSessions, post_sessions.clone()),
        (ServiceName::PrivateProfiles, profile_sessions.clone()),
    ] {
        let Some(store) = store else { continue };

        // Collaborators: in-process when hosted here, HTTP otherwise.
        let trust: Arc<dyn TrustChecker> = match &graph {
            Some(graph) => Arc::new(LocalTrust::new(Arc::clone(graph))),
            None => Arc::new(service_client(service, &config, &registry)),
        };
        let keys: Arc<dyn KeyFetcher> = match &keystore {
            Some(keystore) => Arc::new(LocalKeys::new(Arc::clone(keystore))),
            None => Arc::new(service_client(service, &config, &registry)),
        };

        register_handlers(
            &mut worker,
            Arc::new(PropagationContext {
                service,
                store,
                graph: trust,
                keys,
                window: config.session_window(service),
            }),
        );
    }

    {
        let metrics = metrics.clone();
        worker.on_stats(Box::new(move |stats| metrics.record_tick(stats)));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let queue_names = worker.registered_names();
    tokio::spawn(async move {
        if let Err(e) = worker.run(shutdown_rx).await {
            tracing::error!(error = %e, "worker loop exited with error");
        }
    });
    spawn_queue_depth_sampler(queue.clone(), queue_names, metrics.clone());

    // --- identity + API ----------------------------------------------------

    let verifier = Arc::new(IdentityVerifier::new(VerifierConfig::new(
        config.trusted_hosts.clone(),
        config.service_secrets.clone(),
    )));

    let state = api::AppState {
        verifier,
        registry,
        queue,
        graph,
        keystore,
        post_sessions,
        profile_sessions,
        metrics,
        anonymizer: Arc::new(LogAnonymizer::new(
            config.log_hash_key,
            config.log_hash_salt.clone(),
        )),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let router = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    tracing::info!(addr = %args.listen, "xrpc api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
            tracing::info!("shutting down");
        })
        .await
        .context("serving the xrpc api")?;
    Ok(())
}

/// Open one service's schema: on-disk under the data dir, or a
/// temporary in-memory store in dev mode.
fn open_schema(config: &CoreConfig, dev: bool, name: &str) -> Result<SchemaDb> {
    if dev {
        return SchemaDb::open_temporary().context("opening temporary schema");
    }
    let path = config.data_dir.join(name);
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating schema directory {}", path.display()))?;
    SchemaDb::open(&path).with_context(|| format!("opening schema at {}", path.display()))
}

fn service_client(
    from: ServiceName,
    config: &CoreConfig,
    registry: &Arc<SchemaRegistry>,
) -> ServiceClient {
    ServiceClient::new(
        from,
        config.service_urls.clone(),
        config.service_secrets.clone(),
        Arc::clone(registry),
    )
}

/// Periodically sums pending jobs across the worker's queues into the
/// `jobs_pending` gauge.
fn spawn_queue_depth_sampler(queue: Queue, names: Vec<String>, metrics: NodeMetrics) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(QUEUE_DEPTH_SAMPLE_INTERVAL);
        loop {
            interval.tick().await;
            let mut pending = 0usize;
            for name in &names {
                match queue.pending_count(name) {
                    Ok(n) => pending += n,
                    Err(e) => tracing::warn!(queue = %name, error = %e, "depth sample failed"),
                }
            }
            metrics.jobs_pending.set(pending as i64);
        }
    });
}

/// Dev-mode configuration: generated secrets, loopback URLs, default
/// tunables. Worthless for production on purpose.
fn dev_config() -> CoreConfig {
    let mut config = CoreConfig::for_tests();
    config.queue_encryption_key = rand::random();
    config.log_hash_key = rand::random();
    for secret in config.service_secrets.values_mut() {
        *secret = hex::encode(rand::random::<[u8; 16]>());
    }
    config
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_version() {
    println!("spkeasy-node {}", env!("CARGO_PKG_VERSION"));
}
