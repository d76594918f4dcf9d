mod repos;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use armada_reconciler::{HttpGitserverClient, ReconcilerConfig};
use armada_sources::{ExternalServiceConfig, SourceRegistry};
use armada_store::Store;
use armada_syncer::SyncerConfig;

use crate::repos::PgRepoStore;

#[derive(Parser)]
#[command(name = "armada", about = "Armada — reconciler and syncer daemons")]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Path to the external services config (JSON array of host configs)
    #[arg(long, env = "EXTERNAL_SERVICES_CONFIG", default_value = "./external-services.json")]
    external_services_config: PathBuf,

    /// Base URL of the gitserver instance
    #[arg(long, env = "GITSERVER_URL", default_value = "http://127.0.0.1:3178")]
    gitserver_url: String,

    /// Number of reconciler workers
    #[arg(long, env = "RECONCILER_WORKERS", default_value_t = 4)]
    reconciler_workers: usize,

    /// Number of syncer workers
    #[arg(long, env = "SYNCER_WORKERS", default_value_t = 2)]
    syncer_workers: usize,

    /// Seconds between heartbeats for in-flight changesets
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 15)]
    heartbeat_interval: u64,

    /// Seconds after which a silent worker's changeset is considered stalled
    #[arg(long, env = "STALL_THRESHOLD", default_value_t = 60)]
    stall_threshold: u64,

    /// Failures before a changeset leaves the queue for good
    #[arg(long, env = "MAX_FAILURES", default_value_t = 60)]
    max_failures: i32,

    /// Stall resets before a changeset is errored
    #[arg(long, env = "MAX_RESETS", default_value_t = 60)]
    max_resets: i32,

    /// Deadline in seconds for every code-host call
    #[arg(long, env = "CODEHOST_TIMEOUT", default_value_t = 30)]
    codehost_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("armada=info")),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!("Connecting to database...");
    let db = PgPool::connect(&cli.database_url).await?;

    tracing::info!("Running migrations...");
    armada_store::MIGRATOR.run(&db).await?;

    let configs: Vec<ExternalServiceConfig> = {
        let raw = std::fs::read_to_string(&cli.external_services_config).with_context(|| {
            format!(
                "failed to read external services config at {}",
                cli.external_services_config.display()
            )
        })?;
        serde_json::from_str(&raw).context("failed to parse external services config")?
    };
    tracing::info!(hosts = configs.len(), "loaded external service configs");

    let store = Store::new(db);
    let registry = Arc::new(
        SourceRegistry::new(configs).with_timeout(Duration::from_secs(cli.codehost_timeout)),
    );
    let repos = Arc::new(PgRepoStore::new(store.clone()));
    let gitserver = Arc::new(HttpGitserverClient::new(
        reqwest::Client::builder()
            .timeout(Duration::from_secs(cli.codehost_timeout))
            .build()?,
        cli.gitserver_url.clone(),
    ));

    let reconciler_config = ReconcilerConfig {
        worker_count: cli.reconciler_workers,
        heartbeat_interval: Duration::from_secs(cli.heartbeat_interval),
        stall_threshold: Duration::from_secs(cli.stall_threshold),
        max_failures: cli.max_failures,
        max_resets: cli.max_resets,
        ..Default::default()
    };
    let syncer_config = SyncerConfig {
        worker_count: cli.syncer_workers,
        ..Default::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = tokio::spawn(armada_reconciler::run_reconciler(
        store.clone(),
        registry.clone(),
        gitserver,
        repos.clone(),
        reconciler_config,
        shutdown_rx.clone(),
    ));
    let syncer = tokio::spawn(armada_syncer::run_syncer(
        store,
        registry,
        repos,
        syncer_config,
        shutdown_rx,
    ));

    tracing::info!("armada started; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    let _ = shutdown_tx.send(true);

    // Workers release their rows on shutdown; anything that does not make
    // it is recovered by the stall reset pass on the next start.
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = reconciler.await;
        let _ = syncer.await;
    })
    .await;

    Ok(())
}
