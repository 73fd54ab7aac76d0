use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use gmr_storage::{PgStore, StoreSet};
use gmr_sync::{
    maybe_build_scheduler, prune_stale_results, AuthConfig, MatchingConfig, ScheduleConfig,
    TriggerAuthenticator, TriggerSource,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "gmr-cli")]
#[command(about = "Grant Match Refresh command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one matching refresh over every eligible organization.
    Refresh {
        /// Score a single organization instead of the whole directory.
        #[arg(long)]
        organization: Option<Uuid>,
    },
    /// Send today's digests to opted-in users.
    Notify,
    /// Delete results not refreshed within the retention window.
    Prune {
        #[arg(long)]
        retention_days: Option<i64>,
    },
    Migrate,
    /// Serve the JSON API.
    Serve,
    /// Serve the batch worker.
    Worker,
    /// Fire the cron endpoints on schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Refresh { organization: None }) {
        Commands::Refresh { organization } => {
            let config = MatchingConfig::from_env();
            let stores = connect(&config).await?;
            let pipeline = Arc::new(config.pipeline(stores)?);
            match organization {
                Some(organization_id) => {
                    let outcome = pipeline
                        .process_organization(organization_id, Utc::now())
                        .await
                        .with_context(|| format!("refreshing organization {organization_id}"))?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
                None => {
                    let orchestrator = config.orchestrator(
                        pipeline,
                        TriggerAuthenticator::new(AuthConfig::from_env()),
                    )?;
                    let summary = orchestrator.run(TriggerSource::Cli).await;
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
            }
        }
        Commands::Notify => {
            let config = MatchingConfig::from_env();
            let stores = connect(&config).await?;
            let summary = config.digest_dispatcher(&stores)?.dispatch(Utc::now()).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Prune { retention_days } => {
            let config = MatchingConfig::from_env();
            let stores = connect(&config).await?;
            let summary = prune_stale_results(
                stores.results.as_ref(),
                retention_days.unwrap_or(config.retention_days),
                Utc::now(),
            )
            .await?;
            println!("pruned {} results older than {}", summary.removed, summary.cutoff);
        }
        Commands::Migrate => {
            let config = MatchingConfig::from_env();
            let store = PgStore::connect(&config.database_url, 2).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => gmr_web::serve_from_env().await?,
        Commands::Worker => gmr_worker::serve_from_env().await?,
        Commands::Schedule => {
            let schedule = ScheduleConfig::from_env();
            let client = MatchingConfig::from_env().http_client()?;
            let Some(mut scheduler) = maybe_build_scheduler(&schedule, client).await? else {
                println!("scheduler disabled; set SCHEDULER_ENABLED=true to run it");
                return Ok(());
            };
            scheduler.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn connect(config: &MatchingConfig) -> Result<StoreSet> {
    let store = PgStore::connect(&config.database_url, 5)
        .await
        .context("connecting to DATABASE_URL")?;
    Ok(StoreSet::shared(Arc::new(store)))
}

/// `RUST_LOG` filters (default `info` for every `gmr_*` crate); `LOG_FORMAT=json` switches formatters.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "gmr_cli=info,gmr_sync=info,gmr_worker=info,gmr_web=info,gmr_storage=info,gmr_scoring=info"
            .into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
