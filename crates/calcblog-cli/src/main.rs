use anyhow::{Context, Result};
use calcblog_discovery::{discover_sources, sync_catalog};
use calcblog_storage::PgContentStore;
use calcblog_sync::{build_pipeline, build_scheduler, GenerationOverrides, SyncConfig};
use calcblog_web::AppState;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "calcblog")]
#[command(about = "Blog generation pipeline for the calculator site")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once, ignoring the scheduled hour.
    Sync,
    /// Refresh the source catalog from the registry and sitemap only.
    Discover,
    /// Generate (or regenerate with --force) the blog for one source path.
    Generate {
        source_url: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        tone: Option<String>,
        #[arg(long)]
        audience: Option<String>,
    },
    Migrate,
    /// Serve the API; also starts the hourly scheduler when CALCBLOG_SCHEDULER_ENABLED is set.
    Serve,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = build_pipeline(&config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} outcome={:?} selected={} generated={} failed={}",
                summary.run_id, summary.outcome, summary.selected, summary.generated, summary.failed
            );
        }
        Commands::Discover => {
            let store = PgContentStore::connect(&config.database_url).await?;
            store.migrate().await?;
            let discovered = discover_sources(&config.discovery());
            let summary = sync_catalog(&store, &discovered).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Generate {
            source_url,
            force,
            tone,
            audience,
        } => {
            let pipeline = build_pipeline(&config).await?;
            let record = pipeline
                .generator()
                .generate_on_demand(&source_url, force, &GenerationOverrides { tone, audience })
                .await?;
            println!("generated {} -> /blog/{}", record.source_url, record.slug);
        }
        Commands::Migrate => {
            let store = PgContentStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = build_pipeline(&config).await?;
            let _scheduler = if config.scheduler_enabled {
                let sched = build_scheduler(pipeline.clone(), &config.scheduler_cron).await?;
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.scheduler_cron, "scheduler started");
                Some(sched)
            } else {
                None
            };
            let state = AppState::new(pipeline, std::env::var("CALCBLOG_CRON_SECRET").ok());
            calcblog_web::serve_from_env(state).await?;
        }
    }

    Ok(())
}
