use anyhow::Result;
use clap::{Parser, Subcommand};
use pricewatch_engine::{engine_from_env, EngineConfig};
use pricewatch_storage::PgStore;
use pricewatch_web::AppState;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pricewatch-cli")]
#[command(about = "Competitor price discovery and matching")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the JSON API server.
    Serve,
    /// Run one discovery pass for a competitor.
    Discover {
        #[arg(long)]
        store: Uuid,
        #[arg(long)]
        competitor: Uuid,
    },
    /// Run one gated sync pass for a competitor.
    Sync {
        #[arg(long)]
        store: Uuid,
        #[arg(long)]
        competitor: Uuid,
    },
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pricewatch=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let (store, engine) = engine_from_env(&config).await?;
            pricewatch_web::serve(AppState::new(engine, store)).await?;
        }
        Commands::Discover { store, competitor } => {
            let (_store, engine) = engine_from_env(&config).await?;
            let report = engine.run_discovery(store, competitor).await?;
            println!(
                "discovery: success={} staged={} error={}",
                report.success,
                report.products_scraped,
                report.error.as_deref().unwrap_or("-")
            );
        }
        Commands::Sync { store, competitor } => {
            let (_store, engine) = engine_from_env(&config).await?;
            let report = engine.run_sync(store, competitor).await?;
            println!(
                "sync: ok={} skipped={} matched={} auto_confirmed={} reason={}",
                report.ok,
                report.skipped,
                report.matched,
                report.auto_confirmed,
                report.reason.as_deref().unwrap_or("-")
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            pricewatch_storage::MIGRATOR.run(store.pool()).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
