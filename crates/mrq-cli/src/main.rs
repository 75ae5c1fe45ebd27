use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mrq_client::{HttpReviewBackend, InMemoryBackend, ReviewBackend};
use mrq_controller::{ControllerConfig, QueryChange, ReviewSession};
use mrq_core::{ConfidenceTier, RecordStatus, SortKey};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mrq")]
#[command(about = "Match review queue controller")]
struct Cli {
    /// YAML controller config; MRQ_* variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API.
    Serve {
        #[arg(long, env = "MRQ_WEB_PORT", default_value_t = 8000)]
        port: u16,
        /// Serve an in-memory backend seeded from this file instead of MRQ_BACKEND_URL.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Open a session over a fixture and print its events as JSON lines.
    Watch {
        #[arg(long)]
        fixture: PathBuf,
        #[arg(long, default_value_t = 5)]
        ticks: u32,
    },
    /// Print one page of the queue.
    Queue {
        #[arg(long)]
        fixture: PathBuf,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        status: Option<RecordStatus>,
        #[arg(long)]
        tier: Option<ConfidenceTier>,
        #[arg(long)]
        sort: Option<SortKey>,
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mrq=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, fixture } => {
            let backend: Arc<dyn ReviewBackend> = match fixture {
                Some(path) => Arc::new(InMemoryBackend::from_fixture_file(&path)?),
                None => {
                    info!(url = %config.backend_url, "using http backend");
                    Arc::new(HttpReviewBackend::new(config.http_backend_config())?)
                }
            };
            mrq_web::serve(mrq_web::AppState::new(backend, config), port).await?;
        }
        Commands::Watch { fixture, ticks } => watch(&fixture, ticks, config).await?,
        Commands::Queue {
            fixture,
            search,
            status,
            tier,
            sort,
            page,
        } => {
            let change = QueryChange {
                search,
                status: status.map(Some),
                confidence_tier: tier.map(Some),
                sort,
                ..Default::default()
            };
            queue(&fixture, change, page, config).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ControllerConfig> {
    match path {
        Some(path) => Ok(ControllerConfig::from_yaml_file(path)?
            .with_env_overrides(|key| std::env::var(key).ok())),
        None => Ok(ControllerConfig::from_env()),
    }
}

async fn open_fixture(path: &Path, config: ControllerConfig) -> Result<Arc<ReviewSession>> {
    let backend = Arc::new(InMemoryBackend::from_fixture_file(path)?);
    let session = ReviewSession::new(backend, config);
    session.open().await.context("loading fixture records")?;
    Ok(session)
}

async fn watch(fixture: &Path, ticks: u32, config: ControllerConfig) -> Result<()> {
    let deadline = tokio::time::Instant::now() + config.poll_interval() * ticks;
    let session = open_fixture(fixture, config).await?;
    let mut events = session.subscribe();

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => eprintln!("skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let view = session.view().await;
    println!(
        "{}",
        serde_json::json!({"records": view.page.total_count, "polling": view.polling})
    );
    session.close().await;
    Ok(())
}

async fn queue(fixture: &Path, change: QueryChange, page: usize, config: ControllerConfig) -> Result<()> {
    let session = open_fixture(fixture, config).await?;
    session.update_query(change).await?;
    if page > 1 {
        session.update_query(QueryChange::page(page)).await?;
    }
    let view = session.view().await;

    println!(
        "page {}/{} ({} records)",
        view.page.page,
        view.page.total_pages.max(1),
        view.page.total_count
    );
    for record in &view.page.rows {
        let best = record
            .best_candidate()
            .map(|c| c.product.name.as_str())
            .unwrap_or("-");
        println!(
            "{:<12} {:<10} {:>5.1}  {:<36} {}",
            record.id.as_str(),
            record.status.as_str(),
            record.confidence(),
            record.original_name,
            best
        );
    }
    for (status, count) in &view.page.status_counts {
        println!("  {status}: {count}");
    }
    session.close().await;
    Ok(())
}
