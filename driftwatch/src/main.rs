use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use driftwatch::api::{create_router, AppState};
use driftwatch::config::Config;
use driftwatch::db::{Database, DatabaseBackend, LibSqlBackend};
use driftwatch::embeddings::{Embedder, EmbeddingProvider};
use driftwatch::llm::LlmProvider;
use driftwatch::services::{BackfillOptions, ComputeOptions, DivergenceService};

#[derive(Parser)]
#[command(name = "driftwatch")]
#[command(about = "Topic-divergence detection and segmentation for chat archives")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and the background processor (default)
    Serve,
    /// Analyze a single conversation and print its report
    Analyze {
        conversation_id: String,
        /// Skip the LLM relevance judge
        #[arg(long)]
        no_llm: bool,
        /// Print the report without saving it
        #[arg(long)]
        dry_run: bool,
    },
    /// Analyze every conversation that has no report yet
    Backfill {
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        #[arg(long)]
        max: Option<usize>,
        /// Reanalyze conversations that already have a report
        #[arg(long)]
        force: bool,
    },
    /// List conversations scoring at or above a threshold
    High {
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Rank other conversations by segment similarity
    Related {
        conversation_id: String,
        #[arg(long, default_value_t = 0.5)]
        min_similarity: f64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the stored segments of a conversation
    Segments { conversation_id: String },
    /// Print corpus-wide divergence statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env();

    tracing::info!("Initializing database...");
    let raw_db = Database::new(&config.database).await?;
    let db: Arc<dyn DatabaseBackend> = Arc::new(LibSqlBackend::new(raw_db));

    tracing::info!("Loading embedding model: {}...", config.embeddings.model);
    let provider = EmbeddingProvider::new(&config.embeddings)?;
    provider.init().await?;
    let embeddings: Arc<dyn Embedder> = Arc::new(provider.clone());

    if let Some(llm_config) = &config.llm {
        tracing::info!("Initializing LLM provider: {}...", llm_config.model);
    }
    let llm = Arc::new(LlmProvider::new(config.llm.as_ref()));
    if !llm.is_available() {
        tracing::warn!("LLM unavailable - relevance judging and summaries are disabled");
    }

    let result = match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, db, embeddings, llm).await,
        command => {
            let service = DivergenceService::new(&config, db, embeddings, llm);
            run_command(&service, command).await
        }
    };

    provider.shutdown().await;
    result
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "driftwatch=info,tower_http=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn serve(
    config: Config,
    db: Arc<dyn DatabaseBackend>,
    embeddings: Arc<dyn Embedder>,
    llm: Arc<LlmProvider>,
) -> anyhow::Result<()> {
    if config.server.api_keys.is_empty() {
        tracing::warn!(
            "DRIFTWATCH_API_KEYS is not set - protected routes are locked. Set it to enable access."
        );
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let poll_interval = config.processing.poll_interval_secs;
    let batch_size = config.processing.batch_size;

    let state = AppState::new(config, db, embeddings, llm);
    let divergence = state.divergence.clone();

    let requeued = divergence.check_embedding_model().await?;
    if requeued > 0 {
        tracing::info!(requeued, "Queued conversations for recompute with the current model");
    }

    tracing::info!(poll_interval, batch_size, "Starting background processing...");
    divergence
        .start_background_processing(poll_interval, batch_size)
        .await?;

    let cancel_token = CancellationToken::new();
    let app = create_router(state);

    tracing::info!("Driftwatch starting on http://{}", addr);
    tracing::info!("  Health check: http://{}/api/v1/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token.clone()))
        .await?;

    tracing::info!("Stopping background processing...");
    divergence.stop_background_processing().await;

    Ok(())
}

async fn run_command(service: &DivergenceService, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve => anyhow::bail!("serve is handled before the service is built"),
        Command::Analyze {
            conversation_id,
            no_llm,
            dry_run,
        } => {
            let options = ComputeOptions {
                use_llm: !no_llm,
                persist: !dry_run,
                ..ComputeOptions::default()
            };
            let report = service.compute(&conversation_id, &options).await?;
            print_json(&report)?;
        }
        Command::Backfill {
            batch_size,
            max,
            force,
        } => {
            service.check_embedding_model().await?;
            let stats = service
                .backfill_all(&BackfillOptions {
                    batch_size,
                    max_conversations: max,
                    skip_existing: true,
                    force,
                })
                .await?;
            print_json(&stats)?;
        }
        Command::High { threshold, limit } => {
            print_json(&service.list_high_divergence(threshold, limit).await?)?;
        }
        Command::Related {
            conversation_id,
            min_similarity,
            limit,
        } => {
            let related = service
                .related_conversations(&conversation_id, min_similarity, limit)
                .await?;
            print_json(&related)?;
        }
        Command::Segments { conversation_id } => {
            print_json(&service.segments_for(&conversation_id).await?)?;
        }
        Command::Stats => {
            print_json(&service.stats().await?)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping...");
    cancel_token.cancel();
}
