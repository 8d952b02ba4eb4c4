mod handlers;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_agent::{ExecutableGraph, GraphDefinition, Orchestrator};
use conductor_core::config::AppConfig;
use conductor_core::traits::InferenceClient;
use conductor_core::types::{ExecutionEvent, ExecutionId, ExecutionRecord};
use conductor_memory::SqliteStore;

#[derive(Parser)]
#[command(name = "conductor", version, about = "Routing graph orchestrator for specialized agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml", env = "CONDUCTOR_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph definition without running it
    Validate {
        /// Graph definition (.json or .toml)
        graph: PathBuf,
    },
    /// Run a graph to completion and print the execution record
    Run {
        /// Graph definition (.json or .toml)
        graph: PathBuf,
        /// Resume this execution from its latest checkpoint instead of starting fresh
        #[arg(long)]
        resume: Option<String>,
        /// Print execution events as they happen
        #[arg(long, short)]
        watch: bool,
    },
    /// Start the HTTP/WebSocket gateway and the preference refresher
    Serve,
    /// Show or rebuild a founder's routing preferences
    Preferences {
        founder_id: String,
        /// Recompute from recent feedback before printing
        #[arg(long)]
        refresh: bool,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conductor=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "conductor", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { graph } => {
            let registry = handlers::builtin_registry(None);
            let definition = GraphDefinition::load(&graph)?;
            let graph = ExecutableGraph::build(definition)?;
            println!("Graph '{}' is valid ({} nodes)", graph.id(), graph.len());
            println!("Order: {}", graph.order().join(" -> "));
            for capability in graph.capabilities() {
                if !registry.contains(capability) {
                    println!("  note: capability '{}' is not built in", capability);
                }
            }
        }
        Commands::Run {
            graph,
            resume,
            watch,
        } => {
            let orchestrator = Arc::new(build_orchestrator(&config)?);
            let definition = GraphDefinition::load(&graph)?;
            let mut events = orchestrator.subscribe();

            let execution_id = match resume {
                Some(id) => {
                    orchestrator
                        .resume_execution(definition, &ExecutionId::from_string(&id))
                        .await?
                }
                None => orchestrator.submit_graph(definition).await?,
            };
            info!(execution_id = %execution_id, "Execution started");

            let interrupt = cancel_on_ctrl_c(orchestrator.clone(), execution_id.clone());
            if watch {
                let id = execution_id.clone();
                tokio::spawn(async move {
                    while let Ok(event) = events.recv().await {
                        if event.execution_id() != Some(&id) {
                            continue;
                        }
                        print_event(&event);
                        if matches!(event, ExecutionEvent::RunComplete { .. }) {
                            break;
                        }
                    }
                });
            }

            let record = orchestrator.wait(&execution_id).await?;
            interrupt.cancel();
            print_summary(&record);
            println!("{}", serde_json::to_string_pretty(&record)?);
            orchestrator.shutdown();
        }
        Commands::Serve => {
            let orchestrator = Arc::new(build_orchestrator(&config)?);
            let gateway_config = config.gateway.clone().unwrap_or_default();
            info!(bind = %gateway_config.bind, "Starting gateway");

            let shutdown = CancellationToken::new();
            let shutdown_clone = shutdown.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                shutdown_clone.cancel();
            });

            let refresher = orchestrator.preference_refresher()?;
            tokio::spawn(async move { refresher.run().await });

            let server = conductor_gateway::GatewayServer::new(gateway_config, orchestrator.clone());
            server.run(shutdown).await?;
            orchestrator.shutdown();
        }
        Commands::Preferences { founder_id, refresh } => {
            let orchestrator = build_orchestrator(&config)?;
            let preferences = if refresh {
                orchestrator.refresh_preferences(&founder_id).await?
            } else {
                orchestrator.preferences(&founder_id).await?
            };
            if preferences.is_empty() {
                println!("No routing preferences for '{}'", founder_id);
            }
            for p in &preferences {
                println!(
                    "{:<24} {:<6} avg={:.2} n={} conf={:.2}  {}",
                    p.capability,
                    if p.avoid { "avoid" } else { "ok" },
                    p.average_rating,
                    p.samples,
                    p.confidence,
                    p.reason
                );
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    // Check for config in the home directory
    if let Some(home_config) = dirs_home().map(|h| h.join(".conductor").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn build_orchestrator(config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let store = Arc::new(SqliteStore::open(&config.database_path())?);

    let inference: Option<Arc<dyn InferenceClient>> =
        config.inference.as_ref().map(conductor_llm::create_client);
    if inference.is_none() {
        info!("No [inference] section; reflection runs checks only");
    }

    let registry = handlers::builtin_registry(inference.clone());
    let mut builder = Orchestrator::builder(config.clone(), registry).store(store);
    if let Some(client) = inference {
        builder = builder.inference(client);
    }
    Ok(builder.build())
}

/// Cancel the execution on Ctrl-C. The returned token stops the watcher.
fn cancel_on_ctrl_c(orchestrator: Arc<Orchestrator>, execution_id: ExecutionId) -> CancellationToken {
    let done = CancellationToken::new();
    let done_clone = done.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(execution_id = %execution_id, "Interrupted, cancelling execution");
                if let Err(e) = orchestrator.cancel_execution(&execution_id).await {
                    warn!(error = %e, "Cancel failed");
                }
            }
            _ = done_clone.cancelled() => {}
        }
    });
    done
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted { graph_id, .. } => println!("[run] started graph '{}'", graph_id),
        ExecutionEvent::NodeStatusChanged {
            node_id,
            status,
            attempt,
            ..
        } => println!("[node] {} -> {} (attempt {})", node_id, status, attempt),
        ExecutionEvent::NodeRetrying {
            node_id,
            attempt,
            backoff_ms,
            ..
        } => println!("[retry] {} attempt {} failed, retrying in {}ms", node_id, attempt, backoff_ms),
        ExecutionEvent::RunComplete {
            status, elapsed_ms, ..
        } => println!("[run] {:?} in {}ms", status, elapsed_ms),
        other => {
            if let Ok(json) = serde_json::to_string(other) {
                println!("[event] {}", json);
            }
        }
    }
}

fn print_summary(record: &ExecutionRecord) {
    eprintln!(
        "Execution {} finished: {:?}",
        record.execution_id, record.status
    );
    for node in &record.nodes {
        let error = node.error.as_deref().unwrap_or("");
        eprintln!(
            "  {:<20} {:<10} attempts={} {}",
            node.node_id, node.status, node.attempts, error
        );
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
