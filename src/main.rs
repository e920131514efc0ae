mod app;
mod doctor;
mod workers;

use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keel_core::config::AppConfig;
use keel_core::state::SharedState;
use keel_core::types::ThreadId;
use keel_gateway::{health_snapshot, GatewayServer};

use crate::app::App;

#[derive(Parser)]
#[command(name = "keel", version, about = "Voyage and bunker planning orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "keel.toml", env = "KEEL_CONFIG")]
    config: PathBuf,

    /// Conversation thread (auto-generated if not provided)
    #[arg(short, long)]
    thread: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Classify a query and print the validated plan without running it
    Plan {
        #[arg(trailing_var_arg = true, required = true)]
        query: Vec<String>,
    },
    /// Plan and execute a query on a thread
    Run {
        #[arg(trailing_var_arg = true, required = true)]
        query: Vec<String>,
    },
    /// List a thread's checkpoints
    Checkpoints { thread: String },
    /// Restore a thread's state from a checkpoint id or step number
    Recover { thread: String, checkpoint: String },
    /// Delete every checkpoint of a thread
    Purge { thread: String },
    /// Print breaker states and checkpoint store health
    Health,
    /// Serve the health endpoint
    Serve,
    /// Run configuration and environment checks
    Doctor,
    /// Show resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KEEL_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("keel=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Doctor => {
            println!("Keel Doctor");
            println!("===========");
            doctor::run_doctor(&config).await;
            return Ok(());
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        _ => {}
    }

    let app = App::build(config)?;
    let thread = cli
        .thread
        .as_deref()
        .map(ThreadId::parse)
        .transpose()?
        .unwrap_or_default();

    match cli.command {
        Commands::Plan { query } => {
            let query = query.join(" ");
            let mut state = match app.engine.checkpointer() {
                Some(cp) => cp
                    .recover_latest(&thread)
                    .await?
                    .map(|ctx| ctx.state)
                    .unwrap_or_default(),
                None => SharedState::new(),
            };
            state.set_str("query", query.clone());
            let plan = app.engine.plan(&query, &state).await?;
            println!("{}", serde_json::to_string_pretty(plan.plan())?);
        }
        Commands::Run { query } => {
            let query = query.join(" ");
            let logger = app.start_logger();
            let report = app.engine.handle(&query, &thread).await;
            if let Some(logger) = logger {
                let stats = logger.stop().await;
                info!(written = stats.written, dropped = stats.dropped, "Run log flushed");
            }
            let report = report?;
            let out = json!({
                "thread_id": report.thread_id,
                "classification": report.classification,
                "result": report.result,
                "final_response": report.state.get("final_response"),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            if !report.result.success {
                std::process::exit(2);
            }
        }
        Commands::Checkpoints { thread } => {
            let infos = app
                .checkpointer
                .list_checkpoints(&ThreadId::parse(&thread)?)
                .await?;
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        Commands::Recover { thread, checkpoint } => {
            let ctx = app
                .checkpointer
                .recover_from_checkpoint(&ThreadId::parse(&thread)?, &checkpoint)
                .await?;
            let out = json!({
                "checkpoint_id": ctx.checkpoint_id,
                "step": ctx.step,
                "missing_fields": ctx.missing_fields,
                "state": ctx.state,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Purge { thread } => {
            let deleted = app
                .checkpointer
                .delete_thread(&ThreadId::parse(&thread)?)
                .await?;
            println!("Deleted {} keys", deleted);
        }
        Commands::Health => {
            let snap = health_snapshot(&app.breakers, app.store.as_ref()).await;
            println!("{}", serde_json::to_string_pretty(&snap)?);
        }
        Commands::Serve => {
            let gateway = app.config.gateway.clone().unwrap_or_default();
            let server = GatewayServer::new(gateway, app.breakers.clone(), app.store.clone());
            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down");
                shutdown.cancel();
            });
            server.run(cancel).await?;
        }
        Commands::Doctor | Commands::Config => unreachable!(),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = home_dir().map(|h| h.join(".keel").join("config.toml"));
    match home_config {
        Some(p) if p.exists() => {
            info!(path = %p.display(), "Loading config from home directory");
            Ok(AppConfig::load(&p)?)
        }
        _ => {
            eprintln!("Warning: no config file found, using built-in defaults");
            Ok(AppConfig {
                workspace: "~/.keel".to_string(),
                ..AppConfig::default()
            })
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
