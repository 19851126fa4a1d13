use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stockchat_common::{APP_NAME, ServiceConfig, logging};
use stockchat_core::{AppContext, handle_question};
use stockchat_db::create_engine;
use stockchat_jobs::{Scheduler, install_jobs};
use stockchat_providers::ProviderRegistry;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "stockchat", about = "Stock-management chatbot service", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate local setup: config, environment, database engine.
    Doctor,
    /// Run one question through the pipeline without starting the server.
    Ask {
        question: String,
        #[arg(long, default_value_t = 0)]
        session: i64,
    },
    /// Run the scheduler and the HTTP API.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Doctor) => doctor(),
        Some(Command::Ask { question, session }) => ask(session, &question),
        Some(Command::Serve { bind }) => serve(bind),
        None => {
            println!("{APP_NAME} CLI.");
            println!("Run `stockchat doctor` to generate and validate local config.");
            Ok(())
        }
    }
}

fn load_initialized_config() -> Result<ServiceConfig> {
    let (mut config, path, created) = ServiceConfig::load_or_create()?;
    config.apply_env_overrides()?;
    config.validate()?;
    logging::init(&config.log_level);
    if created {
        info!("wrote default config to {}", path.display());
    }
    Ok(config)
}

fn doctor() -> Result<()> {
    let config = load_initialized_config()?;
    println!("config: ok");
    println!("provider: {}", config.model.provider);
    println!("model: {}", config.model.model_id);
    println!("database_dsn: {}", config.database_dsn);
    println!("memory_timeout_seconds: {}", config.memory.timeout_seconds);

    let registry = ProviderRegistry::with_defaults();
    match registry.entry(&config.model.provider) {
        Some(entry) => match entry.key_env {
            Some(env_key) => {
                let present = env::var(env_key).map(|v| !v.trim().is_empty()).unwrap_or(false);
                println!(
                    "api_key ({env_key}): {}",
                    if present { "present" } else { "MISSING" }
                );
            }
            None => println!("api_key: not required"),
        },
        None => println!(
            "provider: UNKNOWN (valid: {})",
            registry.names().join(", ")
        ),
    }

    let engine = create_engine(&config.database_dsn)?;
    engine.ping().context("database engine liveness probe")?;
    println!("database: reachable");
    Ok(())
}

fn ask(session_id: i64, question: &str) -> Result<()> {
    let config = load_initialized_config()?;
    let ctx = AppContext::initialize(config)?;
    let outcome = handle_question(&ctx, session_id, question);
    println!("status: {}", outcome.status.as_str());
    println!("response: {}", outcome.response);
    Ok(())
}

fn serve(bind: Option<String>) -> Result<()> {
    let config = load_initialized_config()?;
    let bind_addr = bind.unwrap_or_else(|| config.bind_addr.clone());
    // Agents hold blocking HTTP clients; build everything before entering
    // the async runtime.
    let ctx = Arc::new(AppContext::initialize(config)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let mut scheduler = Scheduler::new();
        install_jobs(&mut scheduler, Arc::clone(&ctx))?;
        scheduler.start()?;

        let served = stockchat_web::serve(&bind_addr, Arc::clone(&ctx)).await;

        scheduler.stop();
        ctx.clear_all_memory();
        info!("shutdown complete");
        served
    })
}
