//! alyx CLI - Command line interface for alyx

use alyx_core::types::TriggerType;
use alyx_core::{resolve_config, Alyx, Database};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "alyx")]
#[command(about = "A single-node Backend-as-a-Service built around function execution")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve,

    /// Run database migrations and exit
    Migrate,

    /// Manage functions
    Functions {
        #[command(subcommand)]
        what: FunctionCommands,
    },

    /// SDK generation
    Sdk {
        #[command(subcommand)]
        what: SdkCommands,
    },
}

#[derive(Subcommand)]
enum FunctionCommands {
    /// List functions in the registry
    List,

    /// Invoke a function and print its response
    Invoke {
        /// Function name
        name: String,

        /// JSON input (reads stdin when omitted and stdin is piped)
        #[arg(short, long)]
        input: Option<String>,
    },
}

#[derive(Subcommand)]
enum SdkCommands {
    /// Generate a client SDK from the current schema
    Generate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => cmd_serve(cli.config.as_deref()).await,
        Commands::Migrate => cmd_migrate(cli.config.as_deref()).await,
        Commands::Functions { what } => match what {
            FunctionCommands::List => cmd_functions_list(cli.config.as_deref()).await,
            FunctionCommands::Invoke { name, input } => {
                cmd_functions_invoke(cli.config.as_deref(), &name, input.as_deref()).await
            }
        },
        Commands::Sdk { what } => match what {
            SdkCommands::Generate => cmd_sdk_generate(),
        },
    }
}

async fn cmd_serve(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let alyx = Alyx::from_config(config).await?;
    alyx_api::serve(alyx).await?;
    Ok(())
}

async fn cmd_migrate(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let db = Database::connect(&config.database.path).await?;
    db.migrate().await?;
    db.close().await;
    println!("Migrations applied to {}", config.database.path.display());
    Ok(())
}

async fn cmd_functions_list(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let alyx = Alyx::from_config(config).await?;

    let functions = alyx.registry().list().await;
    if functions.is_empty() {
        println!("No functions found.");
    } else {
        for function in functions {
            let triggers: Vec<String> = function
                .routes
                .iter()
                .map(|r| format!("http:{}", r.path))
                .chain(function.schedules.iter().map(|s| format!("schedule:{}", s.name)))
                .chain(
                    function
                        .hooks
                        .iter()
                        .map(|h| format!("hook:{:?}", h.kind).to_lowercase()),
                )
                .collect();
            println!(
                "{:<24} {:<8} timeout={}s {}",
                function.name,
                function.runtime.as_str(),
                function.timeout_sec,
                triggers.join(" ")
            );
        }
    }
    alyx.shutdown().await;
    Ok(())
}

async fn cmd_functions_invoke(
    config_path: Option<&std::path::Path>,
    name: &str,
    input: Option<&str>,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let alyx = Alyx::from_config(config).await?;

    let raw = match input {
        Some(input) => input.to_string(),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            if buf.trim().is_empty() {
                "null".to_string()
            } else {
                buf
            }
        }
    };
    let input: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("input is not valid JSON: {}", e))?;

    let result = alyx
        .service()
        .invoke(name, input, None, TriggerType::Http, None)
        .await;
    alyx.shutdown().await;

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_sdk_generate() -> Result<()> {
    // The generator ships separately; the subcommand exists so tooling has
    // a stable entry point.
    eprintln!("SDK generation is not bundled with this build.");
    std::process::exit(2);
}
