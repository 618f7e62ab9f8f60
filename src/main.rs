//! calbridge - Google Calendar sync server
//!
//! Keeps calendars and events cached locally and mirrors todo deadlines
//! into a managed calendar.

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use calbridge::config::{self, Config};
use calbridge::{Engine, api, scheduler};

#[derive(Parser)]
#[command(name = "calbridge")]
#[command(about = "Google Calendar sync server with todo-deadline events")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server and the scheduled sync
    Serve {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a new API token
    Token {
        /// Name/label for the token
        #[arg(short, long)]
        name: Option<String>,

        /// User the token authenticates as
        #[arg(short, long)]
        user: Option<i64>,

        /// List all configured tokens
        #[arg(long)]
        list: bool,

        /// Revoke a token by name
        #[arg(long)]
        revoke: Option<String>,

        /// Config file path (for list/revoke operations)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Initialize a new config file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run one sync for a user and print the report
    Sync {
        /// User to sync
        #[arg(short, long)]
        user: i64,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("calbridge=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let mut cfg = load_config(config)?;

            // Override with CLI args
            if let Some(p) = port {
                cfg.server.port = p;
            }
            if let Some(b) = bind {
                cfg.server.bind = b;
            }

            run_server(cfg).await
        }

        Commands::Token {
            name,
            user,
            list,
            revoke,
            config,
        } => {
            let config_path = match config {
                Some(path) => path,
                None => Config::default_path()?,
            };

            let action = match (list, revoke, user) {
                (true, _, _) => TokenAction::List,
                (false, Some(name), _) => TokenAction::Revoke(name),
                (false, None, Some(user_id)) => TokenAction::Issue {
                    label: name.unwrap_or_else(|| "default".to_string()),
                    user_id,
                },
                (false, None, None) => {
                    anyhow::bail!("--user <id> is required when issuing a token")
                }
            };
            manage_tokens(&config_path, action)
        }

        Commands::Init { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("config.toml"));
            let cfg = Config::default();
            cfg.save_to(&path)?;

            println!("Created config file: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Fill in [google] client_id/client_secret and [security] token_secret");
            println!("  2. Generate a token: calbridge token --name my-device --user 1");
            println!(
                "  3. Start the server: calbridge serve --config {}",
                path.display()
            );

            Ok(())
        }

        Commands::Sync { user, config } => {
            let cfg = load_config(config)?;
            let engine = Engine::from_config(&cfg)?;
            let report = engine
                .sync_user(user)
                .await
                .with_context(|| format!("Sync failed for user {user}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut cfg = Config::load_from(&path)?;
            cfg.apply_env_overrides();
            Ok(cfg)
        }
        None => Config::load(),
    }
}

async fn run_server(config: Config) -> Result<()> {
    let engine = Arc::new(Engine::from_config(&config)?);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let ticker = scheduler::spawn(engine.clone(), config.sync.interval_secs, shutdown_rx);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let state = api::AppState::new(engine, config);
    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!("calbridge listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "Could not listen for shutdown signal");
            }
        })
        .await?;

    let _ = shutdown_tx.send(());
    if let Some(ticker) = ticker
        && let Err(err) = ticker.await
    {
        tracing::warn!(error = %err, "Scheduler task ended abnormally");
    }
    Ok(())
}

/// What `calbridge token` was asked to do
enum TokenAction {
    List,
    Revoke(String),
    Issue { label: String, user_id: i64 },
}

fn manage_tokens(config_path: &Path, action: TokenAction) -> Result<()> {
    let existing = match config_path.exists() {
        true => Some(Config::load_from(config_path)?),
        false => None,
    };

    match (action, existing) {
        (TokenAction::List | TokenAction::Revoke(_), None) => {
            println!(
                "No config at {}; create one with `calbridge init`.",
                config_path.display()
            );
        }
        (TokenAction::List, Some(cfg)) if cfg.tokens.is_empty() => {
            println!("No API tokens. Issue one with `calbridge token --name <label> --user <id>`.");
        }
        (TokenAction::List, Some(cfg)) => {
            for entry in &cfg.tokens {
                let preview: String = entry.token_hash.chars().take(20).collect();
                println!("{:<20} user {:<6} {preview}...", entry.name, entry.user_id);
            }
        }
        (TokenAction::Revoke(name), Some(mut cfg)) => {
            if cfg.token_named(&name).is_none() {
                println!("No token named '{name}'.");
            } else {
                cfg.tokens.retain(|entry| entry.name != name);
                cfg.save_to(config_path)?;
                println!("Revoked '{name}'.");
            }
        }
        (TokenAction::Issue { label, .. }, Some(cfg)) if cfg.token_named(&label).is_some() => {
            println!("A token named '{label}' exists; revoke it first to replace it.");
        }
        (TokenAction::Issue { label, user_id }, existing) => {
            let token = generate_token();
            let entry = config::TokenConfig {
                name: label,
                user_id,
                token_hash: config::hash_token(&token)?,
            };

            match existing {
                Some(mut cfg) => {
                    println!(
                        "Issued '{}' for user {user_id}; saved to {}.",
                        entry.name,
                        config_path.display()
                    );
                    cfg.tokens.push(entry);
                    cfg.save_to(config_path)?;
                }
                None => {
                    println!("No config at {}; add this entry by hand:\n", config_path.display());
                    println!("[[tokens]]");
                    println!("name = {:?}", entry.name);
                    println!("user_id = {}", entry.user_id);
                    println!("token_hash = {:?}\n", entry.token_hash);
                }
            }
            println!("Authorization: Bearer {token}");
            println!("The token is shown only once.");
        }
    }
    Ok(())
}

/// `cbt_` followed by 43 url-safe characters
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    format!("cbt_{}", URL_SAFE_NO_PAD.encode(bytes))
}
