// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tapedeck::config::{self, Config};
use tapedeck::download::{DownloadManager, JobStore, MemoryJobStore, PersistentJobStore};
use tapedeck::security::TokenResolver;
use tapedeck::server::Server;
use tapedeck::transfer::HttpTransferWorker;
use tapedeck::utils::mask_sensitive;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "tapedeck")]
#[command(version = VERSION)]
#[command(about = "Offline download manager")]
#[command(long_about = "tapedeck - Offline download manager\n\n\
    Start the API:       tapedeck serve\n\
    Create a config:     tapedeck config init\n\
    Show config:         tapedeck config show\n\n\
    Each bearer token in the config maps to one user; users only ever see their own downloads.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file to use instead of ~/.tapedeck/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server (default)
    ///
    /// Examples:
    ///   tapedeck serve
    ///   tapedeck serve --port 9000 --bind 0.0.0.0
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,
    },

    /// Inspect or create the configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration (tokens masked)
    Show,

    /// Print the config file location
    Path,

    /// Write a config file with default values
    ///
    /// Example:
    ///   tapedeck config init --force
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_path()?,
    };

    match cli.command {
        None => run_server(&config_path, None, None, cli.log_level),
        Some(Commands::Serve { port, bind }) => run_server(&config_path, port, bind, cli.log_level),
        Some(Commands::Config { command }) => handle_config(command, &config_path),
    }
}

fn run_server(config_path: &Path, port: Option<u16>, bind: Option<String>, log_level: Option<String>) -> Result<()> {
    let mut config = config::load_config_from(config_path)?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(bind) = bind {
        config.bind_address = bind;
    }
    if let Some(level) = log_level {
        config.log_level = level;
    }
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level()?)
        .with_target(false)
        .init();

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
    let store: Arc<dyn JobStore> = match config.state_path()? {
        Some(path) => Arc::new(
            PersistentJobStore::open(&path, config.store_limits())
                .with_context(|| format!("Failed to open job state in {}", path.display()))?,
        ),
        None => Arc::new(MemoryJobStore::new(config.store_limits())),
    };
    let worker = Arc::new(HttpTransferWorker::new(config.transfer_settings())?);
    let manager = Arc::new(DownloadManager::new(store, worker, config.manager_config()));
    manager.resume_queued()?;

    println!();
    println!("{}", format!("=== tapedeck v{} ===", VERSION).bright_cyan().bold());
    println!("  Listening:  http://{}:{}", config.bind_address, config.port);
    println!("  Media from: {}", config.media_base_url);
    match config.state_path()? {
        Some(path) => println!("  Jobs dir:   {}", path.display()),
        None => println!("  Jobs dir:   {}", "(memory only)".dimmed()),
    }
    if config.grants.is_empty() {
        println!(
            "{} No grants configured; every /v1 request will be rejected. Add grants to the config file.",
            "[!]".yellow()
        );
    } else {
        println!("  Grants:     {}", config.grants.len());
    }
    println!();

    let resolver = Arc::new(TokenResolver::new(config.grants.clone()));
    Server::new(config.port, manager, resolver)
        .with_bind_address(config.bind_address.clone())
        .with_limits(config.server_limits())
        .start()
        .await
}

fn handle_config(command: Option<ConfigCommands>, config_path: &Path) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = config::load_config_from(config_path)?;
            print_config(&config, config_path)?;
        }
        Some(ConfigCommands::Path) => {
            println!("{}", config_path.display());
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!(
                    "{} Config already exists at {} (use --force to overwrite)",
                    "[!]".yellow(),
                    config_path.display()
                );
                return Ok(());
            }
            config::save_config_to(&Config::default(), config_path)?;
            println!("{} Wrote default config to {}", "[✓]".green(), config_path.display());
            println!();
        }
    }
    Ok(())
}

fn print_config(config: &Config, config_path: &Path) -> Result<()> {
    println!();
    println!("{}", "=== tapedeck Configuration ===".bright_cyan().bold());
    println!();
    println!("  Port:               {}", config.port);
    println!("  Bind address:       {}", config.bind_address);
    println!("  Media base URL:     {}", config.media_base_url);
    println!("  Cache dir:          {}", config.transfer_settings().cache_dir.display());
    match config.state_path()? {
        Some(path) => println!("  Jobs dir:           {}", path.display()),
        None => println!("  Jobs dir:           {}", "(memory only)".dimmed()),
    }
    println!("  Max jobs per user:  {}", config.max_jobs_per_owner);
    println!("  Report buffer:      {}", config.report_buffer);
    println!(
        "  Rate limit:         {}/s, burst {}",
        config.rate_limit_per_second, config.rate_limit_burst
    );
    println!("  Request timeout:    {}s", config.request_timeout_secs);
    println!("  Log level:          {}", config.log_level);
    println!();

    if config.grants.is_empty() {
        println!("  Grants:             {}", "(none)".dimmed());
    } else {
        println!("  Grants:");
        for grant in &config.grants {
            println!("    {} -> {}", mask_sensitive(&grant.token, 4), grant.owner_id);
        }
    }
    println!();

    if let Err(e) = config.validate() {
        println!("{} {}", "[!]".yellow(), e);
        println!();
    }
    println!("Config file: {}", config_path.display());
    println!();
    Ok(())
}
