use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use qr_agent::ResearchAgent;
use qr_core::{CachedResource, ResourceCache, SearchProvider};
use qr_providers::ModelRegistry;
use qr_tools::{ResourceFetcher, TavilySearch};

mod chat;
mod config;
mod server;
mod setup;

use config::Config;

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: request and response bodies
    Trace,
    /// Verbose: model requests, node transitions, fetches
    Debug,
    /// Standard: turns, searches, server requests
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "qr")]
#[command(author, version, about = "Quick-research: a conversational research assistant", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ~/.config/qr/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to info for serve, warn otherwise
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Write logs to file (JSON-lines format)
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to listen on (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Start an interactive research session
    Chat {
        /// Model identifier (overrides default_model)
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Run a single web search and print the results
    Search {
        query: String,
    },
    /// Download a page and print its readable text
    Fetch {
        url: String,
    },
    /// Show current configuration
    Config,
    /// Initialize configuration files in ~/.config/qr
    Setup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => LogLevel::Info,
        _ => LogLevel::Warn,
    };
    // --debug overrides --log-level
    let log_level = if cli.debug {
        LogLevel::Debug
    } else {
        cli.log_level.unwrap_or(default_level)
    };

    init_logging(log_level, cli.log_file.as_ref())?;

    // Handle setup before config is required
    if matches!(cli.command, Commands::Setup) {
        return setup::run();
    }

    let config = Config::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Serve { bind } => {
            let agent = build_agent(&config)?;
            let bind = bind.as_deref().unwrap_or(&config.server.bind);
            server::serve(agent, bind, &config.server.allowed_origins).await
        }
        Commands::Chat { model } => {
            let agent = build_agent(&config)?;
            chat::run_chat(agent, model.clone()).await
        }
        Commands::Search { query } => search_once(&config, query).await,
        Commands::Fetch { url } => fetch_once(&config, url).await,
        Commands::Config => show_config(&config),
        Commands::Setup => unreachable!(),
    }
}

fn init_logging(level: LogLevel, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    if let Some(log_path) = log_file {
        // Log file specified: write JSON to file
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

fn build_agent(config: &Config) -> Result<Arc<ResearchAgent>> {
    let models = ModelRegistry::from_settings(config.default_model.clone(), config.model_settings());
    if !models.contains(&config.default_model) {
        anyhow::bail!(
            "default_model '{}' is not defined under [models] (available: {})",
            config.default_model,
            models.names().join(", ")
        );
    }

    let fetcher = ResourceFetcher::new(Arc::new(ResourceCache::new()), config.fetch_config());
    let search = TavilySearch::new(config.tavily_config());

    Ok(Arc::new(ResearchAgent::new(
        Arc::new(models),
        Arc::new(search),
        Arc::new(fetcher),
        config.agent_config(),
    )))
}

async fn search_once(config: &Config, query: &str) -> Result<()> {
    let search = TavilySearch::new(config.tavily_config());
    let results = search
        .search(query)
        .await
        .with_context(|| format!("Search failed for '{}'", query))?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, resource) in results.iter().enumerate() {
        println!("{}. {}", i + 1, resource.title);
        println!("   {}", resource.url);
        if !resource.description.is_empty() {
            println!("   {}", resource.description.replace('\n', " "));
        }
        println!();
    }
    Ok(())
}

async fn fetch_once(config: &Config, url: &str) -> Result<()> {
    let fetcher = ResourceFetcher::new(Arc::new(ResourceCache::new()), config.fetch_config());
    match fetcher.fetch(url).await {
        CachedResource::Fetched(text) => {
            println!("{}", text);
            Ok(())
        }
        CachedResource::Failed(cause) => anyhow::bail!("Failed to fetch {}: {}", url, cause),
    }
}

fn show_config(config: &Config) -> Result<()> {
    println!("Configuration:");
    println!("  Default model: {}", config.default_model);

    println!("\nModels:");
    for settings in config.model_settings() {
        let key_status = if settings.resolved_api_key().is_some() {
            "key set"
        } else {
            "no key"
        };
        println!(
            "  {}: {} / {} ({})",
            settings.name,
            settings.backend(),
            settings.model.as_deref().unwrap_or("default"),
            key_status
        );
    }

    let resolved = toml::to_string(&config.redacted()).context("Failed to render configuration")?;
    println!("\nResolved settings:\n\n{}", resolved);

    Ok(())
}
