//! shellcache - command-line front-end for the offline shell cache.
//!
//! Drives the cache worker lifecycle (install, activate, fetch), inspects
//! and edits the local token/cache store, and issues authenticated API
//! requests through the same client the application uses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use shellcache_core::api::{ApiClient, ApiRequest, Method};
use shellcache_core::reporting::{install_panic_hook, tracing_reporter};
use shellcache_core::storage::{LocalStore, DEFAULT_CACHE_TTL_MINUTES};
use shellcache_core::worker::{
    CacheStorage, CacheWorker, Clients, Destination, FetchRequest, HttpNetwork, WorkerResponse, WorkerState,
};
use shellcache_core::Config;

/// Log file name prefix inside the log directory
const LOG_FILE_PREFIX: &str = "shellcache.log";

#[derive(Parser, Debug)]
#[command(name = "shellcache", version, about = "Offline shell cache and admin API client")]
struct Cli {
    /// Write logs to a daily log file under the data directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the application shell into the configured cache generation
    Install {
        /// Activate as soon as the install finishes
        #[arg(long)]
        skip_waiting: bool,
    },
    /// Activate a waiting generation and delete the older ones
    Activate,
    /// Route a request through the worker and print the response
    Fetch {
        /// Absolute URL, or a path relative to the configured origin
        url: String,
        /// Treat as a top-level navigation
        #[arg(long)]
        navigate: bool,
        /// Request destination (script, style, image, font, manifest, ...)
        #[arg(long, default_value = "empty")]
        destination: String,
        /// HTTP method; anything but GET goes straight to the network
        #[arg(long, short = 'X', default_value = "GET")]
        method: String,
    },
    /// List stored cache generations
    Generations,
    /// Manage the stored bearer token
    Token {
        #[command(subcommand)]
        action: TokenCommand,
    },
    /// Manage values with an expiry
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
    /// Print a snapshot of the whole store as JSON
    Backup,
    /// Load a snapshot produced by `backup`
    Restore { file: PathBuf },
    /// Show how much of the store quota is used
    Usage,
    /// Send an API request
    Request {
        method: String,
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
        /// Retries with exponential backoff after a failure
        #[arg(long, default_value_t = 0)]
        retry: u32,
    },
    /// Check API health
    Health,
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    Set { token: String },
    Get,
    Clear,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    Set {
        key: String,
        /// JSON value
        value: String,
        #[arg(long, default_value_t = DEFAULT_CACHE_TTL_MINUTES)]
        ttl_minutes: i64,
    },
    Get { key: String },
    /// Remove every expired entry
    Sweep,
}

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). The returned guard must
/// live until exit so buffered lines are flushed.
fn init_tracing(log_dir: Option<&Path>) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (writer, guard) = match log_dir {
        Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX)),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(log_dir.is_none()))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load()?;

    let log_dir = if cli.log_file { Some(config.log_dir()?) } else { None };
    let _guard = init_tracing(log_dir.as_deref());
    install_panic_hook(tracing_reporter());

    info!(command = ?cli.command, "shellcache starting");
    run(cli.command, &config).await
}

async fn run(command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Install { skip_waiting } => install(config, skip_waiting).await,
        Command::Activate => activate(config),
        Command::Fetch {
            url,
            navigate,
            destination,
            method,
        } => fetch(config, &url, navigate, &destination, &method).await,
        Command::Generations => generations(config),
        Command::Token { action } => token(&open_store(config)?, action),
        Command::Cache { action } => cache(&open_store(config)?, action),
        Command::Backup => {
            println!("{}", open_store(config)?.backup()?);
            Ok(())
        }
        Command::Restore { file } => {
            let snapshot = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let restored = open_store(config)?.restore(&snapshot)?;
            println!("Restored {} keys", restored);
            Ok(())
        }
        Command::Usage => {
            let usage = open_store(config)?.storage_usage();
            println!("{}", serde_json::to_string_pretty(&usage)?);
            Ok(())
        }
        Command::Request {
            method,
            path,
            body,
            retry,
        } => request(config, &method, &path, body.as_deref(), retry).await,
        Command::Health => {
            let health = api_client(config)?.health_check().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
    }
}

// ============================================================================
// Worker commands
// ============================================================================

fn origin(config: &Config) -> Result<Url> {
    Url::parse(&config.origin).with_context(|| format!("Invalid origin: {}", config.origin))
}

fn cache_storage(config: &Config) -> Result<Arc<CacheStorage>> {
    Ok(Arc::new(CacheStorage::new(config.cache_dir()?)?))
}

fn resume_worker(config: &Config) -> Result<CacheWorker> {
    let network = Arc::new(HttpNetwork::new(config.request_timeout())?);
    Ok(CacheWorker::resume(
        &config.cache_generation,
        origin(config)?,
        cache_storage(config)?,
        network,
        Arc::new(Clients::new()),
    )?)
}

async fn install(config: &Config, skip_waiting: bool) -> Result<()> {
    let storage = cache_storage(config)?;
    let network = Arc::new(HttpNetwork::new(config.request_timeout())?);
    let worker = CacheWorker::new(
        &config.cache_generation,
        origin(config)?,
        storage.clone(),
        network,
        Arc::new(Clients::new()),
    );

    if skip_waiting {
        worker.handle_message(&json!({"type": "SKIP_WAITING"}))?;
    }
    worker
        .install()
        .await
        .with_context(|| format!("Install of {} failed", worker.generation()))?;

    // Nothing older to wait for
    if worker.state() == WorkerState::Installed && storage.keys()? == [worker.generation()] {
        worker.activate()?;
    }

    println!("{}: {:?}", worker.generation(), worker.state());
    Ok(())
}

fn activate(config: &Config) -> Result<()> {
    let worker = resume_worker(config)?;
    match worker.state() {
        WorkerState::Parsed => bail!("{} is not installed", worker.generation()),
        WorkerState::Activated => println!("{} is already active", worker.generation()),
        _ => {
            for name in worker.activate()? {
                println!("Deleted {}", name);
            }
            println!("{}: {:?}", worker.generation(), worker.state());
        }
    }
    Ok(())
}

async fn fetch(config: &Config, url: &str, navigate: bool, destination: &str, method: &str) -> Result<()> {
    let worker = resume_worker(config)?;
    let url = match Url::parse(url) {
        Ok(url) => url,
        Err(_) => worker
            .origin()
            .join(url)
            .with_context(|| format!("Invalid URL: {}", url))?,
    };

    let request = if navigate {
        FetchRequest::navigate(url)
    } else {
        FetchRequest::subresource(url, Destination::parse(destination))
    }
    .with_method(method);

    match worker.handle_fetch(&request).await? {
        Some(response) => print_response(&response),
        None => println!("Not intercepted ({:?})", worker.state()),
    }
    Ok(())
}

fn print_response(response: &WorkerResponse) {
    println!("{}", response.status);
    for (name, value) in &response.headers {
        println!("{}: {}", name, value);
    }
    if !response.body.is_empty() {
        println!();
        println!("{}", String::from_utf8_lossy(&response.body));
    }
}

fn generations(config: &Config) -> Result<()> {
    for name in cache_storage(config)?.keys()? {
        let marker = if name == config.cache_generation { "*" } else { " " };
        println!("{} {}", marker, name);
    }
    Ok(())
}

// ============================================================================
// Store commands
// ============================================================================

fn open_store(config: &Config) -> Result<LocalStore> {
    let path = config.storage_path()?;
    LocalStore::open(&path).with_context(|| format!("Failed to open store at {}", path.display()))
}

fn token(store: &LocalStore, action: TokenCommand) -> Result<()> {
    match action {
        TokenCommand::Set { token } => store.set_token(&token)?,
        TokenCommand::Get => match store.get_token() {
            Some(token) => println!("{}", token),
            None => bail!("No token stored"),
        },
        TokenCommand::Clear => store.remove_token()?,
    }
    Ok(())
}

fn cache(store: &LocalStore, action: CacheCommand) -> Result<()> {
    match action {
        CacheCommand::Set {
            key,
            value,
            ttl_minutes,
        } => {
            let value: Value = serde_json::from_str(&value).context("Cache value must be JSON")?;
            store.set_cache_item(&key, &value, chrono::Duration::minutes(ttl_minutes))?;
        }
        CacheCommand::Get { key } => match store.get_cache_item::<Value>(&key) {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => bail!("No live cache entry for {}", key),
        },
        CacheCommand::Sweep => println!("Removed {} expired entries", store.clean_expired_cache()?),
    }
    Ok(())
}

// ============================================================================
// API commands
// ============================================================================

fn api_client(config: &Config) -> Result<ApiClient> {
    let client = ApiClient::new(&config.api_base_url, config.request_timeout(), open_store(config)?)?
        .with_health_timeout(config.health_timeout());
    Ok(client)
}

async fn request(config: &Config, method: &str, path: &str, body: Option<&str>, retries: u32) -> Result<()> {
    let method: Method = method
        .to_ascii_uppercase()
        .parse()
        .with_context(|| format!("Invalid method: {}", method))?;

    let mut request = ApiRequest::new(method, path);
    if let Some(body) = body {
        request = request.with_body(serde_json::from_str(body).context("Request body must be JSON")?);
    }

    let client = api_client(config)?;
    let response = if retries > 0 {
        client.retry_request(request, retries + 1).await?
    } else {
        client.send(request).await?
    };

    info!(status = response.status, duration_ms = response.duration.as_millis() as u64, "Request finished");
    println!("{}", serde_json::to_string_pretty(&response.data)?);
    Ok(())
}
