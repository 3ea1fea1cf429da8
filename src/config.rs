use anyhow::{Context, Result, ensure};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL of the ledger gateway. Paid datasets are refused without one.
    pub ledger_url: Option<String>,
    pub chunk_size: u64,
    pub concurrency: usize,
    pub max_part_retries: u32,
    pub part_timeout: Duration,
    pub ledger_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            storage_dir: "./data/objects".into(),
            database_url: "sqlite://./data/meta/publisher.db".into(),
            ledger_url: None,
            chunk_size: 8 * 1024 * 1024,
            concurrency: 6,
            max_part_retries: 3,
            part_timeout: Duration::from_secs(60),
            ledger_timeout: Duration::from_secs(120),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable dataset uploads and publishing")]
pub struct Args {
    /// Host to bind to (overrides DATASET_PUBLISHER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DATASET_PUBLISHER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides DATASET_PUBLISHER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DATASET_PUBLISHER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Ledger gateway base URL (overrides DATASET_PUBLISHER_LEDGER_URL)
    #[arg(long)]
    pub ledger_url: Option<String>,

    /// Part size in bytes (overrides DATASET_PUBLISHER_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Parallel part uploads (overrides DATASET_PUBLISHER_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Retries per part before the upload fails (overrides DATASET_PUBLISHER_MAX_PART_RETRIES)
    #[arg(long)]
    pub max_part_retries: Option<u32>,

    /// Per-attempt part timeout (overrides DATASET_PUBLISHER_PART_TIMEOUT_SECS)
    #[arg(long)]
    pub part_timeout_secs: Option<u64>,

    /// Ledger confirmation timeout (overrides DATASET_PUBLISHER_LEDGER_TIMEOUT_SECS)
    #[arg(long)]
    pub ledger_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI over environment over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        let defaults = Self::default();

        let cfg = Self {
            host: args
                .host
                .or(env_parse("DATASET_PUBLISHER_HOST")?)
                .unwrap_or(defaults.host),
            port: args
                .port
                .or(env_parse("DATASET_PUBLISHER_PORT")?)
                .unwrap_or(defaults.port),
            storage_dir: args
                .storage_dir
                .or(env_parse("DATASET_PUBLISHER_STORAGE_DIR")?)
                .unwrap_or(defaults.storage_dir),
            database_url: args
                .database_url
                .or(env_parse("DATASET_PUBLISHER_DATABASE_URL")?)
                .unwrap_or(defaults.database_url),
            ledger_url: args
                .ledger_url
                .or(env_parse("DATASET_PUBLISHER_LEDGER_URL")?)
                .filter(|url: &String| !url.trim().is_empty()),
            chunk_size: args
                .chunk_size
                .or(env_parse("DATASET_PUBLISHER_CHUNK_SIZE")?)
                .unwrap_or(defaults.chunk_size),
            concurrency: args
                .concurrency
                .or(env_parse("DATASET_PUBLISHER_CONCURRENCY")?)
                .unwrap_or(defaults.concurrency),
            max_part_retries: args
                .max_part_retries
                .or(env_parse("DATASET_PUBLISHER_MAX_PART_RETRIES")?)
                .unwrap_or(defaults.max_part_retries),
            part_timeout: args
                .part_timeout_secs
                .or(env_parse("DATASET_PUBLISHER_PART_TIMEOUT_SECS")?)
                .map(Duration::from_secs)
                .unwrap_or(defaults.part_timeout),
            ledger_timeout: args
                .ledger_timeout_secs
                .or(env_parse("DATASET_PUBLISHER_LEDGER_TIMEOUT_SECS")?)
                .map(Duration::from_secs)
                .unwrap_or(defaults.ledger_timeout),
        };

        ensure!(cfg.chunk_size > 0, "chunk size must be positive");
        ensure!(cfg.concurrency >= 1, "concurrency must be at least 1");
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
