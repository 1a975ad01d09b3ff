use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use globecast_core::{
    load_globecast_config, Channel, ChannelDirectory, GlobecastConfig, MemoryPreferenceStore,
    PreferenceStore, ProxyServer, SqlitePreferenceStore, StaticChannelDirectory,
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod watch;

pub use watch::{SnapshotLine, WatchArgs};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] globecast_core::ConfigError),
    #[error("directory error: {0}")]
    Directory(#[from] globecast_core::DirectoryError),
    #[error("proxy error: {0}")]
    Proxy(#[from] globecast_core::ProxyError),
    #[error("ingest error: {0}")]
    Ingest(#[from] globecast_core::IngestError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("playback failed: {0}")]
    Playback(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Globecast stream proxy and player control", long_about = None)]
pub struct Cli {
    /// Path to the main globecast.toml
    #[arg(long, default_value = "configs/globecast.toml")]
    pub config: PathBuf,
    /// Alternative channels.toml
    #[arg(long)]
    pub channels: Option<PathBuf>,
    /// Alternative preferences database
    #[arg(long)]
    pub preferences_db: Option<PathBuf>,
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the stream proxy until interrupted
    Serve(ServeArgs),
    /// Plays a channel or URL and prints player state changes
    Watch(WatchArgs),
    /// Lists the channels registered for a country
    Channels(ChannelsArgs),
    /// Validates configuration and referenced files
    Check,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Overrides proxy.bind
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

#[derive(Args, Debug)]
pub struct ChannelsArgs {
    /// Country name (case-insensitive)
    pub country: String,
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_level);
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Serve(args) => context.serve(args)?,
        Commands::Watch(args) => context.watch(args, cli.format)?,
        Commands::Channels(args) => {
            let listing = context.channels(args)?;
            render(&listing, cli.format)?;
        }
        Commands::Check => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

pub(crate) fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

pub(crate) trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: GlobecastConfig,
    config_path: PathBuf,
    channels_path: PathBuf,
    preferences_path: Option<PathBuf>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_globecast_config(&config_path)?;

        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let channels_path = cli.channels.clone().unwrap_or_else(|| {
            let file = config
                .directory
                .channels_file
                .clone()
                .unwrap_or_else(|| PathBuf::from("channels.toml"));
            config.resolve_path(&config_dir, file)
        });
        let preferences_path = cli.preferences_db.clone().or_else(|| {
            config
                .preferences
                .path
                .as_ref()
                .map(|path| config.resolve_path(&config_dir, path))
        });

        Ok(Self {
            config,
            config_path,
            channels_path,
            preferences_path,
        })
    }

    fn serve(&self, args: &ServeArgs) -> Result<()> {
        let mut section = self.config.proxy.clone();
        if let Some(bind) = args.bind {
            section.bind = bind;
        }
        runtime()?.block_on(async move {
            let server = ProxyServer::bind(&section).await?;
            server
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            Ok::<(), AppError>(())
        })
    }

    fn directory(&self) -> Result<StaticChannelDirectory> {
        Ok(StaticChannelDirectory::from_file(&self.channels_path)?)
    }

    /// Opens the SQLite preference store, falling back to memory when no path
    /// is configured or the database cannot be opened.
    fn preference_store(&self) -> Arc<dyn PreferenceStore> {
        let Some(path) = &self.preferences_path else {
            return Arc::new(MemoryPreferenceStore::default());
        };
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(target: "globecastctl", path = %parent.display(), error = %err, "cannot create preferences directory");
            }
        }
        match SqlitePreferenceStore::open(path) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!(target: "globecastctl", error = %err, "preferences not persisted this session");
                Arc::new(MemoryPreferenceStore::default())
            }
        }
    }

    fn channels(&self, args: &ChannelsArgs) -> Result<ChannelList> {
        let directory = self.directory()?;
        let channels = runtime()?.block_on(directory.lookup(&args.country));
        Ok(ChannelList {
            country: args.country.clone(),
            channels,
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = vec![HealthEntry::ok(
            "globecast.toml",
            format!("{}", self.config_path.display()),
        )];
        results.push(match StaticChannelDirectory::from_file(&self.channels_path) {
            Ok(directory) => HealthEntry::ok(
                "channels.toml",
                format!("{} countries", directory.countries().count()),
            ),
            Err(err) if !self.channels_path.exists() => HealthEntry::error(
                "channels.toml",
                format!("{} missing: {err}", self.channels_path.display()),
            ),
            Err(err) => HealthEntry::error("channels.toml", err.to_string()),
        });
        results.push(self.check_preferences());
        results.push(match &self.config.routing.proxy_base {
            Some(base) => HealthEntry::ok("routing", format!("proxying through {base}")),
            None => HealthEntry::warn("routing", "no proxy_base, all streams fetched directly"),
        });
        results
    }

    fn check_preferences(&self) -> HealthEntry {
        let Some(path) = &self.preferences_path else {
            return HealthEntry::warn("preferences", "no path configured, kept in memory");
        };
        if !path.exists() {
            return HealthEntry::warn(
                "preferences",
                format!("{} not created yet", path.display()),
            );
        }
        match SqlitePreferenceStore::open(path).and_then(|store| store.load()) {
            Ok(prefs) => HealthEntry::ok(
                "preferences",
                format!("volume={:.2} muted={}", prefs.volume, prefs.muted),
            ),
            Err(err) => HealthEntry::error("preferences", err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelList {
    pub country: String,
    pub channels: Vec<Channel>,
}

impl DisplayFallback for ChannelList {
    fn display(&self) -> String {
        if self.channels.is_empty() {
            return format!("no channels for {}", self.country);
        }
        self.channels
            .iter()
            .map(|channel| {
                format!(
                    "{} [{}] {}",
                    channel.name,
                    channel.language.as_deref().unwrap_or("-"),
                    channel.url
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
