//! ncproxy - SSH front end for a NETCONF server
//!
//! Terminates SSH, checks passwords against a user table and bridges every
//! `netconf` subsystem channel to a backend TCP address.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ncproxy_auth::{hash_password, StaticCredentials};
use ncproxy_server::{
    FileKeyPairProvider, ProxyConfiguration, ProxyServer, RusshTransport, DEFAULT_IDLE_TIMEOUT,
};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_BIND: &str = "0.0.0.0:830";
const DEFAULT_HOST_KEY: &str = "ncproxy_host_ed25519";

/// ncproxy - SSH-terminating NETCONF proxy
#[derive(Parser, Debug)]
#[command(name = "ncproxy")]
#[command(about = "SSH-terminating NETCONF proxy")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept SSH clients and bridge their netconf channels to the backend
    #[command(long_about = r#"
Accept SSH clients, authenticate them with passwords from the config file and
bridge every "netconf" subsystem channel to the backend address.

Flags override values from the config file.

EXAMPLES:
  # Listen on the standard NETCONF-over-SSH port
  ncproxy serve --config ncproxy.yaml --backend 127.0.0.1:2830

  # Short timeouts for a lab setup
  ncproxy serve --config ncproxy.yaml --bind 127.0.0.1:8830 \
    --backend 127.0.0.1:2830 --idle-timeout-secs 60 --auth-timeout-secs 10

ENVIRONMENT VARIABLES:
  NCPROXY_CONFIG             Path to the YAML config file
  NCPROXY_BIND               Address to listen on
  NCPROXY_BACKEND            NETCONF backend address
  NCPROXY_HOST_KEY           Host key path (generated when missing)
  NCPROXY_IDLE_TIMEOUT_SECS  Session idle timeout
  NCPROXY_AUTH_TIMEOUT_SECS  Authentication timeout
  NCPROXY_WORKER_THREADS     Worker threads shared by all connections
    "#)]
    Serve(ServeArgs),

    /// Print an Argon2id hash for the users table
    HashPassword {
        /// Password to hash
        #[arg(long, env = "NCPROXY_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// YAML config file
    #[arg(short, long, env = "NCPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (default: 0.0.0.0:830)
    #[arg(long, env = "NCPROXY_BIND")]
    bind: Option<SocketAddr>,

    /// NETCONF backend address
    #[arg(long, env = "NCPROXY_BACKEND")]
    backend: Option<SocketAddr>,

    /// OpenSSH private host key, generated on first start when missing
    #[arg(long, env = "NCPROXY_HOST_KEY")]
    host_key: Option<PathBuf>,

    /// Session idle timeout in seconds (default: 600)
    #[arg(long, env = "NCPROXY_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Authentication timeout in seconds (default: idle timeout)
    #[arg(long, env = "NCPROXY_AUTH_TIMEOUT_SECS")]
    auth_timeout_secs: Option<u64>,

    /// Backend connect timeout in seconds (default: 10, capped by the idle timeout)
    #[arg(long, env = "NCPROXY_CONNECT_TIMEOUT_SECS")]
    connect_timeout_secs: Option<u64>,

    /// Worker threads (default: one per CPU)
    #[arg(long, env = "NCPROXY_WORKER_THREADS")]
    worker_threads: Option<usize>,
}

/// Contents of the YAML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    bind: Option<SocketAddr>,
    backend: Option<SocketAddr>,
    host_key: Option<PathBuf>,
    idle_timeout_secs: Option<u64>,
    auth_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    worker_threads: Option<usize>,
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserEntry {
    username: String,
    /// Argon2 PHC string, see `ncproxy hash-password`
    password_hash: String,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Effective settings after merging flags over the config file.
#[derive(Debug)]
struct ServeSettings {
    bind: SocketAddr,
    backend: SocketAddr,
    host_key: PathBuf,
    idle_timeout: Duration,
    auth_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    worker_threads: Option<usize>,
    users: Vec<UserEntry>,
}

impl ServeSettings {
    fn resolve(args: ServeArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let bind = match args.bind.or(file.bind) {
            Some(addr) => addr,
            None => DEFAULT_BIND.parse().context("Invalid default bind address")?,
        };
        let backend = args
            .backend
            .or(file.backend)
            .context("No backend address configured (use --backend or `backend:` in the config file)")?;

        Ok(Self {
            bind,
            backend,
            host_key: args
                .host_key
                .or(file.host_key)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOST_KEY)),
            idle_timeout: args
                .idle_timeout_secs
                .or(file.idle_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            auth_timeout: args
                .auth_timeout_secs
                .or(file.auth_timeout_secs)
                .map(Duration::from_secs),
            connect_timeout: args
                .connect_timeout_secs
                .or(file.connect_timeout_secs)
                .map(Duration::from_secs),
            worker_threads: args.worker_threads.or(file.worker_threads),
            users: file.users,
        })
    }

    fn credentials(&self) -> Result<StaticCredentials> {
        let mut credentials = StaticCredentials::new();
        for user in &self.users {
            credentials
                .add_user(&user.username, &user.password_hash)
                .with_context(|| format!("Invalid password hash for user '{}'", user.username))?;
        }
        Ok(credentials)
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

async fn serve(settings: ServeSettings, pool: tokio::runtime::Handle) -> Result<()> {
    let credentials = settings.credentials()?;
    if credentials.is_empty() {
        warn!("No users configured, every login will be rejected");
    }

    let mut builder = ProxyConfiguration::builder()
        .binding_address(settings.bind)
        .backend_address(settings.backend)
        .authenticator(Arc::new(credentials))
        .key_pair_provider(Arc::new(FileKeyPairProvider::new(&settings.host_key)))
        .idle_timeout(settings.idle_timeout);
    if let Some(auth_timeout) = settings.auth_timeout {
        builder = builder.auth_timeout(auth_timeout);
    }
    if let Some(connect_timeout) = settings.connect_timeout {
        builder = builder.connect_timeout(connect_timeout);
    }
    let config = builder.build().context("Invalid proxy configuration")?;

    info!("Backend: {}", config.backend_address);
    info!("Host key: {}", settings.host_key.display());
    info!(
        "Idle timeout: {}s, auth timeout: {}s, backend connect timeout: {}s",
        config.idle_timeout.as_secs(),
        config.auth_timeout.as_secs(),
        config.connect_timeout.as_secs()
    );

    let server = ProxyServer::new(RusshTransport::new(), pool);
    server
        .bind(&config)
        .await
        .context("Failed to start proxy server")?;
    if let Some(addr) = server.local_addr().await {
        info!("ncproxy listening on {}", addr);
    }

    let waited = shutdown_signal().await;
    server.close().await.context("Failed to close proxy server")?;
    waited?;

    info!("ncproxy stopped");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    match cli.command {
        Commands::HashPassword { password } => {
            let hash = hash_password(&password).context("Failed to hash password")?;
            println!("{}", hash);
            Ok(())
        }
        Commands::Serve(args) => {
            let settings = ServeSettings::resolve(args)?;
            info!("ncproxy {} ({}) starting...", env!("GIT_TAG"), env!("GIT_HASH"));

            // The worker pool is owned here and handed to the proxy
            let mut runtime = tokio::runtime::Builder::new_multi_thread();
            runtime.enable_all().thread_name("ncproxy-worker");
            if let Some(threads) = settings.worker_threads {
                runtime.worker_threads(threads);
            }
            let runtime = runtime.build().context("Failed to build worker pool")?;

            let pool = runtime.handle().clone();
            runtime.block_on(serve(settings, pool))
        }
    }
}
