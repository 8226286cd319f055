//! tunwarden CLI: the tunnel control service and its client

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tunwarden_logging::{init_logging, LogConfig, LogFormat};
use tunwarden_protocol::prefs::DEFAULT_PREFS_FILE;
use tunwarden_protocol::{codec, Preferences, PrivateKey, TunnelConfig};
use tunwarden_tunnel::server::{REPLY_CONNECTED, REPLY_DISCONNECTED};
use tunwarden_tunnel::{
    parse_status, send_command, CommandRequest, Daemon, DriverKind, ServiceConfig, DEFAULT_ENDPOINT,
};

/// Bringing a tunnel up may wait on several bounded driver and route calls
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// tunwarden: privileged WireGuard tunnel control service
#[derive(Parser)]
#[command(name = "tunwarden")]
#[command(version)]
#[command(about = "Creates, configures and supervises one WireGuard tunnel", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Command channel (socket path or pipe name)
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service
    Serve {
        /// Service configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Simulate the driver and network stack instead of touching the host
        #[arg(long)]
        dry_run: bool,
    },

    /// Ask the service to bring a tunnel up
    Connect {
        /// Tunnel configuration file ([Interface] / [Peer])
        file: PathBuf,
    },

    /// Ask the service to take the tunnel down
    Disconnect,

    /// Show traffic counters (also keeps the session alive)
    Status {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Validate a tunnel configuration file
    Check {
        /// Tunnel configuration file
        file: PathBuf,
    },

    /// Generate a private key
    Genkey,

    /// Derive the public key from a private key (reads from stdin)
    Pubkey,

    /// Read or edit the preferences file
    Prefs {
        /// Preferences file
        #[arg(short, long, default_value = DEFAULT_PREFS_FILE)]
        file: PathBuf,

        #[command(subcommand)]
        action: PrefsAction,
    },
}

#[derive(Subcommand)]
enum PrefsAction {
    /// Print every field
    Show,
    /// Set one field (Server, Email, PrivateKey, PublicKey, ApplicationID)
    Set {
        /// Field name
        key: String,
        /// New value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::Serve { .. }) {
        init_logging(&client_log_config(cli.verbose)).context("Failed to set up logging")?;
    }
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

    match cli.command {
        Commands::Serve { config, dry_run } => {
            cmd_serve(config.as_deref(), dry_run, cli.endpoint, cli.verbose).await
        }
        Commands::Connect { file } => cmd_connect(&endpoint, &file).await,
        Commands::Disconnect => cmd_disconnect(&endpoint).await,
        Commands::Status { json } => cmd_status(&endpoint, json).await,
        Commands::Check { file } => cmd_check(&file),
        Commands::Genkey => cmd_genkey(),
        Commands::Pubkey => cmd_pubkey(),
        Commands::Prefs { file, action } => cmd_prefs(&file, action),
    }
}

fn client_log_config(verbose: bool) -> LogConfig {
    LogConfig {
        level: if verbose { "debug" } else { "warn" }.to_string(),
        format: LogFormat::Compact,
        ..LogConfig::default()
    }
}

/// Run the service until Ctrl-C / SIGTERM
async fn cmd_serve(
    config_path: Option<&Path>,
    dry_run: bool,
    endpoint: Option<String>,
    verbose: bool,
) -> Result<()> {
    let mut config = ServiceConfig::load(config_path).context("Failed to load service config")?;
    if dry_run {
        config.driver = DriverKind::Memory;
    }
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }

    let mut log = LogConfig::from_settings(&config.log_level, &config.log_format)
        .context("Invalid [logging] section")?;
    if verbose {
        log.level = "debug".to_string();
    }
    init_logging(&log).context("Failed to set up logging")?;

    if config.driver == DriverKind::Memory {
        tracing::warn!("Dry run: using the in-memory driver and network, the host is not touched");
    }

    let daemon = Daemon::new(config).context("Failed to initialise tunnel driver")?;
    daemon.run().await.context("Service failed")?;
    Ok(())
}

async fn cmd_connect(endpoint: &str, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    // Catch mistakes here with a useful message; the service only says "false"
    TunnelConfig::parse(&text).with_context(|| format!("Invalid tunnel config {}", file.display()))?;

    let reply = send_command(endpoint, &CommandRequest::connect(text), CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("Cannot reach the service at {}", endpoint))?;
    if reply != REPLY_CONNECTED {
        bail!("Service refused to connect (reply: {})", reply);
    }
    println!("Connected");
    Ok(())
}

async fn cmd_disconnect(endpoint: &str) -> Result<()> {
    let reply = send_command(endpoint, &CommandRequest::disconnect(), REQUEST_TIMEOUT)
        .await
        .with_context(|| format!("Cannot reach the service at {}", endpoint))?;
    if reply != REPLY_DISCONNECTED {
        bail!("Service failed to disconnect (reply: {})", reply);
    }
    println!("Disconnected");
    Ok(())
}

async fn cmd_status(endpoint: &str, json: bool) -> Result<()> {
    let reply = send_command(endpoint, &CommandRequest::status(), REQUEST_TIMEOUT)
        .await
        .with_context(|| format!("Cannot reach the service at {}", endpoint))?;
    let status = parse_status(&reply)?;

    if json {
        println!("{}", serde_json::to_string(&status)?);
    } else {
        println!("received: {} bytes", status.rx);
        println!("sent:     {} bytes", status.tx);
    }
    Ok(())
}

/// Human-readable summary of a parsed config
fn summarize(config: &TunnelConfig) -> Result<String> {
    let wire = codec::encode_config(config).context("Config does not encode")?;
    let iface = &config.interface;

    let mut out = String::new();
    writeln!(out, "Interface:")?;
    writeln!(out, "  Public key: {}", iface.private_key.public_key().to_base64())?;
    for addr in &iface.addresses {
        writeln!(out, "  Address: {}", addr)?;
    }
    for dns in &iface.dns {
        writeln!(out, "  DNS: {}", dns)?;
    }
    if let Some(port) = iface.listen_port {
        writeln!(out, "  Listen port: {}", port)?;
    }
    writeln!(out, "  MTU: {}", iface.mtu)?;

    for peer in &config.peers {
        writeln!(out, "Peer {}:", peer.public_key.fingerprint())?;
        if let Some(endpoint) = peer.endpoint {
            writeln!(out, "  Endpoint: {}", endpoint)?;
        }
        let ips: Vec<String> = peer.allowed_ips.iter().map(ToString::to_string).collect();
        writeln!(out, "  Allowed IPs: {}", ips.join(", "))?;
        if peer.persistent_keepalive > 0 {
            writeln!(out, "  Keepalive: {}s", peer.persistent_keepalive)?;
        }
    }
    writeln!(out, "Driver buffer: {} bytes", wire.len())?;
    Ok(out)
}

fn cmd_check(file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let config = TunnelConfig::parse(&text).context("Configuration is invalid")?;

    println!("Configuration is valid");
    println!();
    print!("{}", summarize(&config)?);
    Ok(())
}

fn cmd_genkey() -> Result<()> {
    println!("{}", PrivateKey::generate().to_base64());
    Ok(())
}

fn cmd_pubkey() -> Result<()> {
    use std::io::Read;

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let private = PrivateKey::from_base64(input.trim()).context("Invalid private key")?;
    println!("{}", private.public_key().to_base64());
    Ok(())
}

fn cmd_prefs(file: &Path, action: PrefsAction) -> Result<()> {
    match action {
        PrefsAction::Show => {
            let prefs = Preferences::load(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            print!("{}", prefs);
        }
        PrefsAction::Set { key, value } => {
            Preferences::update_field(file, &key, &value)
                .with_context(|| format!("Failed to update {} in {}", key, file.display()))?;
            tracing::debug!("Updated {} in {}", key, file.display());
        }
    }
    Ok(())
}
