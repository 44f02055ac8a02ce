//! iap-tunnel - Reach VM ports through the IAP relay
//!
//! Opens relay tunnels to a target port and bridges them to local TCP
//! connections or to stdin/stdout.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use iap_connection::{Connection, ConnectionConfig, FlowStats};
use iap_transport_websocket::{IapTarget, WebSocketConfig, WebSocketConnector};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// iap-tunnel - Forward local connections to a VM port through the IAP relay
#[derive(Parser, Debug)]
#[command(name = "iap-tunnel")]
#[command(about = "Forward local connections to a VM port through the IAP relay")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    /// OAuth access token
    #[arg(long, global = true, env = "IAP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Relay host
    #[arg(long, global = true, env = "IAP_PROXY_HOST", default_value = "tunnel.cloudproxy.app")]
    proxy_host: String,

    /// Seconds to wait for the relay to accept the tunnel
    #[arg(long, global = true, default_value = "30")]
    handshake_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Project containing the target
    #[arg(long, global = true, env = "IAP_PROJECT")]
    project: Option<String>,

    /// Zone of the target instance
    #[arg(long, global = true, env = "IAP_ZONE")]
    zone: Option<String>,

    /// Target instance name
    #[arg(long, global = true)]
    instance: Option<String>,

    /// Network interface of the instance
    #[arg(long, global = true, default_value = "nic0")]
    interface: String,

    /// Target port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// VPC network of a host target
    #[arg(long, global = true)]
    network: Option<String>,

    /// Region of a host target
    #[arg(long, global = true)]
    region: Option<String>,

    /// Host (IP or FQDN) inside a destination group
    #[arg(long, global = true)]
    host: Option<String>,

    /// Destination group of a host target
    #[arg(long, global = true)]
    group: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen locally and open one tunnel per accepted connection
    Forward {
        /// Local address to listen on
        #[arg(short, long, default_value = "127.0.0.1:2222")]
        listen: SocketAddr,
    },
    /// Bridge a single tunnel to stdin/stdout (for SSH ProxyCommand)
    Stdio,
}

impl TargetArgs {
    fn to_target(&self) -> Result<IapTarget> {
        let project = self
            .project
            .as_deref()
            .context("--project is required (or set IAP_PROJECT)")?;
        let port = self.port.context("--port is required")?;

        let target = match (&self.instance, &self.host) {
            (Some(instance), None) => {
                let zone = self
                    .zone
                    .as_deref()
                    .context("--zone is required for instance targets")?;
                IapTarget::instance(project, zone, instance, port).with_interface(&self.interface)
            }
            (None, Some(host)) => {
                let region = self
                    .region
                    .as_deref()
                    .context("--region is required for host targets")?;
                let network = self.network.as_deref().unwrap_or_default();
                let target = IapTarget::host(project, region, network, host, port);
                match &self.group {
                    Some(group) => target.with_group(group),
                    None => target,
                }
            }
            (Some(_), Some(_)) => bail!("--instance and --host are mutually exclusive"),
            (None, None) => bail!("Either --instance or --host is required"),
        };

        target.validate().context("Invalid tunnel target")?;
        Ok(target)
    }
}

/// Opens tunnels to one target
struct Tunneler {
    connector: WebSocketConnector,
    target: IapTarget,
    config: ConnectionConfig,
}

impl Tunneler {
    fn new(cli: &Cli) -> Result<Self> {
        let token = cli
            .token
            .as_deref()
            .context("--token is required (or set IAP_TOKEN)")?;

        let ws_config = WebSocketConfig::with_token(token).with_proxy_host(&cli.proxy_host);
        let connector = WebSocketConnector::new(Arc::new(ws_config))
            .context("Invalid relay configuration")?;

        let config = ConnectionConfig::default()
            .with_handshake_timeout(Duration::from_secs(cli.handshake_timeout));
        config.validate().context("Invalid tunnel configuration")?;

        Ok(Self {
            connector,
            target: cli.target.to_target()?,
            config,
        })
    }

    async fn open(&self) -> Result<Connection> {
        let channel = self
            .connector
            .connect(&self.target)
            .await
            .context("Failed to reach relay")?;

        let connection = Connection::connect(channel, self.config.clone())
            .await
            .context("Relay refused tunnel")?;

        info!(
            "[{}] Tunnel open to {}:{} (session {})",
            connection.connection_id(),
            target_name(&self.target),
            self.target.port,
            String::from_utf8_lossy(connection.session_id())
        );
        Ok(connection)
    }
}

fn target_name(target: &IapTarget) -> &str {
    if target.instance.is_empty() {
        &target.host
    } else {
        &target.instance
    }
}

fn log_closed(connection_id: &str, stats: FlowStats) {
    info!(
        "[{}] Tunnel closed: {} bytes sent ({} acked), {} bytes received ({} acked)",
        connection_id, stats.send_unacked, stats.send_acked, stats.recv_unacked, stats.recv_acked
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let tunneler = Tunneler::new(&cli)?;

    match cli.command {
        Commands::Forward { listen } => run_forward(Arc::new(tunneler), listen).await,
        Commands::Stdio => run_stdio(&tunneler).await,
    }
}

async fn run_forward(tunneler: Arc<Tunneler>, listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    info!(
        "Listening on {} for {}:{}",
        listener.local_addr()?,
        target_name(&tunneler.target),
        tunneler.target.port
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                debug!("Accepted connection from {}", peer);
                let tunneler = tunneler.clone();
                tokio::spawn(async move {
                    if let Err(e) = forward_one(&tunneler, socket).await {
                        error!("Tunnel for {} failed: {:#}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

async fn forward_one(tunneler: &Tunneler, mut socket: TcpStream) -> Result<()> {
    let mut tunnel = tunneler.open().await?;

    let copied = tokio::io::copy_bidirectional(&mut socket, &mut tunnel).await;
    if let Err(e) = tunnel.close().await {
        debug!("[{}] Close failed: {}", tunnel.connection_id(), e);
    }
    log_closed(tunnel.connection_id(), tunnel.stats());

    copied.context("Tunnel copy failed")?;
    Ok(())
}

async fn run_stdio(tunneler: &Tunneler) -> Result<()> {
    let tunnel = tunneler.open().await?;
    let connection_id = tunnel.connection_id().to_string();
    let (mut reader, mut writer) = tunnel.into_split();

    let upload = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let copied = tokio::io::copy(&mut stdin, &mut writer).await;
        let closed = writer.close().await;
        copied?;
        closed?;
        anyhow::Ok(())
    });

    let mut stdout = tokio::io::stdout();
    let downloaded = tokio::io::copy(&mut reader, &mut stdout).await;
    stdout.flush().await?;

    // stdin may never reach EOF once the relay is gone
    if upload.is_finished() {
        if let Err(e) = upload.await? {
            warn!("[{}] Upload failed: {:#}", connection_id, e);
        }
    } else {
        upload.abort();
    }

    log_closed(&connection_id, reader.stats());
    downloaded.context("Tunnel read failed")?;
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    // stdout carries tunnel data in stdio mode
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
