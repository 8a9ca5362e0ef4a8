use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use tidepool::config::PeerOptions;
use tidepool::connection::{ConnectOptions, ConnectionEvent, DataConnection, Inbound};
use tidepool::peer::{Peer, PeerEvent};
use tidepool::telemetry::logging::{self, LogConfig, LogLevel};
use tidepool::transport::{Endpoints, SignalingApi};

#[derive(Parser, Debug)]
#[command(name = "tidepool")]
#[command(about = "Peer-to-peer data connections brokered by a PeerJS-style signaling server")]
struct Cli {
    /// Signaling server host
    #[arg(long, env = "TIDEPOOL_HOST")]
    host: Option<String>,

    #[arg(long, env = "TIDEPOOL_PORT")]
    port: Option<u16>,

    /// API key registered with the signaling server
    #[arg(long, env = "TIDEPOOL_KEY")]
    key: Option<String>,

    /// Mount path of the signaling server
    #[arg(long, env = "TIDEPOOL_PATH")]
    path: Option<String>,

    /// Use https/wss
    #[arg(long)]
    secure: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a fresh id assigned by the server
    Id,
    /// List peers connected to the server
    Peers,
    /// Register and print whatever connecting peers send
    Listen {
        #[arg(long)]
        id: Option<String>,
    },
    /// Connect to a peer and send each stdin line to it
    Connect {
        peer: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        reliable: bool,
    },
}

impl Cli {
    fn peer_options(&self) -> PeerOptions {
        let mut options = PeerOptions::from_env();
        if let Some(host) = &self.host {
            options.host = host.clone();
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(key) = &self.key {
            options.key = key.clone();
        }
        if let Some(path) = &self.path {
            options.path = path.clone();
        }
        if self.secure {
            options.secure = true;
        }
        options.normalized()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;
    let options = cli.peer_options();
    debug!(
        target = "tidepool::cli",
        host = %options.host,
        port = options.port,
        "options resolved"
    );

    match cli.command {
        Commands::Id => {
            let id = api(&options)?.retrieve_id().await?;
            println!("{id}");
        }
        Commands::Peers => {
            for peer in api(&options)?.list_peers().await? {
                println!("{peer}");
            }
        }
        Commands::Listen { id } => listen(id, options).await?,
        Commands::Connect {
            peer,
            id,
            label,
            reliable,
        } => {
            let connect = ConnectOptions {
                label,
                reliable,
                ..ConnectOptions::default()
            };
            connect_and_chat(id, options, &peer, connect).await?
        }
    }
    Ok(())
}

fn api(options: &PeerOptions) -> Result<SignalingApi> {
    let endpoints = Endpoints::from_options(options).context("invalid signaling endpoint")?;
    Ok(SignalingApi::new(reqwest::Client::new(), endpoints))
}

fn start_peer(id: Option<String>, options: PeerOptions) -> Result<(Arc<Peer>, mpsc::UnboundedReceiver<PeerEvent>)> {
    let peer = Peer::with_rtc(id, options).context("failed to set up webrtc")?;
    let events = peer
        .take_events()
        .ok_or_else(|| anyhow!("peer events already taken"))?;
    Ok((peer, events))
}

async fn listen(id: Option<String>, options: PeerOptions) -> Result<()> {
    let (peer, mut events) = start_peer(id, options)?;
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Open(id) => println!("listening as {id}"),
            PeerEvent::Connection(connection) => {
                println!(
                    "connection {} from {} ({})",
                    connection.id(),
                    connection.peer(),
                    connection.label()
                );
                tokio::spawn(print_connection(connection));
            }
            PeerEvent::Error(err) if err.is_fatal() => {
                peer.destroy().await;
                bail!(err);
            }
            PeerEvent::Error(err) => eprintln!("{err}"),
            PeerEvent::Close => break,
            PeerEvent::Disconnected => info!(target = "tidepool::cli", "disconnected"),
        }
    }
    Ok(())
}

async fn print_connection(connection: Arc<DataConnection>) {
    let Some(mut events) = connection.take_events() else {
        return;
    };
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Open => info!(target = "tidepool::cli", connection_id = %connection.id(), "open"),
            ConnectionEvent::Data(data) => print_inbound(connection.peer(), &data),
            ConnectionEvent::Error(err) => eprintln!("[{}] {err}", connection.peer()),
            ConnectionEvent::Close => {
                println!("connection {} closed", connection.id());
                break;
            }
        }
    }
}

fn print_inbound(from: &str, data: &Inbound) {
    match data {
        Inbound::Json(serde_json::Value::String(text)) => println!("{from}: {text}"),
        Inbound::Json(value) => println!("{from}: {value}"),
        Inbound::Raw(text) => println!("{from}: {text}"),
        Inbound::Binary(bytes) => println!("{from}: <{} bytes>", bytes.len()),
    }
}

async fn connect_and_chat(
    id: Option<String>,
    options: PeerOptions,
    remote: &str,
    connect: ConnectOptions,
) -> Result<()> {
    let (peer, mut peer_events) = start_peer(id, options)?;
    loop {
        match peer_events.recv().await {
            Some(PeerEvent::Open(id)) => {
                println!("registered as {id}");
                break;
            }
            Some(PeerEvent::Error(err)) if err.is_fatal() => bail!(err),
            Some(_) => {}
            None => bail!("peer stopped before opening"),
        }
    }

    let connection = peer.connect(remote, connect).await?;
    let mut events = connection
        .take_events()
        .ok_or_else(|| anyhow!("connection events already taken"))?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut open = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ConnectionEvent::Open) => {
                    open = true;
                    println!("connected to {remote}");
                }
                Some(ConnectionEvent::Data(data)) => print_inbound(remote, &data),
                Some(ConnectionEvent::Error(err)) => eprintln!("{err}"),
                Some(ConnectionEvent::Close) | None => {
                    println!("connection closed");
                    break;
                }
            },
            line = lines.next_line(), if open => match line? {
                Some(line) => {
                    connection.send(line).await?;
                }
                None => {
                    connection.close().await;
                }
            },
            event = peer_events.recv() => match event {
                Some(PeerEvent::Error(err)) if err.is_fatal() => bail!(err),
                Some(PeerEvent::Error(err)) => eprintln!("{err}"),
                Some(_) => {}
                None => break,
            },
        }
    }
    peer.destroy().await;
    Ok(())
}
