//! Botster Mux CLI - streams over a single WebSocket.
//!
//! `listen` runs an echo server: every stream a client opens is written back
//! to it. `connect` opens one stream, pipes stdin into it and prints what
//! comes back.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use botster_mux::transport::ws::http_to_ws_scheme;
use botster_mux::{MuxConfig, MuxStream, Session, StreamError, WsTransport};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Stdin read size; one read becomes one data frame.
const STDIN_CHUNK: usize = 8 * 1024;

#[derive(Parser)]
#[command(name = "botster-mux")]
#[command(version)]
#[command(about = "Multiplexed byte-streams over one WebSocket connection")]
struct Cli {
    /// Path to a JSON config file (defaults plus environment otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept WebSocket connections and echo every stream back
    Listen {
        /// Address to bind, e.g. 127.0.0.1:7400
        addr: String,
    },
    /// Open a stream, send stdin through it and print the reply
    Connect {
        /// Server URL (ws://, wss://, http:// or https://)
        url: String,
        /// Init data for the stream (JSON)
        #[arg(long)]
        init: Option<String>,
        /// Extra handshake header as KEY=VALUE (repeatable)
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MuxConfig::load(path)?,
        None => MuxConfig::from_env(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    match cli.command {
        Commands::Listen { addr } => runtime.block_on(listen(&addr, config)),
        Commands::Connect { url, init, headers } => {
            runtime.block_on(connect(&url, init.as_deref(), &headers, config))
        }
    }
}

async fn listen(addr: &str, config: MuxConfig) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    log::info!("[Mux] Listening on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = listener.accept().await.context("accept failed")?;
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(socket, config).await {
                log::warn!("[Mux] Connection from {peer} failed: {e:#}");
            }
        });
    }
}

async fn serve_connection(socket: TcpStream, config: MuxConfig) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(socket)
        .await
        .context("WebSocket handshake failed")?;
    let session = Session::with_config(WsTransport::from_stream(ws), config);

    while let Some(incoming) = session.accept().await {
        let init = incoming
            .init_data
            .as_ref()
            .map_or_else(|| "none".to_string(), Value::to_string);
        log::info!("[Mux] Stream {} opened, init data: {}", incoming.stream.id(), init);

        let stream = incoming.stream;
        tokio::spawn(async move {
            if let Err(e) = echo(&stream).await {
                log::debug!("[Mux] Stream {} ended with error: {e}", stream.id());
            }
        });
    }
    log::info!("[Mux] Connection closed");
    Ok(())
}

async fn echo(stream: &MuxStream) -> Result<(), StreamError> {
    while let Some(chunk) = stream.read().await? {
        stream.write(chunk).await?;
    }
    stream.finish().await
}

async fn connect(
    url: &str,
    init: Option<&str>,
    headers: &[(String, String)],
    config: MuxConfig,
) -> Result<()> {
    let init = init
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--init must be valid JSON")?;
    let headers: Vec<(&str, &str)> = headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();

    let transport = WsTransport::connect(&http_to_ws_scheme(url), &headers).await?;
    let session = Session::with_config(Arc::<WsTransport>::clone(&transport), config);
    let stream = session.create_stream(init);
    log::info!("[Mux] Opened stream {}", stream.id());

    let writer = {
        let stream = stream.clone();
        tokio::spawn(async move { pump_stdin(&stream).await })
    };

    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = stream.read().await? {
        stdout.write_all(&chunk).await?;
        stdout.flush().await?;
    }

    // The peer may end first while stdin is still open
    if writer.is_finished() {
        writer.await.context("stdin task failed")??;
    } else {
        writer.abort();
    }
    transport.close();
    Ok(())
}

async fn pump_stdin(stream: &MuxStream) -> Result<(), StreamError> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::warn!("[Mux] stdin read failed: {e}");
                break;
            }
        };
        stream.write(&buf[..n]).await?;
    }
    stream.finish().await
}
