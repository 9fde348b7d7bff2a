use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ef_engine::{EngineConfig, EngineRequest, EngineService};

/// Rejection sent instead of an event stream.
#[derive(Serialize)]
struct Rejection {
    error: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env()?;
    let engine = EngineService::new(config)?;

    let addr = std::env::var("EIGENFLOW_ENGINE_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8081".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "Eigenflow engine service listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let engine = engine.clone();

        tokio::spawn(async move {
            if let Err(e) = serve(engine, socket).await {
                warn!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

/// One request line in, one JSON event per line out.
///
/// A client that disconnects mid-stream drops the channel, which cancels the run.
async fn serve(engine: EngineService, socket: TcpStream) -> anyhow::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let request: EngineRequest = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(e) => return reject(&mut writer, format!("Malformed request: {e}")).await,
    };
    let mut channel = match engine.dispatch(request) {
        Ok(channel) => channel,
        Err(e) => return reject(&mut writer, e.to_string()).await,
    };

    while let Some(event) = channel.recv().await {
        let mut frame = serde_json::to_vec(&event)?;
        frame.push(b'\n');
        writer.write_all(&frame).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

async fn reject(writer: &mut tokio::net::tcp::OwnedWriteHalf, error: String) -> anyhow::Result<()> {
    let mut frame = serde_json::to_vec(&Rejection { error })?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.shutdown().await?;
    Ok(())
}
