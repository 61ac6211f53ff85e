//! Newline-framed serve loop for one client connection. The boundary layer
//! (WebSocket handshake, JWT verification) lives outside; this crate speaks
//! `{type, payload, requestId?}` frames over any byte stream and drives the
//! core runtime.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;

use cloud_codex_core::config::GatewayConfig;
use cloud_codex_core::registry::SessionRegistry;
use cloud_codex_protocol::frames::ClientFrame;
use cloud_codex_protocol::frames::ServerFrame;

mod adapter;

pub use adapter::ClientGatewayAdapter;

/// Size of the bounded channel between the adapter and the frame writer.
const CHANNEL_CAPACITY: usize = 128;

/// Serve a single connection over stdio, then shut the registry down.
pub async fn run_main(config: GatewayConfig, user_id: String) -> anyhow::Result<()> {
    let registry = SessionRegistry::new(config);
    registry.spawn_idle_sweeper();

    serve_connection(Arc::clone(&registry), user_id, io::stdin(), io::stdout()).await?;

    registry.shutdown().await;
    Ok(())
}

/// Drive one newline-framed connection until EOF. The writer task owns the
/// outbound half; incoming frames are dispatched in arrival order.
pub async fn serve_connection<R, W>(
    registry: Arc<SessionRegistry>,
    user_id: String,
    reader: R,
    writer: W,
) -> cloud_codex_core::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ServerFrame>(CHANNEL_CAPACITY);

    let writer_handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = outgoing_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if writer.write_all(json.as_bytes()).await.is_err() {
                        error!("failed to write frame to client");
                        break;
                    }
                    if writer.write_all(b"\n").await.is_err() {
                        break;
                    }
                    if writer.flush().await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to serialize frame: {e}"),
            }
        }
    });

    let adapter =
        ClientGatewayAdapter::connect(registry, user_id, outgoing_tx.clone()).await?;

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ClientFrame>(&line) {
            Ok(frame) => adapter.process_frame(frame).await,
            Err(e) => {
                error!("dropping malformed client frame: {e}");
                let _ = outgoing_tx
                    .send(ServerFrame::error(None, format!("malformed frame: {e}")))
                    .await;
            }
        }
    }
    debug!("client connection reached EOF");

    adapter.close();
    // The writer drains once every sender is gone.
    drop(adapter);
    drop(outgoing_tx);
    let _ = writer_handle.await;
    Ok(())
}
