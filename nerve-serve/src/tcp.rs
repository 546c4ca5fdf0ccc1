//! TCP transport (spec.md §6 "TCP on a configured host/port"). Same
//! newline-delimited JSON framing as the Unix socket transport.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use nerve::command::SessionManager;

use crate::envelope::{decode_line, ResponseFrame};

pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

pub async fn serve(manager: Arc<SessionManager>, listener: TcpListener) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "tcp transport listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(manager, stream).await {
                tracing::warn!("tcp connection ended: {e}");
            }
        });
    }
}

async fn handle_connection(manager: Arc<SessionManager>, stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match decode_line(&line) {
            Ok(frame) => {
                let id = frame.id.clone();
                let response = nerve::command::dispatch(&manager, frame.into()).await;
                ResponseFrame::from_response(id, response)
            }
            Err(err) => err,
        };
        let mut out = serde_json::to_string(&response).unwrap_or_default();
        out.push('\n');
        write_half.write_all(out.as_bytes()).await?;
    }
    Ok(())
}
