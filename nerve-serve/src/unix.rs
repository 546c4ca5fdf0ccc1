//! Unix domain socket transport (spec.md §6 "Unix socket at
//! `/tmp/nerve-<name>.sock`"). Newline-delimited JSON framing, one connection
//! handled per spawned task.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use nerve::command::SessionManager;

use crate::envelope::{decode_line, ResponseFrame};

pub async fn serve(manager: Arc<SessionManager>, socket_path: std::path::PathBuf) -> std::io::Result<()> {
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    tracing::info!(path = %socket_path.display(), "unix transport listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(manager, stream).await {
                tracing::warn!("unix connection ended: {e}");
            }
        });
    }
}

async fn handle_connection(manager: Arc<SessionManager>, stream: UnixStream) -> std::io::Result<()> {
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
