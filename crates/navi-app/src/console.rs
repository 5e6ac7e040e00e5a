//! Terminal transport: reads lines from stdin, prints replies to stdout.

use std::sync::Arc;

use async_trait::async_trait;
use navi_dialog::{AdapterError, Inbound, Responder};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Writes each reply as one `navi> ...` line.
pub struct ConsoleResponder<W> {
    out: Mutex<W>,
}

impl<W> ConsoleResponder<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

#[async_trait]
impl<W> Responder for ConsoleResponder<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn reply(&self, message: &str) -> Result<(), AdapterError> {
        let mut out = self.out.lock().await;
        out.write_all(format!("navi> {message}\n").as_bytes())
            .await
            .map_err(write_error)?;
        out.flush().await.map_err(write_error)
    }
}

/// A closed terminal is reported as [`AdapterError::Closed`].
fn write_error(e: std::io::Error) -> AdapterError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe => AdapterError::Closed,
        _ => AdapterError::Delivery(e.to_string()),
    }
}

/// Forward every non-blank line from `input` as a message from `user`.
///
/// Returns when the input ends, the user types `/quit`, or the runner stops.
pub async fn run<R>(
    input: R,
    user: &str,
    inbound: mpsc::Sender<Inbound>,
    responder: Arc<dyn Responder>,
) -> std::io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut sent = 0;
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            info!("Console session ended by user");
            break;
        }
        let message = Inbound::new(Some(user), text, Arc::clone(&responder));
        if inbound.send(message).await.is_err() {
            debug!("Adapter runner closed; stopping console");
            break;
        }
        sent += 1;
    }
    Ok(sent)
}
