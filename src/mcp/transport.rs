//! Newline-delimited JSON transport.
//!
//! Each line on the input is one JSON-RPC message and each reply is written
//! as one line. Serialised JSON never contains a raw newline, so no further
//! framing is needed. On stdio, stdout carries only protocol messages and logs
//! go to stderr.
//!
//! The transport is generic over `AsyncRead`/`AsyncWrite`, which lets tests
//! run it over an in-memory duplex pipe.
//!
//! `initialize`, notifications and anything sent before initialisation are
//! handled in arrival order. Every other request runs on its own task so a
//! slow tool does not hold up the next request. Replies are funnelled through
//! a single writer task and may therefore arrive out of order; clients
//! correlate them by id.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mcp::protocol::{parse_message, OutgoingMessage, OutgoingNotification};
use crate::mcp::server::{Connection, McpServer};

/// Capacity of the outgoing message queue.
const OUTGOING_QUEUE: usize = 64;

/// Reads newline-delimited messages.
pub struct LineReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wraps a byte stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Reads the next message line.
    ///
    /// Returns `None` if the stream is closed (EOF).
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }

        Ok(Some(line))
    }
}

/// Writes newline-delimited messages.
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    /// Wraps a byte sink.
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one outgoing message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    pub async fn write_message(&mut self, message: &OutgoingMessage) -> io::Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        self.write_raw(&json).await
    }

    /// Writes a raw JSON string with newline termination.
    async fn write_raw(&mut self, json: &str) -> io::Result<()> {
        debug_assert!(!json.contains('\n'), "serde_json emitted a raw newline");

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Serves one client over stdin/stdout until EOF or `shutdown`.
///
/// # Errors
///
/// Returns an error if reading stdin or writing stdout fails.
pub async fn serve_stdio(server: Arc<McpServer>, shutdown: CancellationToken) -> io::Result<()> {
    serve(server, tokio::io::stdin(), tokio::io::stdout(), shutdown).await
}

/// Serves one client over a line-delimited byte stream.
///
/// On EOF, in-flight requests are allowed to finish and their replies are
/// written. On `shutdown`, in-flight requests are aborted.
///
/// # Errors
///
/// Returns an error if reading or writing fails.
pub async fn serve<R, W>(
    server: Arc<McpServer>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = LineReader::new(reader);
    let (tx, mut rx) = mpsc::channel::<OutgoingMessage>(OUTGOING_QUEUE);

    let writer_task = tokio::spawn(async move {
        let mut writer = LineWriter::new(writer);
        while let Some(message) = rx.recv().await {
            writer.write_message(&message).await?;
        }
        io::Result::Ok(())
    });

    let conn = Arc::new(Connection::new());
    let mut changes = server.registry().subscribe();
    let mut watching_changes = true;
    let mut in_flight = JoinSet::new();

    let read_result = loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Shutdown requested, closing line transport");
                in_flight.abort_all();
                break Ok(());
            }

            change = changes.recv(), if watching_changes => {
                match change {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if conn.is_initialized() {
                            let notification = OutgoingNotification::tools_list_changed();
                            if tx.send(notification.into()).await.is_err() {
                                break Ok(());
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => watching_changes = false,
                }
            }

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Request task failed");
                }
            }

            line = reader.read_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("Input closed");
                        while in_flight.join_next().await.is_some() {}
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let msg = match parse_message(&line) {
                    Ok(msg) => msg,
                    Err(error) => {
                        if tx.send(error.into()).await.is_err() {
                            break Ok(());
                        }
                        continue;
                    }
                };

                // Anything received before initialisation completes is answered in order.
                if msg.is_initialize() || msg.id().is_none() || !conn.is_initialized() {
                    if let Some(reply) = server.dispatch(&conn, msg).await {
                        if tx.send(reply).await.is_err() {
                            break Ok(());
                        }
                    }
                } else {
                    let server = Arc::clone(&server);
                    let conn = Arc::clone(&conn);
                    let tx = tx.clone();
                    in_flight.spawn(async move {
                        if let Some(reply) = server.dispatch(&conn, msg).await {
                            let _ = tx.send(reply).await;
                        }
                    });
                }
            }
        }
    };

    drop(tx);
    let write_result = writer_task.await.map_err(io::Error::other)?;
    read_result.and(write_result)
}
