//! TCP line-protocol server.
//!
//! Accepts connections carrying newline-delimited JSON messages and routes
//! each decoded [`Message`] to a shared [`MessageHandler`]. A malformed line
//! is logged and skipped; the connection stays open. An oversized frame tears
//! down only the offending connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::Message;

/// Upper bound on a single newline-delimited frame. Camera frames carry
/// base64 JPEG payloads, so the limit is generous.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Sink for decoded messages. One handler is shared by every connection of a
/// server, so per-message processing happens under its lock.
pub trait MessageHandler: Send {
    fn handle(&mut self, msg: Message);
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame exceeds {limit} bytes")]
    TooLong { limit: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one newline-terminated frame, without the terminator.
///
/// Returns `Ok(None)` on a clean EOF. A trailing unterminated frame at EOF is
/// returned as a final frame. A trailing `\r` is stripped.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if frame.is_empty() { None } else { Some(frame) });
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if frame.len() + pos > MAX_FRAME_LEN {
                    return Err(FrameError::TooLong { limit: MAX_FRAME_LEN });
                }
                frame.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                if frame.last() == Some(&b'\r') {
                    frame.pop();
                }
                return Ok(Some(frame));
            }
            None => {
                let len = available.len();
                if frame.len() + len > MAX_FRAME_LEN {
                    return Err(FrameError::TooLong { limit: MAX_FRAME_LEN });
                }
                frame.extend_from_slice(available);
                reader.consume(len);
            }
        }
    }
}

/// A running telemetry listener.
pub struct TelemetryServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TelemetryServer {
    /// Bind `addr` and start accepting connections. `name` labels log lines.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use parking_lot::Mutex;
    /// use armwatch::{CanMetricsProcessor, MessageHandler, RecordingSink, SinkHandle, TelemetryServer};
    ///
    /// tokio_test::block_on(async {
    ///     let sink = SinkHandle::new(Arc::new(RecordingSink::new()));
    ///     let handler: Arc<Mutex<dyn MessageHandler>> =
    ///         Arc::new(Mutex::new(CanMetricsProcessor::new(sink)));
    ///
    ///     // Port 0 picks a free port; local_addr() reports the real one.
    ///     let server = TelemetryServer::bind("can", "127.0.0.1:0", handler).await.unwrap();
    ///     assert_ne!(server.local_addr().port(), 0);
    ///     server.stop().await;
    /// });
    /// ```
    pub async fn bind(
        name: &'static str,
        addr: &str,
        handler: Arc<Mutex<dyn MessageHandler>>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {name} server on {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!("{} server listening on {}", name, local_addr);

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(name, listener, handler, rx));

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal shutdown and wait for the accept loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn accept_loop(
    name: &'static str,
    listener: TcpListener,
    handler: Arc<Mutex<dyn MessageHandler>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("{} server shutting down", name);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("{}: connection from {}", name, peer);
                    let handler = Arc::clone(&handler);
                    let shutdown = shutdown.clone();
                    tokio::spawn(serve_connection(name, stream, peer, handler, shutdown));
                }
                Err(e) => warn!("{}: accept failed: {}", name, e),
            }
        }
    }
}

async fn serve_connection(
    name: &'static str,
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Mutex<dyn MessageHandler>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(None) => {
                    debug!("{}: {} disconnected", name, peer);
                    break;
                }
                Ok(Some(line)) => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    dispatch(name, peer, &line, &handler);
                }
                Err(e) => {
                    warn!("{}: closing connection to {}: {}", name, peer, e);
                    break;
                }
            }
        }
    }
}

fn dispatch(
    name: &'static str,
    peer: SocketAddr,
    line: &[u8],
    handler: &Arc<Mutex<dyn MessageHandler>>,
) {
    match Message::from_slice(line) {
        Ok(Message::Unrecognized { kind }) => {
            warn!("{}: ignoring unrecognized message type {:?} from {}", name, kind, peer);
        }
        Ok(msg) => handler.lock().handle(msg),
        Err(e) => warn!("{}: discarding malformed line from {}: {}", name, peer, e),
    }
}
