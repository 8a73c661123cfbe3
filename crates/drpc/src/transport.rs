//! Local IPC channel to the peer: discovery, handshake and the frame pump.
//!
//! A [`Transport`] owns one open channel. Reading and writing run on their
//! own tasks; decoded frames come out as [`TransportEvent`]s on an unbounded
//! receiver handed back by [`Transport::open`]. Every kind of teardown (peer
//! `CLOSE`, EOF, I/O error, local [`Transport::close`]) ends with exactly one
//! [`TransportEvent::Close`] on that same receiver.

use crate::endpoint::EndpointProbe;
use drp_common::frame::{Frame, FrameDecoder, FrameError, Opcode};
use drp_common::types::{command, IPC_BASE_NAME, IPC_CANDIDATES, PROTOCOL_VERSION};
use drp_common::RpcMessage;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Stream type of the platform's IPC primitive.
#[cfg(unix)]
pub type IpcStream = tokio::net::UnixStream;
/// Stream type of the platform's IPC primitive.
#[cfg(windows)]
pub type IpcStream = tokio::net::windows::named_pipe::NamedPipeClient;

const READ_BUF_LEN: usize = 8192;
const WRITE_QUEUE: usize = 64;

/// Errors raised while opening or using a channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// None of the numbered candidates accepted a connection.
    #[error("no ipc channel found after {tried} candidates")]
    Discovery {
        /// Candidates attempted.
        tried: u32,
    },
    /// Socket-level failure.
    #[error("ipc i/o error: {0}")]
    Io(#[from] io::Error),
    /// A frame could not be encoded.
    #[error("frame encode failed: {0}")]
    Encode(#[from] FrameError),
    /// The channel is already closed.
    #[error("transport closed")]
    Closed,
}

/// Why a channel ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// [`Transport::close`] was called.
    Local,
    /// The peer sent a `CLOSE` frame with this body.
    Remote(Value),
    /// The peer closed the stream without a `CLOSE` frame.
    Eof,
    /// Read, write or framing failure.
    Error(String),
}

/// Events produced by the read loop, in decode order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded `FRAME` body.
    Message(RpcMessage),
    /// A background task failed; the channel stays up.
    Error(String),
    /// The channel is gone. The read loop emits nothing after it.
    Close(CloseReason),
}

enum WriterCmd {
    Frame(Vec<u8>),
    Close(Vec<u8>, oneshot::Sender<()>),
}

/// Handle to one open channel. Clones share the channel.
#[derive(Debug, Clone)]
pub struct Transport {
    writer: mpsc::Sender<WriterCmd>,
    stop: mpsc::UnboundedSender<CloseReason>,
    closed: watch::Receiver<bool>,
    endpoint: watch::Receiver<Option<String>>,
}

/// Directory holding the unix sockets, from the first non-empty of
/// `XDG_RUNTIME_DIR`, `TMPDIR`, `TMP`, `TEMP`, else `/tmp`. A trailing `/`
/// is stripped.
pub fn ipc_dir<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let dir = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"]
        .into_iter()
        .filter_map(&lookup)
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| "/tmp".to_string());
    match dir.strip_suffix('/') {
        Some(stripped) => stripped.to_string(),
        None => dir,
    }
}

/// Path of IPC candidate `n`.
#[cfg(unix)]
#[must_use]
pub fn ipc_path(n: u32) -> String {
    format!(
        "{}/{IPC_BASE_NAME}-{n}",
        ipc_dir(|key| std::env::var(key).ok())
    )
}

/// Path of IPC candidate `n`.
#[cfg(windows)]
#[must_use]
pub fn ipc_path(n: u32) -> String {
    format!(r"\\?\pipe\{IPC_BASE_NAME}-{n}")
}

#[cfg(unix)]
async fn open_candidate(n: u32) -> io::Result<IpcStream> {
    IpcStream::connect(ipc_path(n)).await
}

#[cfg(windows)]
async fn open_candidate(n: u32) -> io::Result<IpcStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(ipc_path(n))
}

/// Tries candidates `0..IPC_CANDIDATES` in order and returns the first that
/// opens.
///
/// # Errors
///
/// Returns [`TransportError::Discovery`] once every candidate has failed.
pub async fn discover() -> Result<IpcStream, TransportError> {
    for n in 0..IPC_CANDIDATES {
        match open_candidate(n).await {
            Ok(stream) => {
                debug!(candidate = n, "ipc channel opened");
                return Ok(stream);
            }
            Err(e) => {
                debug!(candidate = n, error = %e, "ipc candidate unavailable");
            }
        }
    }
    Err(TransportError::Discovery {
        tried: IPC_CANDIDATES,
    })
}

impl Transport {
    /// Takes ownership of an opened stream, queues the `HANDSHAKE` frame and
    /// starts the read and write tasks.
    ///
    /// Readiness is not awaited here; the peer signals it with a `READY`
    /// dispatch that arrives as an ordinary [`TransportEvent::Message`].
    /// When `probe` is set, every non-error `AUTHORIZE` response starts a
    /// background search for the HTTP endpoint (see
    /// [`Transport::http_endpoint`]).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Encode`] if the handshake cannot be encoded.
    pub fn open<S>(
        stream: S,
        client_id: &str,
        probe: Option<EndpointProbe>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let handshake = Frame::handshake(PROTOCOL_VERSION, client_id).encode()?;

        let (reader, writer) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE);
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let (endpoint_tx, endpoint_rx) = watch::channel(None);

        writer_tx
            .try_send(WriterCmd::Frame(handshake))
            .map_err(|_| TransportError::Closed)?;
        debug!(client_id, "handshake queued");

        tokio::spawn(write_loop(writer, writer_rx, stop_tx.clone()));
        tokio::spawn(
            ReadLoop {
                decoder: FrameDecoder::new(),
                writer: writer_tx.clone(),
                events: events_tx,
                probe,
                endpoint: Arc::new(endpoint_tx),
            }
            .run(reader, stop_rx, closed_tx),
        );

        Ok((
            Self {
                writer: writer_tx,
                stop: stop_tx,
                closed: closed_rx,
                endpoint: endpoint_rx,
            },
            events_rx,
        ))
    }

    /// Queues a frame for writing.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the writer has shut down, or
    /// [`TransportError::Encode`] if the frame is oversized.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        self.writer
            .send(WriterCmd::Frame(bytes))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Sends an RPC body as a `FRAME`.
    ///
    /// # Errors
    ///
    /// See [`Transport::send`].
    pub async fn send_message(&self, msg: &RpcMessage) -> Result<(), TransportError> {
        let frame = msg
            .to_frame()
            .map_err(|e| TransportError::Encode(FrameError::InvalidJson(e.to_string())))?;
        self.send(&frame).await
    }

    /// Sends a `PING` with a fresh random token and returns the token.
    ///
    /// # Errors
    ///
    /// See [`Transport::send`].
    pub async fn ping(&self) -> Result<String, TransportError> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        self.send(&Frame::ping(&token)).await?;
        Ok(token)
    }

    /// Sends `CLOSE`, shuts the channel down and waits until the read loop
    /// has emitted its [`TransportEvent::Close`].
    ///
    /// Calling this on an already closed transport returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Encode`] only if the close frame cannot be
    /// encoded.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        let bytes = Frame::close().encode()?;

        let _ = self.stop.send(CloseReason::Local);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.writer.send(WriterCmd::Close(bytes, ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }

        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
        Ok(())
    }

    /// Whether the read loop has finished.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// HTTP endpoint found after authorization, if any.
    #[must_use]
    pub fn http_endpoint(&self) -> Option<String> {
        self.endpoint.borrow().clone()
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<WriterCmd>,
    stop: mpsc::UnboundedSender<CloseReason>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Frame(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!(error = %e, "ipc write failed");
                    let _ = stop.send(CloseReason::Error(e.to_string()));
                    return;
                }
            }
            WriterCmd::Close(bytes, ack) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(error = %e, "close frame not delivered");
                }
                let _ = writer.shutdown().await;
                let _ = ack.send(());
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

struct ReadLoop {
    decoder: FrameDecoder,
    writer: mpsc::Sender<WriterCmd>,
    events: mpsc::UnboundedSender<TransportEvent>,
    probe: Option<EndpointProbe>,
    endpoint: Arc<watch::Sender<Option<String>>>,
}

impl ReadLoop {
    async fn run<R>(
        mut self,
        mut reader: R,
        mut stop: mpsc::UnboundedReceiver<CloseReason>,
        closed: watch::Sender<bool>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUF_LEN];
        let reason = loop {
            tokio::select! {
                biased;

                reason = stop.recv() => {
                    break reason.unwrap_or(CloseReason::Local);
                }

                read = reader.read(&mut buf) => match read {
                    Ok(0) => break CloseReason::Eof,
                    Ok(n) => {
                        self.decoder.push(&buf[..n]);
                        if let Some(reason) = self.drain().await {
                            break reason;
                        }
                    }
                    Err(e) => break CloseReason::Error(e.to_string()),
                },
            }
        };

        match &reason {
            CloseReason::Local => debug!("ipc channel closed locally"),
            other => info!(reason = ?other, "ipc channel closed"),
        }
        let _ = self.events.send(TransportEvent::Close(reason));
        closed.send_replace(true);
    }

    /// Dispatches every complete buffered frame. Returns a reason when the
    /// channel must end.
    async fn drain(&mut self) -> Option<CloseReason> {
        loop {
            let frame = match self.decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return None,
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "unrecoverable framing error");
                    return Some(CloseReason::Error(e.to_string()));
                }
                Err(e) => {
                    debug!(error = %e, "skipping undecodable frame");
                    continue;
                }
            };

            match frame.opcode {
                Opcode::Ping => {
                    let pong = match Frame::pong(frame.payload).encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(error = %e, "cannot echo ping");
                            continue;
                        }
                    };
                    if self.writer.send(WriterCmd::Frame(pong)).await.is_err() {
                        return Some(CloseReason::Error("writer gone".to_string()));
                    }
                }
                Opcode::Frame => match RpcMessage::from_value(frame.payload) {
                    Ok(msg) => {
                        if msg.cmd == command::AUTHORIZE && !msg.is_error() {
                            self.spawn_endpoint_probe();
                        }
                        let _ = self.events.send(TransportEvent::Message(msg));
                    }
                    Err(e) => debug!(error = %e, "ignoring non-rpc frame body"),
                },
                Opcode::Close => return Some(CloseReason::Remote(frame.payload)),
                Opcode::Pong => debug!("pong received"),
                Opcode::Handshake => debug!("ignoring handshake from peer"),
            }
        }
    }

    fn spawn_endpoint_probe(&self) {
        let Some(probe) = self.probe.clone() else {
            return;
        };
        let endpoint = Arc::clone(&self.endpoint);
        let events = self.events.clone();
        tokio::spawn(async move {
            match probe.find().await {
                Ok(url) => {
                    endpoint.send_replace(Some(url));
                }
                Err(e) => {
                    warn!(error = %e, "http endpoint discovery failed");
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                }
            }
        });
    }
}
