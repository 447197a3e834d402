//! Line-delimited JSON-RPC exchange driver.
//!
//! One [`RpcChannel::exchange`] writes exactly one request line, then reads
//! exactly one response line. The channel takes `&mut self`, so a second
//! request can never be written while a response is outstanding and no
//! pending-request table is needed.
//!
//! The channel is generic over its streams: the supervisor hands it the
//! child's stdout/stdin, tests hand it in-memory duplex pipes.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::protocol::{DecodeError, JsonRpcNotification, JsonRpcRequest, Response};

/// Errors that end an exchange. Peer-reported JSON-RPC errors are not
/// here: those arrive as [`Response::Failure`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("peer artifact not found: {}", path.display())]
    ArtifactMissing { path: PathBuf },

    #[error("failed to launch peer `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("peer closed its output before answering `{method}`")]
    PeerClosed { method: String },

    #[error("malformed response to `{method}`: {source} (raw line: {line:?})")]
    MalformedResponse {
        method: String,
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("protocol violation in response to `{method}`: {reason} (raw line: {line:?})")]
    ProtocolViolation {
        method: String,
        reason: String,
        line: String,
    },

    #[error("no response to `{method}` within {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("transport I/O error during `{method}`: {source}")]
    Io {
        method: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode `{method}`: {source}")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("channel is out of sync after an earlier failure, refusing to send `{method}`")]
    Desynchronized { method: String },

    #[error("channel is closed, cannot send `{method}`")]
    Closed { method: String },
}

impl RpcError {
    /// Whether the peer never got as far as running.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Self::ArtifactMissing { .. } | Self::Launch { .. })
    }

    /// The method being exchanged when the error occurred, if any.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::ArtifactMissing { .. } | Self::Launch { .. } => None,
            Self::PeerClosed { method }
            | Self::MalformedResponse { method, .. }
            | Self::ProtocolViolation { method, .. }
            | Self::Timeout { method, .. }
            | Self::Io { method, .. }
            | Self::Encode { method, .. }
            | Self::Desynchronized { method }
            | Self::Closed { method } => Some(method),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Idle,
    /// A request was written and its response not yet read. Seeing this at
    /// the start of an exchange means the previous one was cancelled.
    InFlight,
    Broken,
    Closed,
}

/// Half-duplex JSON-RPC channel over a reader/writer pair.
pub struct RpcChannel<R, W> {
    reader: BufReader<R>,
    writer: W,
    read_timeout: Option<Duration>,
    state: ChannelState,
    completed: u64,
}

impl<R, W> RpcChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// `read_timeout` bounds each response read; `None` waits forever.
    pub fn new(reader: R, writer: W, read_timeout: Option<Duration>) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            read_timeout,
            state: ChannelState::Idle,
            completed: 0,
        }
    }

    /// Number of exchanges that returned a decoded response.
    pub fn completed_exchanges(&self) -> u64 {
        self.completed
    }

    /// Whether further exchanges can be attempted.
    pub fn is_usable(&self) -> bool {
        self.state == ChannelState::Idle
    }

    /// Send one request and wait for its one response.
    pub async fn exchange(&mut self, request: &JsonRpcRequest) -> Result<Response, RpcError> {
        let method = request.method.as_str();
        self.ensure_usable(method)?;

        let json = serde_json::to_string(request).map_err(|source| RpcError::Encode {
            method: method.to_string(),
            source,
        })?;

        tracing::debug!(id = request.id, method, "sending request");
        self.state = ChannelState::InFlight;

        let outcome = self.round_trip(method, &json).await;
        match &outcome {
            Ok(response) => {
                self.state = ChannelState::Idle;
                self.completed += 1;
                if response.id() != request.id {
                    tracing::warn!(
                        expected_id = request.id,
                        got_id = response.id(),
                        method,
                        "response id does not match request id"
                    );
                }
                tracing::debug!(
                    id = response.id(),
                    method,
                    is_error = response.is_error(),
                    "received response"
                );
            }
            Err(e) => {
                self.state = ChannelState::Broken;
                tracing::warn!(id = request.id, method, error = %e, "exchange failed");
            }
        }
        outcome
    }

    /// Send a notification. Nothing is read back.
    pub async fn notify(&mut self, notification: &JsonRpcNotification) -> Result<(), RpcError> {
        let method = notification.method.as_str();
        self.ensure_usable(method)?;

        let json = serde_json::to_string(notification).map_err(|source| RpcError::Encode {
            method: method.to_string(),
            source,
        })?;

        tracing::debug!(method, "sending notification");
        if let Err(e) = self.write_line(method, &json).await {
            self.state = ChannelState::Broken;
            return Err(e);
        }
        Ok(())
    }

    /// Shut down the write half, which the peer sees as end of input.
    pub async fn close(&mut self) -> std::io::Result<()> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        self.state = ChannelState::Closed;
        self.writer.shutdown().await
    }

    fn ensure_usable(&self, method: &str) -> Result<(), RpcError> {
        match self.state {
            ChannelState::Idle => Ok(()),
            ChannelState::Closed => Err(RpcError::Closed {
                method: method.to_string(),
            }),
            ChannelState::InFlight | ChannelState::Broken => Err(RpcError::Desynchronized {
                method: method.to_string(),
            }),
        }
    }

    async fn round_trip(&mut self, method: &str, json: &str) -> Result<Response, RpcError> {
        self.write_line(method, json).await?;
        let line = self.read_line(method).await?;

        Response::decode(&line).map_err(|e| {
            let raw = String::from_utf8_lossy(&line).into_owned();
            match e {
                DecodeError::Malformed(source) => RpcError::MalformedResponse {
                    method: method.to_string(),
                    line: raw,
                    source,
                },
                DecodeError::Violation(reason) => RpcError::ProtocolViolation {
                    method: method.to_string(),
                    reason,
                    line: raw,
                },
            }
        })
    }

    /// Write a line of JSON and flush it straight through.
    async fn write_line(&mut self, method: &str, json: &str) -> Result<(), RpcError> {
        let write = async {
            self.writer.write_all(json.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await
        };
        write.await.map_err(|source| io_error(method, source))
    }

    /// Read one newline-terminated line, without the terminator.
    ///
    /// End of stream before a newline (including a partial line) means the
    /// peer went away mid-exchange.
    async fn read_line(&mut self, method: &str) -> Result<Vec<u8>, RpcError> {
        let mut buf = Vec::new();
        let read = self.reader.read_until(b'\n', &mut buf);

        let result = match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                })?,
            None => read.await,
        };
        result.map_err(|source| io_error(method, source))?;

        if buf.last() != Some(&b'\n') {
            if !buf.is_empty() {
                tracing::debug!(
                    partial = %String::from_utf8_lossy(&buf),
                    method,
                    "peer output ended mid-line"
                );
            }
            return Err(RpcError::PeerClosed {
                method: method.to_string(),
            });
        }

        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(buf)
    }
}

fn io_error(method: &str, source: std::io::Error) -> RpcError {
    if source.kind() == std::io::ErrorKind::BrokenPipe {
        RpcError::PeerClosed {
            method: method.to_string(),
        }
    } else {
        RpcError::Io {
            method: method.to_string(),
            source,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
