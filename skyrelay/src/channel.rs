//! Newline-delimited JSON framing over a TCP stream.
//!
//! A [`FramedChannel`] exchanges discrete serialized messages over a byte
//! stream. Each message is one line of JSON terminated by `\n`; a frame is
//! written in full or not at all.
//!
//! # Threading
//!
//! The read and write halves each sit behind an async mutex, so a channel can
//! be shared through an `Arc`: one task may block in [`FramedChannel::receive`]
//! while another calls [`FramedChannel::send`] or [`FramedChannel::close`].
//! Concurrent senders are serialized at frame granularity; any ordering
//! between them is the caller's business.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;

/// Default upper bound on a single frame, newline included.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Default timeout for [`FramedChannel::connect`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A bidirectional, newline-framed, JSON message connection.
#[derive(Debug)]
pub struct FramedChannel {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    peer: Option<SocketAddr>,
    connected: AtomicBool,
    closed: CancellationToken,
    max_frame_len: usize,
}

impl FramedChannel {
    /// Wraps an established stream.
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();

        Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(Some(write_half)),
            peer,
            connected: AtomicBool::new(true),
            closed: CancellationToken::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Connects to `addr`, giving up after `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connect`] if the connection is refused or
    /// times out.
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self, ChannelError> {
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ChannelError::Connect {
                    addr: addr.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                return Err(ChannelError::Connect {
                    addr: addr.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connection timed out",
                    ),
                });
            }
        };

        Ok(Self::new(stream))
    }

    /// Sets the maximum accepted frame length.
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Address of the remote end, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Non-blocking liveness check.
    ///
    /// Turns false once the channel is closed locally, the peer closes, or a
    /// read or write fails.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.closed.is_cancelled()
    }

    /// Serializes `message` and writes it as one frame.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] on a closed channel,
    /// [`ChannelError::Encode`] if serialization fails, or
    /// [`ChannelError::Io`] if the write fails; a failed write marks the
    /// channel disconnected.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Closed);
        }

        let mut frame = serde_json::to_vec(message).map_err(ChannelError::Encode)?;
        frame.push(b'\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;

        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            self.connected.store(false, Ordering::Release);
            *guard = None;
            return Err(ChannelError::Io(e));
        }

        Ok(())
    }

    /// Waits for the next frame and deserializes it.
    ///
    /// Returns `Ok(None)` when the peer closes cleanly, resets the
    /// connection, or the channel is closed locally while waiting. Blank
    /// lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Decode`] for a frame that is not a `T` (the
    /// channel stays usable), [`ChannelError::FrameTooLong`] for an oversized
    /// frame, or [`ChannelError::Io`] for any other transport failure.
    pub async fn receive<T: DeserializeOwned>(&self) -> Result<Option<T>, ChannelError> {
        let mut reader = self.reader.lock().await;

        loop {
            let mut buf = Vec::new();
            let read = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                read = read_frame(&mut reader, &mut buf, self.max_frame_len) => read,
            };

            match read {
                Ok(0) => {
                    self.connected.store(false, Ordering::Release);
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) if is_peer_reset(&e) => {
                    self.connected.store(false, Ordering::Release);
                    return Ok(None);
                }
                Err(e) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(ChannelError::Io(e));
                }
            }

            if buf.last() != Some(&b'\n') && buf.len() > self.max_frame_len {
                self.connected.store(false, Ordering::Release);
                return Err(ChannelError::FrameTooLong {
                    limit: self.max_frame_len,
                });
            }

            let line = buf.trim_ascii();
            if line.is_empty() {
                continue;
            }

            return serde_json::from_slice(line)
                .map(Some)
                .map_err(|source| ChannelError::Decode {
                    frame: String::from_utf8_lossy(line).into_owned(),
                    source,
                });
        }
    }

    /// Closes the channel. Idempotent and safe to call while another task
    /// is blocked in [`FramedChannel::receive`], which then returns
    /// `Ok(None)`.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.closed.cancel();

        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::trace!(error = %e, "shutdown on close failed");
            }
        }
    }
}

/// Reads up to and including the next newline, never more than
/// `max_frame_len + 1` bytes.
async fn read_frame(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
    max_frame_len: usize,
) -> std::io::Result<usize> {
    let limit = u64::try_from(max_frame_len).unwrap_or(u64::MAX).saturating_add(1);
    let mut limited = AsyncReadExt::take(reader, limit);
    limited.read_until(b'\n', buf).await
}

fn is_peer_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
    )
}
