//! Framed message channel over one TCP stream.
//!
//! The read and write halves are locked independently: a keepalive ping can
//! go out while the operator loop is parked in `recv` waiting for a slow
//! command, and two concurrent senders never interleave their frames.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

use crate::error::ChannelError;
use crate::protocol::{Frame, FrameFormat, MessageKind};

const READ_CHUNK: usize = 64 * 1024;

struct FrameReader {
    half: OwnedReadHalf,
    /// Bytes received but not yet consumed as a frame. Survives a cancelled
    /// `recv`, which keeps reads aligned on frame boundaries after a timeout.
    pending: Vec<u8>,
}

impl FrameReader {
    async fn next_frame(&mut self, format: &FrameFormat) -> Result<Frame, ChannelError> {
        loop {
            if let Some(frame) = format.decode(&mut self.pending)? {
                return Ok(frame);
            }
            self.pending.reserve(READ_CHUNK);
            let n = self.half.read_buf(&mut self.pending).await?;
            if n == 0 {
                return Err(ChannelError::Closed);
            }
        }
    }
}

pub struct Channel {
    reader: Mutex<FrameReader>,
    writer: Mutex<OwnedWriteHalf>,
    format: FrameFormat,
    /// Set once the stream can no longer carry whole frames: a write was
    /// abandoned midway, or incoming framing was lost.
    broken: AtomicBool,
}

impl Channel {
    pub fn new(stream: TcpStream, format: FrameFormat) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Mutex::new(FrameReader {
                half: read_half,
                pending: Vec::new(),
            }),
            writer: Mutex::new(write_half),
            format,
            broken: AtomicBool::new(false),
        }
    }

    /// Encode and write one message.
    ///
    /// Waits for any write already in progress; `timeout` covers only this
    /// message's own bytes.
    pub async fn send(
        &self,
        kind: MessageKind,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), ChannelError> {
        self.check_usable()?;
        let frame = self.format.encode(kind, payload)?;
        let mut writer = self.writer.lock().await;
        self.write_locked(&mut writer, &frame, timeout).await
    }

    /// Like `send`, but returns `Ok(false)` without writing anything when
    /// another write is in progress.
    pub async fn send_if_idle(
        &self,
        kind: MessageKind,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<bool, ChannelError> {
        self.check_usable()?;
        let frame = self.format.encode(kind, payload)?;
        let Ok(mut writer) = self.writer.try_lock() else {
            return Ok(false);
        };
        self.write_locked(&mut writer, &frame, timeout).await?;
        Ok(true)
    }

    async fn write_locked(
        &self,
        writer: &mut OwnedWriteHalf,
        frame: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), ChannelError> {
        let mut written = 0;
        let result = with_timeout(timeout, write_frame(writer, frame, &mut written)).await;
        if matches!(result, Err(ChannelError::Timeout(_))) && written > 0 {
            // The peer holds a partial frame; the stream is out of sync.
            self.broken.store(true, Ordering::Release);
        }
        result
    }

    /// Read the next complete message.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Frame, ChannelError> {
        self.check_usable()?;
        let result = with_timeout(timeout, async {
            let mut reader = self.reader.lock().await;
            reader.next_frame(&self.format).await
        })
        .await;

        if let Err(ChannelError::Corrupt(reason)) = &result {
            debug!(reason = %reason, "incoming framing lost, closing");
            self.shutdown().await;
        }
        result
    }

    /// Receive until a message of `kind` arrives, reading at most
    /// `retries + 1` messages, each under its own `timeout`.
    ///
    /// Messages of any other kind are dropped, not queued: the protocol has
    /// no multiplexing, so out-of-order traffic is treated as noise and is
    /// lost.
    pub async fn expect(
        &self,
        kind: MessageKind,
        timeout: Option<Duration>,
        retries: u32,
    ) -> Result<Vec<u8>, ChannelError> {
        for _ in 0..=retries {
            let frame = self.recv(timeout).await?;
            if frame.kind == kind {
                return Ok(frame.payload);
            }
            debug!(expected = %kind, received = %frame.kind, "discarding unexpected message");
        }
        Err(ChannelError::protocol(format!(
            "expected {kind}, none among {} message(s)",
            u64::from(retries) + 1
        )))
    }

    /// Shut the write half down. Later sends and receives fail with `Closed`.
    pub async fn shutdown(&self) {
        self.broken.store(true, Ordering::Release);
        // A writer stuck mid-send holds the lock; dropping the stream closes it then.
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> Result<(), ChannelError> {
        if self.is_broken() {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

/// Write all of `frame`, counting progress in `written` so a caller that
/// gives up can tell whether anything reached the socket.
async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &[u8],
    written: &mut usize,
) -> Result<(), ChannelError> {
    while *written < frame.len() {
        let n = writer.write(&frame[*written..]).await?;
        if n == 0 {
            return Err(ChannelError::Closed);
        }
        *written += n;
    }
    writer.flush().await?;
    Ok(())
}

async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, ChannelError>
where
    F: Future<Output = Result<T, ChannelError>>,
{
    match timeout {
        Some(limit) => time::timeout(limit, fut)
            .await
            .unwrap_or(Err(ChannelError::Timeout(limit))),
        None => fut.await,
    }
}
