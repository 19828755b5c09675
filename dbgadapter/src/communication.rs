/// Command channel for the debug agent protocol
///
/// This module handles the low-level exchange on the primary connection:
/// command framing, status verification and bulk data transfer.

use std::io;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::WireRecord;
use crate::types::{Command, Status, COMMAND_HEADER_SIZE, MAX_CHUNK_SIZE, PACKET_MAGIC, STATUS_SIZE};
use crate::{DebugError, Result};

/// A fixed-width primitive argument of a command payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    U8(u8),
    I32(i32),
    U32(u32),
    U64(u64),
}

impl Arg {
    /// Number of bytes the argument occupies on the wire
    pub fn wire_size(&self) -> usize {
        match self {
            Arg::U8(_) => 1,
            Arg::I32(_) | Arg::U32(_) => 4,
            Arg::U64(_) => 8,
        }
    }

    fn put<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Arg::U8(v) => buf.put_u8(v),
            Arg::I32(v) => buf.put_i32_le(v),
            Arg::U32(v) => buf.put_u32_le(v),
            Arg::U64(v) => buf.put_u64_le(v),
        }
    }
}

/// Serialize a command header and its payload.
///
/// Fails with [`DebugError::PayloadSizeMismatch`] when `declared_size` is not
/// the serialized size of `args`; nothing is produced in that case.
pub fn encode_command(command: Command, declared_size: usize, args: &[Arg]) -> Result<Vec<u8>> {
    let actual: usize = args.iter().map(Arg::wire_size).sum();
    if actual != declared_size {
        return Err(DebugError::PayloadSizeMismatch {
            declared: declared_size,
            actual,
        });
    }

    let mut buf = BytesMut::with_capacity(COMMAND_HEADER_SIZE + actual);
    buf.put_u32_le(PACKET_MAGIC);
    buf.put_u32_le(command.code());
    buf.put_u32_le(declared_size as u32);
    for arg in args {
        arg.put(&mut buf);
    }
    Ok(buf.to_vec())
}

/// The primary connection to the target.
///
/// A channel carries one command sequence at a time; callers serialize access
/// (the client holds it behind an async mutex for the full
/// command/status/data sequence).
pub struct Channel<S> {
    stream: S,
    read_timeout: Option<Duration>,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(stream: S, read_timeout: Option<Duration>) -> Self {
        Self {
            stream,
            read_timeout,
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Bound every subsequent read; `None` blocks indefinitely
    pub fn set_read_timeout(&mut self, read_timeout: Option<Duration>) {
        self.read_timeout = read_timeout;
    }

    /// Swap in a different read timeout until the returned guard is dropped.
    /// The previous timeout comes back even if the owning future is cancelled.
    pub fn override_read_timeout(&mut self, read_timeout: Option<Duration>) -> TimeoutOverride<'_, S> {
        let saved = std::mem::replace(&mut self.read_timeout, read_timeout);
        TimeoutOverride {
            channel: self,
            saved,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Frame and send a command. The caller must follow up with exactly one
    /// [`Channel::check_status`] (or a command-specific read) before anything else.
    pub async fn send_command(&mut self, command: Command, declared_size: usize, args: &[Arg]) -> Result<()> {
        let packet = encode_command(command, declared_size, args)?;

        log::debug!("SEND: {} payload={} bytes", command, declared_size);

        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next status word without judging it
    pub async fn read_status(&mut self) -> Result<Status> {
        let raw = self.receive_u32().await?;
        Ok(Status::from_code(raw))
    }

    /// Read the next status word and fail unless it reports success
    pub async fn check_status(&mut self) -> Result<()> {
        let status = self.read_status().await?;
        if status.is_success() {
            log::debug!("RECV: status {}", status);
            Ok(())
        } else {
            log::warn!("RECV: target rejected command -> {}", status);
            Err(DebugError::RemoteRejected(status))
        }
    }

    /// Send a command and require a successful status for it
    pub async fn exchange(&mut self, command: Command, declared_size: usize, args: &[Arg]) -> Result<()> {
        self.send_command(command, declared_size, args).await?;
        self.check_status().await
    }

    /// Write exactly `length` bytes of bulk data
    pub async fn send_data(&mut self, data: &[u8], length: usize) -> Result<()> {
        if data.len() != length {
            return Err(DebugError::PayloadSizeMismatch {
                declared: length,
                actual: data.len(),
            });
        }

        log::trace!("SEND: {} bytes of data", length);

        for chunk in data.chunks(MAX_CHUNK_SIZE) {
            self.stream.write_all(chunk).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Read exactly `length` bytes, however the transport splits them.
    ///
    /// The buffer grows as data arrives, so a bogus length announced by the
    /// target ends in [`DebugError::TransferIncomplete`] rather than a huge
    /// allocation. The read timeout bounds each individual read.
    pub async fn receive_data(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(length.min(MAX_CHUNK_SIZE));

        while buf.len() < length {
            let want = (length - buf.len()).min(MAX_CHUNK_SIZE);
            buf.reserve(want);
            let mut limited = (&mut self.stream).take(want as u64);
            let read = limited.read_buf(&mut buf);

            let timed = match self.read_timeout {
                Some(limit) => tokio::time::timeout(limit, read).await,
                None => Ok(read.await),
            };
            let Ok(outcome) = timed else {
                log::warn!("RECV: timed out after {} of {} bytes", buf.len(), length);
                break;
            };

            match outcome {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }

        if buf.len() != length {
            return Err(DebugError::TransferIncomplete {
                expected: length,
                received: buf.len(),
            });
        }

        log::trace!("RECV: {} bytes of data", length);
        Ok(buf)
    }

    pub async fn receive_u32(&mut self) -> Result<u32> {
        let raw = self.receive_data(STATUS_SIZE).await?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub async fn receive_u64(&mut self) -> Result<u64> {
        let raw = self.receive_data(8).await?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Receive one fixed-size record and decode it
    pub async fn receive_record<R: WireRecord>(&mut self) -> Result<R> {
        let raw = self.receive_data(R::SIZE).await?;
        R::decode(&raw)
    }

    /// Send one fixed-size record as bulk data
    pub async fn send_record<R: WireRecord>(&mut self, record: &R) -> Result<()> {
        self.send_data(&record.encode(), R::SIZE).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Channel with a temporarily replaced read timeout
pub struct TimeoutOverride<'a, S> {
    channel: &'a mut Channel<S>,
    saved: Option<Duration>,
}

impl<S> Deref for TimeoutOverride<'_, S> {
    type Target = Channel<S>;

    fn deref(&self) -> &Channel<S> {
        self.channel
    }
}

impl<S> DerefMut for TimeoutOverride<'_, S> {
    fn deref_mut(&mut self) -> &mut Channel<S> {
        self.channel
    }
}

impl<S> Drop for TimeoutOverride<'_, S> {
    fn drop(&mut self) {
        self.channel.read_timeout = self.saved;
    }
}
