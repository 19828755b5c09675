/// Remote debug agent client
///
/// This crate speaks the binary command protocol of a remote debug agent:
/// it frames commands, verifies status words, moves bulk data, and runs the
/// interrupt listener that receives trap notifications while a process is
/// attached.

use std::sync::atomic::AtomicU16;
use std::sync::Mutex;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{MappedMutexGuard, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

pub mod codec;
pub mod commands;
pub mod communication;
pub mod config;
pub mod connection;
pub mod events;
pub mod session;
pub mod types;

pub use codec::*;
pub use communication::{Arg, Channel};
pub use config::ClientConfig;
pub use events::{channel_handler, InterruptHandler, InterruptListener};
pub use types::*;

use session::Session;

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("Not connected to the debug agent")]
    NotConnected,
    #[error("No process is attached")]
    NotAttached,
    #[error("A debug session is already active")]
    AlreadyAttached,
    #[error("{kind} index {index} out of range (limit {max})")]
    IndexOutOfRange {
        kind: &'static str,
        index: u32,
        max: u32,
    },
    #[error("Target rejected command: {0}")]
    RemoteRejected(Status),
    #[error("Malformed {record} record: expected {expected} bytes, got {actual}")]
    MalformedRecord {
        record: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Transfer incomplete: received {received} of {expected} bytes")]
    TransferIncomplete { expected: usize, received: usize },
    #[error("Payload size mismatch: declared {declared} bytes, arguments serialize to {actual}")]
    PayloadSizeMismatch { declared: usize, actual: usize },
    #[error("Interrupt listener failed: {0}")]
    ListenerFailed(String),
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DebugError>;

/// Client for one debug agent.
///
/// All methods take `&self`; share the client behind an `Arc` to issue
/// commands from several tasks. Commands are serialized on the primary
/// connection, each holding it for its whole command/status/data sequence.
pub struct DebugClient<S = TcpStream> {
    config: ClientConfig,
    channel: AsyncMutex<Option<Channel<S>>>,
    session: Mutex<Session>,
    ext_fw_version: AtomicU16,
}

impl DebugClient<TcpStream> {
    /// Open the primary connection to the configured target
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.channel.lock().await;
        if guard.is_some() {
            log::debug!("Already connected to {}", self.config.target_address());
            return Ok(());
        }
        *guard = Some(connection::open(&self.config).await?);
        Ok(())
    }
}

impl<S> DebugClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a client that is not yet connected
    pub fn new(config: ClientConfig) -> Self {
        DebugClient {
            config,
            channel: AsyncMutex::new(None),
            session: Mutex::new(Session::default()),
            ext_fw_version: AtomicU16::new(0),
        }
    }

    /// Create a client over an already-established transport
    pub fn from_transport(stream: S, config: ClientConfig) -> Self {
        let mut client = Self::new(config);
        let channel = Channel::with_read_timeout(stream, client.config.read_timeout());
        *client.channel.get_mut() = Some(channel);
        client
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// End the session with the agent and drop the connection.
    ///
    /// An attached process is detached first; failures there are logged and
    /// do not prevent the disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        if self.is_attached() {
            if let Err(e) = self.detach().await {
                log::warn!("Detach during disconnect failed: {}", e);
            }
        }

        let channel = self.channel.lock().await.take();
        match channel {
            Some(channel) => {
                log::info!("Disconnecting from {}", self.config.target_address());
                connection::close(channel).await
            }
            None => Ok(()),
        }
    }

    /// Lock the primary connection for one command sequence
    pub(crate) async fn channel(&self) -> Result<MappedMutexGuard<'_, Channel<S>>> {
        let guard = self.channel.lock().await;
        AsyncMutexGuard::try_map(guard, Option::as_mut).map_err(|_| DebugError::NotConnected)
    }

    /// Drop the primary connection without a goodbye (target went away)
    pub(crate) async fn drop_connection(&self) {
        self.channel.lock().await.take();
    }
}
