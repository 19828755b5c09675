/// Interrupt listener and event delivery
///
/// While a process is attached the target dials back to a local listening
/// socket and pushes one fixed-size record per trap. This module owns that
/// socket, decodes the records and hands them to an [`InterruptHandler`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{InterruptEvent, WireRecord};
use crate::{DebugError, Result};

/// Receiver of trap notifications.
///
/// Called from the listener task, possibly while a command is in flight on
/// the primary connection.
pub trait InterruptHandler: Send + Sync {
    fn on_interrupt(&self, event: InterruptEvent);
}

impl<F> InterruptHandler for F
where
    F: Fn(InterruptEvent) + Send + Sync,
{
    fn on_interrupt(&self, event: InterruptEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded channel
struct ChannelSink {
    sender: mpsc::UnboundedSender<InterruptEvent>,
}

impl InterruptHandler for ChannelSink {
    fn on_interrupt(&self, event: InterruptEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("Interrupt receiver dropped, event discarded");
        }
    }
}

/// Build a handler that publishes every event, in order, to the returned receiver
pub fn channel_handler() -> (Arc<dyn InterruptHandler>, mpsc::UnboundedReceiver<InterruptEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink { sender }), receiver)
}

/// Listening socket plus the task polling the accepted connection
pub struct InterruptListener {
    local_addr: SocketAddr,
    running: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl InterruptListener {
    /// Bind and start listening. The socket is accepting connections by the
    /// time this returns.
    pub async fn start(
        address: SocketAddr,
        poll_interval: Duration,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<Self> {
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(address)?;
        let listener = socket.listen(1)?;
        let local_addr = listener.local_addr()?;

        log::debug!("Interrupt listener bound on {}", local_addr);

        let running = CancellationToken::new();
        let task = tokio::spawn(listen(listener, poll_interval, handler, running.clone()));

        Ok(Self {
            local_addr,
            running,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.running.is_cancelled() && !self.task.is_finished()
    }

    /// Ask the loop to stop and wait for the socket to close. Takes at most
    /// one poll interval unless a record is being read.
    pub async fn stop(mut self) -> Result<()> {
        self.running.cancel();
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(DebugError::ListenerFailed(e.to_string())),
        }
    }
}

impl Drop for InterruptListener {
    fn drop(&mut self) {
        self.running.cancel();
    }
}

async fn listen(
    listener: TcpListener,
    poll_interval: Duration,
    handler: Arc<dyn InterruptHandler>,
    running: CancellationToken,
) -> Result<()> {
    log::debug!("Interrupt listener started");

    let (stream, peer) = tokio::select! {
        _ = running.cancelled() => {
            log::debug!("Interrupt listener stopped before the target connected");
            return Ok(());
        }
        accepted = listener.accept() => accepted?,
    };
    // Only one connection per session
    drop(listener);

    stream.set_nodelay(true)?;
    log::info!("Target connected to interrupt listener from {}", peer);

    let result = poll_records(stream, poll_interval, handler.as_ref(), &running).await;
    if let Err(ref e) = result {
        log::error!("Interrupt listener failed: {}", e);
    }
    log::debug!("Interrupt listener finished");
    result
}

async fn poll_records(
    mut stream: TcpStream,
    poll_interval: Duration,
    handler: &dyn InterruptHandler,
    running: &CancellationToken,
) -> Result<()> {
    let mut record = vec![0u8; InterruptEvent::SIZE];

    while !running.is_cancelled() {
        let available = tokio::select! {
            _ = running.cancelled() => break,
            peeked = stream.peek(&mut record) => peeked?,
        };

        if available == 0 {
            log::debug!("Target closed the interrupt connection");
            break;
        }

        // More than one record queued is drained one record per pass; leaving
        // it unread would stall the connection for good.
        if available < InterruptEvent::SIZE {
            // Leave the partial record queued until the rest arrives
            tokio::select! {
                _ = running.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => continue,
            }
        }

        stream.read_exact(&mut record).await?;
        match InterruptEvent::decode(&record) {
            Ok(event) => {
                log::debug!(
                    "INTERRUPT: lwpid={} status=0x{:X} thread={:?} rip=0x{:X}",
                    event.lwpid,
                    event.status,
                    event.thread_name,
                    event.registers.rip
                );
                handler.on_interrupt(event);
            }
            Err(e) => log::error!("Dropping undecodable interrupt record: {}", e),
        }
    }

    Ok(())
}
