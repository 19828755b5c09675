/// Connection management for the debug agent
///
/// This module opens the primary TCP connection to the target and tears it
/// down again.

use tokio::net::TcpStream;

use crate::communication::Channel;
use crate::config::ClientConfig;
use crate::types::Command;
use crate::Result;

/// Open the primary connection described by `config`
pub async fn open(config: &ClientConfig) -> Result<Channel<TcpStream>> {
    let address = config.target_address();
    log::debug!("Connecting to debug agent at {}", address);

    let stream = TcpStream::connect(&address).await?;
    stream.set_nodelay(true)?;

    log::info!("Connected to {} (local {})", address, stream.local_addr()?);

    Ok(Channel::with_read_timeout(stream, config.read_timeout()))
}

/// Tell the target the session is over and close the transport.
///
/// The end command carries no status word; the target simply drops the
/// connection.
pub async fn close<S>(mut channel: Channel<S>) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let sent = channel.send_command(Command::ConsoleEnd, 0, &[]).await;
    if let Err(e) = channel.shutdown().await {
        log::debug!("Transport shutdown after end command failed: {}", e);
    }
    sent
}
