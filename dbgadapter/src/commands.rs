/// Console, kernel and version commands
///
/// Single round-trip commands that need a connection but no attached
/// process.

use std::sync::atomic::Ordering;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::communication::Arg;
use crate::types::*;
use crate::{DebugClient, Result};

impl<S> DebugClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Version string reported by the debug agent
    pub async fn debugger_version(&self) -> Result<String> {
        let mut channel = self.channel().await?;
        channel.send_command(Command::Version, 0, &[]).await?;

        let length = channel.receive_u32().await? as usize;
        let raw = channel.receive_data(length).await?;
        let version = String::from_utf8_lossy(&raw);
        Ok(version.trim_end_matches('\0').to_string())
    }

    /// Version of the extended firmware, or 0 when it is absent or the query
    /// fails for any reason. A non-zero answer is cached.
    pub async fn ext_fw_version(&self) -> u16 {
        let cached = self.ext_fw_version.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }

        match self.query_ext_fw_version().await {
            Ok(version) => {
                log::info!("Extended firmware version: {}", version);
                self.ext_fw_version.store(version, Ordering::Relaxed);
                version
            }
            Err(e) => {
                log::warn!("Extended firmware version query failed: {}", e);
                0
            }
        }
    }

    async fn query_ext_fw_version(&self) -> Result<u16> {
        let mut channel = self.channel().await?;
        channel.send_command(Command::ExtFwVersion, 0, &[]).await?;

        let mut scoped = channel.override_read_timeout(Some(self.config.ext_fw_timeout()));
        let raw = scoped.receive_data(2).await?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    /// Reboot the target. The agent does not answer; the connection is
    /// considered gone afterwards.
    pub async fn reboot(&self) -> Result<()> {
        {
            let mut channel = self.channel().await?;
            channel.send_command(Command::ConsoleReboot, 0, &[]).await?;
        }

        let listener = self.session().reset();
        if let Some(listener) = listener {
            if let Err(e) = listener.stop().await {
                log::debug!("Interrupt listener teardown on reboot: {}", e);
            }
        }
        self.drop_connection().await;

        log::info!("Target rebooting, connection dropped");
        Ok(())
    }

    /// Print a line on the target's serial console
    pub async fn print(&self, text: &str) -> Result<()> {
        let raw = nul_terminated(text);

        let mut channel = self.channel().await?;
        channel
            .send_command(Command::ConsolePrint, CONSOLE_PRINT_PACKET_SIZE, &[Arg::U32(raw.len() as u32)])
            .await?;
        channel.send_data(&raw, raw.len()).await?;
        channel.check_status().await
    }

    /// Show an on-screen notification of the given kind
    pub async fn notify(&self, kind: i32, text: &str) -> Result<()> {
        let raw = nul_terminated(text);

        let mut channel = self.channel().await?;
        channel
            .send_command(
                Command::ConsoleNotify,
                CONSOLE_NOTIFY_PACKET_SIZE,
                &[Arg::I32(kind), Arg::U32(raw.len() as u32)],
            )
            .await?;
        channel.send_data(&raw, raw.len()).await?;
        channel.check_status().await
    }

    pub async fn console_info(&self) -> Result<()> {
        let mut channel = self.channel().await?;
        channel.exchange(Command::ConsoleInfo, 0, &[]).await
    }

    /// Base address of the target kernel
    pub async fn kernel_base(&self) -> Result<u64> {
        let mut channel = self.channel().await?;
        channel.exchange(Command::KernelBase, 0, &[]).await?;
        channel.receive_u64().await
    }

    pub async fn kernel_read(&self, address: u64, length: u32) -> Result<Vec<u8>> {
        let mut channel = self.channel().await?;
        channel
            .exchange(
                Command::KernelRead,
                KERNEL_RW_PACKET_SIZE,
                &[Arg::U64(address), Arg::U32(length)],
            )
            .await?;
        channel.receive_data(length as usize).await
    }

    pub async fn kernel_write(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut channel = self.channel().await?;
        channel
            .exchange(
                Command::KernelWrite,
                KERNEL_RW_PACKET_SIZE,
                &[Arg::U64(address), Arg::U32(data.len() as u32)],
            )
            .await?;
        channel.send_data(data, data.len()).await?;
        channel.check_status().await
    }
}

/// Text as sent to the console: bytes plus a terminating NUL
fn nul_terminated(text: &str) -> Vec<u8> {
    let mut raw = Vec::with_capacity(text.len() + 1);
    raw.extend_from_slice(text.as_bytes());
    raw.push(0);
    raw
}
