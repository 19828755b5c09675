/// Debug session control
///
/// Attach/detach lifecycle plus the process, thread, register, breakpoint and
/// watchpoint commands that require an attached process.

use std::net::SocketAddr;
use std::sync::{Arc, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, MappedMutexGuard};

use crate::codec::{DebugRegisters, FpRegisters, InterruptEvent, Registers, ThreadInfo, WireRecord};
use crate::communication::{Arg, Channel};
use crate::events::{channel_handler, InterruptHandler, InterruptListener};
use crate::types::*;
use crate::{DebugClient, DebugError, Result};

/// Mutable state of the (single) debug session
#[derive(Default)]
pub(crate) struct Session {
    state: SessionState,
    pid: Option<i32>,
    listener: Option<InterruptListener>,
}

impl Session {
    /// Force the session back to detached, handing back any live listener
    pub(crate) fn reset(&mut self) -> Option<InterruptListener> {
        self.state = SessionState::Detached;
        self.pid = None;
        self.listener.take()
    }
}

impl<S> DebugClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_state(&self) -> SessionState {
        self.session().state
    }

    pub fn is_attached(&self) -> bool {
        self.session_state() == SessionState::Attached
    }

    /// Process id of the attached process
    pub fn attached_pid(&self) -> Option<i32> {
        self.session().pid
    }

    /// Whether the interrupt listener of the current session is still polling
    pub fn is_listening(&self) -> bool {
        self.session()
            .listener
            .as_ref()
            .map_or(false, InterruptListener::is_running)
    }

    /// Local address of the interrupt listener while a session is active
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.session()
            .listener
            .as_ref()
            .map(InterruptListener::local_addr)
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(DebugError::NotAttached)
        }
    }

    /// Lock the connection for a command that needs an attached process
    async fn attached_channel(&self) -> Result<MappedMutexGuard<'_, Channel<S>>> {
        let channel = self.channel().await?;
        self.ensure_attached()?;
        Ok(channel)
    }

    /// Attach to `pid`, delivering trap notifications to `handler`.
    ///
    /// The interrupt listener is bound and accepting before the attach
    /// command goes out, so an immediate trap cannot be lost.
    pub async fn attach(&self, pid: i32, handler: Arc<dyn InterruptHandler>) -> Result<()> {
        if !self.is_connected().await {
            return Err(DebugError::NotConnected);
        }

        {
            let mut session = self.session();
            if session.state != SessionState::Detached {
                return Err(DebugError::AlreadyAttached);
            }
            session.state = SessionState::Attaching;
        }

        log::debug!("Attaching to pid {}", pid);

        let listener = match InterruptListener::start(
            self.config.listener_address(),
            self.config.poll_interval(),
            handler,
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                self.session().reset();
                return Err(e);
            }
        };

        let attached = match self.channel().await {
            Ok(mut channel) => {
                channel
                    .exchange(Command::DebugAttach, ATTACH_PACKET_SIZE, &[Arg::I32(pid)])
                    .await
            }
            Err(e) => Err(e),
        };

        match attached {
            Ok(()) => {
                let mut session = self.session();
                session.state = SessionState::Attached;
                session.pid = Some(pid);
                session.listener = Some(listener);
                log::info!("Attached to pid {}", pid);
                Ok(())
            }
            Err(e) => {
                if let Err(stop_err) = listener.stop().await {
                    log::warn!("Interrupt listener teardown after failed attach: {}", stop_err);
                }
                self.session().reset();
                Err(e)
            }
        }
    }

    /// Attach to `pid` and receive trap notifications through a channel
    pub async fn attach_with_channel(&self, pid: i32) -> Result<mpsc::UnboundedReceiver<InterruptEvent>> {
        let (handler, receiver) = channel_handler();
        self.attach(pid, handler).await?;
        Ok(receiver)
    }

    /// Detach from the current process.
    ///
    /// The target is told first so it stops sending interrupts, then the
    /// listener is shut down. The session ends up detached even if either
    /// step fails; the first failure is returned.
    pub async fn detach(&self) -> Result<()> {
        let mut channel = self.channel().await?;

        let listener = {
            let mut session = self.session();
            if session.state != SessionState::Attached {
                return Err(DebugError::NotAttached);
            }
            session.state = SessionState::Detaching;
            session.listener.take()
        };

        let detached = channel.exchange(Command::DebugDetach, 0, &[]).await;
        drop(channel);

        let stopped = match listener {
            Some(listener) => listener.stop().await,
            None => Ok(()),
        };

        let pid = {
            let mut session = self.session();
            let pid = session.pid;
            session.reset();
            pid
        };

        match (&detached, &stopped) {
            (Ok(()), Ok(())) => log::info!("Detached from pid {:?}", pid),
            (Err(e), _) => log::warn!("Detach command failed: {}", e),
            (_, Err(e)) => log::warn!("Interrupt listener teardown failed: {}", e),
        }

        detached.and(stopped)
    }

    pub async fn process_stop(&self) -> Result<()> {
        self.process_signal(ProcessSignal::Stop).await
    }

    pub async fn process_resume(&self) -> Result<()> {
        self.process_signal(ProcessSignal::Resume).await
    }

    /// Kill the attached process
    pub async fn process_kill(&self) -> Result<()> {
        self.process_signal(ProcessSignal::Kill).await
    }

    async fn process_signal(&self, signal: ProcessSignal) -> Result<()> {
        let mut channel = self.attached_channel().await?;
        channel
            .exchange(Command::DebugStopGo, STOPGO_PACKET_SIZE, &[Arg::I32(signal as i32)])
            .await
    }

    /// Stop an arbitrary process (extended firmware only, best effort)
    pub async fn process_ext_stop(&self, pid: u32) {
        self.process_ext_signal(pid, ProcessSignal::Stop).await
    }

    /// Resume an arbitrary process (extended firmware only, best effort)
    pub async fn process_ext_resume(&self, pid: u32) {
        self.process_ext_signal(pid, ProcessSignal::Resume).await
    }

    /// Kill an arbitrary process (extended firmware only, best effort)
    pub async fn process_ext_kill(&self, pid: u32) {
        self.process_ext_signal(pid, ProcessSignal::Kill).await
    }

    async fn process_ext_signal(&self, pid: u32, signal: ProcessSignal) {
        let result = match self.channel().await {
            Ok(mut channel) => {
                channel
                    .exchange(
                        Command::DebugExtStopGo,
                        EXT_STOPGO_PACKET_SIZE,
                        &[Arg::U32(pid), Arg::U8(signal as u8)],
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            log::warn!("Extended {:?} of pid {} failed: {}", signal, pid, e);
        }
    }

    /// Program a hardware breakpoint slot. Disabling a slot removes it; the
    /// address is still transmitted but ignored by the target.
    pub async fn set_breakpoint(&self, index: u32, enabled: bool, address: u64) -> Result<()> {
        let mut channel = self.attached_channel().await?;

        if index >= MAX_BREAKPOINTS {
            return Err(DebugError::IndexOutOfRange {
                kind: "breakpoint",
                index,
                max: MAX_BREAKPOINTS,
            });
        }

        log::debug!("Breakpoint {} enabled={} at 0x{:X}", index, enabled, address);

        channel
            .exchange(
                Command::DebugBreakpoint,
                BREAKPOINT_PACKET_SIZE,
                &[Arg::I32(index as i32), Arg::I32(enabled as i32), Arg::U64(address)],
            )
            .await
    }

    /// Program a hardware watchpoint slot
    pub async fn set_watchpoint(
        &self,
        index: u32,
        enabled: bool,
        length: WatchLength,
        break_type: BreakType,
        address: u64,
    ) -> Result<()> {
        let mut channel = self.attached_channel().await?;

        if index >= MAX_WATCHPOINTS {
            return Err(DebugError::IndexOutOfRange {
                kind: "watchpoint",
                index,
                max: MAX_WATCHPOINTS,
            });
        }

        log::debug!(
            "Watchpoint {} enabled={} {:?}/{:?} at 0x{:X}",
            index,
            enabled,
            length,
            break_type,
            address
        );

        channel
            .exchange(
                Command::DebugWatchpoint,
                WATCHPOINT_PACKET_SIZE,
                &[
                    Arg::I32(index as i32),
                    Arg::I32(enabled as i32),
                    Arg::U32(length as u32),
                    Arg::U32(break_type as u32),
                    Arg::U64(address),
                ],
            )
            .await
    }

    /// Thread ids (lwpids) of the attached process, in target order
    pub async fn list_threads(&self) -> Result<Vec<u32>> {
        let mut channel = self.attached_channel().await?;
        channel.exchange(Command::DebugThreads, 0, &[]).await?;

        let count = channel.receive_u32().await? as usize;
        let raw = channel.receive_data(count * 4).await?;

        Ok(raw
            .chunks_exact(4)
            .map(|id| u32::from_le_bytes([id[0], id[1], id[2], id[3]]))
            .collect())
    }

    pub async fn thread_info(&self, lwpid: u32) -> Result<ThreadInfo> {
        self.get_record(Command::DebugThreadInfo, lwpid).await
    }

    pub async fn stop_thread(&self, lwpid: u32) -> Result<()> {
        let mut channel = self.attached_channel().await?;
        channel
            .exchange(Command::DebugStopThread, THREAD_PACKET_SIZE, &[Arg::U32(lwpid)])
            .await
    }

    pub async fn resume_thread(&self, lwpid: u32) -> Result<()> {
        let mut channel = self.attached_channel().await?;
        channel
            .exchange(Command::DebugResumeThread, THREAD_PACKET_SIZE, &[Arg::U32(lwpid)])
            .await
    }

    pub async fn get_registers(&self, lwpid: u32) -> Result<Registers> {
        self.get_record(Command::DebugGetRegisters, lwpid).await
    }

    pub async fn set_registers(&self, lwpid: u32, registers: &Registers) -> Result<()> {
        self.set_record(Command::DebugSetRegisters, lwpid, registers).await
    }

    pub async fn get_fp_registers(&self, lwpid: u32) -> Result<FpRegisters> {
        self.get_record(Command::DebugGetFpRegisters, lwpid).await
    }

    pub async fn set_fp_registers(&self, lwpid: u32, registers: &FpRegisters) -> Result<()> {
        self.set_record(Command::DebugSetFpRegisters, lwpid, registers).await
    }

    pub async fn get_debug_registers(&self, lwpid: u32) -> Result<DebugRegisters> {
        self.get_record(Command::DebugGetDebugRegisters, lwpid).await
    }

    pub async fn set_debug_registers(&self, lwpid: u32, registers: &DebugRegisters) -> Result<()> {
        self.set_record(Command::DebugSetDebugRegisters, lwpid, registers).await
    }

    /// Execute a single instruction in the attached process
    pub async fn single_step(&self) -> Result<()> {
        let mut channel = self.attached_channel().await?;
        channel.exchange(Command::DebugSingleStep, 0, &[]).await
    }

    async fn get_record<R: WireRecord>(&self, command: Command, lwpid: u32) -> Result<R> {
        let mut channel = self.attached_channel().await?;
        channel
            .exchange(command, THREAD_PACKET_SIZE, &[Arg::U32(lwpid)])
            .await?;
        channel.receive_record().await
    }

    async fn set_record<R: WireRecord>(&self, command: Command, lwpid: u32, record: &R) -> Result<()> {
        let mut channel = self.attached_channel().await?;
        channel
            .exchange(
                command,
                SET_REGISTERS_PACKET_SIZE,
                &[Arg::U32(lwpid), Arg::U32(R::SIZE as u32)],
            )
            .await?;
        channel.send_record(record).await?;
        channel.check_status().await
    }
}
