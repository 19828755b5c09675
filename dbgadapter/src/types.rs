/// Protocol constants and enumerations
///
/// This module defines the opcode registry, status words and the small
/// enumerations carried inside command payloads.

use std::fmt;

/// Magic word leading every command header
pub const PACKET_MAGIC: u32 = 0xFFAA_BBCC;

/// Size of the command header: magic, command id, payload length
pub const COMMAND_HEADER_SIZE: usize = 12;

/// Size of a status word
pub const STATUS_SIZE: usize = 4;

/// Largest span written to the transport in one bulk chunk
pub const MAX_CHUNK_SIZE: usize = 0x4000;

/// Default TCP port of the debug agent
pub const DEFAULT_PORT: u16 = 744;

/// Default TCP port the interrupt listener binds
pub const DEFAULT_DEBUG_PORT: u16 = 755;

pub const MAX_BREAKPOINTS: u32 = 10;
pub const MAX_WATCHPOINTS: u32 = 4;

// Payload sizes for each command shape
pub const ATTACH_PACKET_SIZE: usize = 4;
pub const BREAKPOINT_PACKET_SIZE: usize = 16;
pub const WATCHPOINT_PACKET_SIZE: usize = 24;
pub const THREAD_PACKET_SIZE: usize = 4;
pub const SET_REGISTERS_PACKET_SIZE: usize = 8;
pub const STOPGO_PACKET_SIZE: usize = 4;
pub const EXT_STOPGO_PACKET_SIZE: usize = 5;
pub const KERNEL_RW_PACKET_SIZE: usize = 12;
pub const CONSOLE_PRINT_PACKET_SIZE: usize = 4;
pub const CONSOLE_NOTIFY_PACKET_SIZE: usize = 8;

/// Command opcodes understood by the debug agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Version = 0xBD00_0001,
    ExtFwVersion = 0xBD00_0500,

    DebugAttach = 0xBDBB_0001,
    DebugDetach = 0xBDBB_0002,
    DebugBreakpoint = 0xBDBB_0003,
    DebugWatchpoint = 0xBDBB_0004,
    DebugThreads = 0xBDBB_0005,
    DebugStopThread = 0xBDBB_0006,
    DebugResumeThread = 0xBDBB_0007,
    DebugGetRegisters = 0xBDBB_0008,
    DebugSetRegisters = 0xBDBB_0009,
    DebugGetFpRegisters = 0xBDBB_000A,
    DebugSetFpRegisters = 0xBDBB_000B,
    DebugGetDebugRegisters = 0xBDBB_000C,
    DebugSetDebugRegisters = 0xBDBB_000D,
    DebugStopGo = 0xBDBB_0010,
    DebugThreadInfo = 0xBDBB_0011,
    DebugSingleStep = 0xBDBB_0012,
    DebugExtStopGo = 0xBDBB_0500,

    KernelBase = 0xBDCC_0001,
    KernelRead = 0xBDCC_0002,
    KernelWrite = 0xBDCC_0003,

    ConsoleReboot = 0xBDDD_0001,
    ConsoleEnd = 0xBDDD_0002,
    ConsolePrint = 0xBDDD_0003,
    ConsoleNotify = 0xBDDD_0004,
    ConsoleInfo = 0xBDDD_0005,
}

impl Command {
    /// Opcode as sent on the wire
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:08X})", self, self.code())
    }
}

/// Status word returned by the target after a command or data phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
    TooMuchData,
    DataNull,
    AlreadyDebugging,
    InvalidIndex,
    Unknown(u32),
}

impl Status {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x8000_0000 => Status::Success,
            0xF000_0001 => Status::Error,
            0xF000_0002 => Status::TooMuchData,
            0xF000_0003 => Status::DataNull,
            0xF000_0004 => Status::AlreadyDebugging,
            0xF000_0005 => Status::InvalidIndex,
            other => Status::Unknown(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Status::Success => 0x8000_0000,
            Status::Error => 0xF000_0001,
            Status::TooMuchData => 0xF000_0002,
            Status::DataNull => 0xF000_0003,
            Status::AlreadyDebugging => 0xF000_0004,
            Status::InvalidIndex => 0xF000_0005,
            Status::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Success => "success",
            Status::Error => "error",
            Status::TooMuchData => "too much data",
            Status::DataNull => "data null",
            Status::AlreadyDebugging => "already debugging",
            Status::InvalidIndex => "invalid index",
            Status::Unknown(_) => "unknown status",
        };
        write!(f, "{} (0x{:08X})", name, self.code())
    }
}

/// Sub-code of the stop/go command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessSignal {
    Resume = 0,
    Stop = 1,
    Kill = 2,
}

/// Watchpoint span; the discriminants are the DR7 length encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WatchLength {
    Byte1 = 0x00,
    Byte2 = 0x01,
    Byte4 = 0x03,
    Byte8 = 0x02,
}

impl WatchLength {
    /// Map a byte count onto the encoding, if it is one of 1, 2, 4 or 8
    pub fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            1 => Some(WatchLength::Byte1),
            2 => Some(WatchLength::Byte2),
            4 => Some(WatchLength::Byte4),
            8 => Some(WatchLength::Byte8),
            _ => None,
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            WatchLength::Byte1 => 1,
            WatchLength::Byte2 => 2,
            WatchLength::Byte4 => 4,
            WatchLength::Byte8 => 8,
        }
    }
}

/// Access that triggers a watchpoint (DR7 R/W encodings)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BreakType {
    Execute = 0x00,
    Write = 0x01,
    ReadWrite = 0x03,
}

/// Lifecycle of a debug session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Detached,
    Attaching,
    Attached,
    Detaching,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Detached => "detached",
            SessionState::Attaching => "attaching",
            SessionState::Attached => "attached",
            SessionState::Detaching => "detaching",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert!(Status::from_code(0x8000_0000).is_success());
        assert_eq!(Status::from_code(0xF000_0005), Status::InvalidIndex);
        assert_eq!(Status::from_code(0x1234), Status::Unknown(0x1234));
        assert_eq!(Status::Unknown(0x1234).code(), 0x1234);
    }

    #[test]
    fn test_watch_length_encoding() {
        assert_eq!(WatchLength::from_bytes(8), Some(WatchLength::Byte8));
        assert_eq!(WatchLength::Byte8 as u32, 0x02);
        assert_eq!(WatchLength::Byte4 as u32, 0x03);
        assert_eq!(WatchLength::from_bytes(3), None);
        assert_eq!(WatchLength::Byte2.bytes(), 2);
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::DebugAttach.to_string(), "DebugAttach(0xBDBB0001)");
    }
}
