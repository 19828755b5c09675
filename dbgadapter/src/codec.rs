/// Fixed-layout record codec
///
/// Every structure exchanged with the target has a bit-exact packed layout.
/// Each record type gets an explicit encoder/decoder here; all multi-byte
/// fields are little-endian regardless of the host.

use bytes::{Buf, BufMut, BytesMut};

use crate::{DebugError, Result};

/// A record with a fixed wire size
pub trait WireRecord: Sized {
    /// Exact number of bytes on the wire
    const SIZE: usize;
    /// Name used in error reports
    const NAME: &'static str;

    /// Append exactly `SIZE` bytes to `buf`
    fn write_to<B: BufMut>(&self, buf: &mut B);

    /// Consume exactly `SIZE` bytes from `buf`. Callers guarantee the length.
    fn read_from<B: Buf>(buf: &mut B) -> Self;

    fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.write_to(&mut buf);
        debug_assert_eq!(buf.len(), Self::SIZE);
        buf.to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(DebugError::MalformedRecord {
                record: Self::NAME,
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let mut cursor = bytes;
        Ok(Self::read_from(&mut cursor))
    }
}

/// Write `s` into a NUL-padded field of `width` bytes, truncating on a
/// character boundary if needed
pub fn put_fixed_str<B: BufMut>(buf: &mut B, s: &str, width: usize) {
    let mut n = s.len().min(width);
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    buf.put_slice(&s.as_bytes()[..n]);
    buf.put_bytes(0, width - n);
}

/// Read a NUL-padded field of `width` bytes, stopping at the first NUL
pub fn get_fixed_str<B: Buf>(buf: &mut B, width: usize) -> String {
    let mut raw = vec![0u8; width];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn get_array<B: Buf, const N: usize>(buf: &mut B) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

/// General purpose register set (amd64 trap frame layout)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub trapno: u32,
    pub fs: u16,
    pub gs: u16,
    pub err: u32,
    pub es: u16,
    pub ds: u16,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl WireRecord for Registers {
    const SIZE: usize = 0xB0;
    const NAME: &'static str = "registers";

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        for v in [
            self.r15, self.r14, self.r13, self.r12, self.r11, self.r10, self.r9, self.r8,
            self.rdi, self.rsi, self.rbp, self.rbx, self.rdx, self.rcx, self.rax,
        ] {
            buf.put_u64_le(v);
        }
        buf.put_u32_le(self.trapno);
        buf.put_u16_le(self.fs);
        buf.put_u16_le(self.gs);
        buf.put_u32_le(self.err);
        buf.put_u16_le(self.es);
        buf.put_u16_le(self.ds);
        for v in [self.rip, self.cs, self.rflags, self.rsp, self.ss] {
            buf.put_u64_le(v);
        }
    }

    fn read_from<B: Buf>(buf: &mut B) -> Self {
        Registers {
            r15: buf.get_u64_le(),
            r14: buf.get_u64_le(),
            r13: buf.get_u64_le(),
            r12: buf.get_u64_le(),
            r11: buf.get_u64_le(),
            r10: buf.get_u64_le(),
            r9: buf.get_u64_le(),
            r8: buf.get_u64_le(),
            rdi: buf.get_u64_le(),
            rsi: buf.get_u64_le(),
            rbp: buf.get_u64_le(),
            rbx: buf.get_u64_le(),
            rdx: buf.get_u64_le(),
            rcx: buf.get_u64_le(),
            rax: buf.get_u64_le(),
            trapno: buf.get_u32_le(),
            fs: buf.get_u16_le(),
            gs: buf.get_u16_le(),
            err: buf.get_u32_le(),
            es: buf.get_u16_le(),
            ds: buf.get_u16_le(),
            rip: buf.get_u64_le(),
            cs: buf.get_u64_le(),
            rflags: buf.get_u64_le(),
            rsp: buf.get_u64_le(),
            ss: buf.get_u64_le(),
        }
    }
}

/// x87/SSE environment at the head of the FXSAVE area
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmmEnvironment {
    pub control_word: u16,
    pub status_word: u16,
    pub tag_word: u8,
    pub zero: u8,
    pub opcode: u16,
    pub rip: u64,
    pub rdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
}

/// One x87 accumulator slot: 80-bit value plus padding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FpAccumulator {
    pub bytes: [u8; 10],
    pub pad: [u8; 6],
}

/// XSAVE header following the legacy region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XStateHeader {
    pub xstate_bv: u64,
    pub reserved0: [u8; 16],
    pub reserved: [u8; 40],
}

impl Default for XStateHeader {
    fn default() -> Self {
        XStateHeader {
            xstate_bv: 0,
            reserved0: [0; 16],
            reserved: [0; 40],
        }
    }
}

/// Floating point / vector register state (XSAVE area up to YMM high halves)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpRegisters {
    pub env: XmmEnvironment,
    pub acc: [FpAccumulator; 8],
    pub xmm: [[u8; 16]; 16],
    pub pad: [u8; 96],
    pub xstate: XStateHeader,
    pub ymm_high: [[u8; 16]; 16],
}

impl Default for FpRegisters {
    fn default() -> Self {
        FpRegisters {
            env: XmmEnvironment::default(),
            acc: [FpAccumulator::default(); 8],
            xmm: [[0; 16]; 16],
            pad: [0; 96],
            xstate: XStateHeader::default(),
            ymm_high: [[0; 16]; 16],
        }
    }
}

impl WireRecord for FpRegisters {
    const SIZE: usize = 0x340;
    const NAME: &'static str = "fp registers";

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        let env = &self.env;
        buf.put_u16_le(env.control_word);
        buf.put_u16_le(env.status_word);
        buf.put_u8(env.tag_word);
        buf.put_u8(env.zero);
        buf.put_u16_le(env.opcode);
        buf.put_u64_le(env.rip);
        buf.put_u64_le(env.rdp);
        buf.put_u32_le(env.mxcsr);
        buf.put_u32_le(env.mxcsr_mask);
        for acc in &self.acc {
            buf.put_slice(&acc.bytes);
            buf.put_slice(&acc.pad);
        }
        for reg in &self.xmm {
            buf.put_slice(reg);
        }
        buf.put_slice(&self.pad);
        buf.put_u64_le(self.xstate.xstate_bv);
        buf.put_slice(&self.xstate.reserved0);
        buf.put_slice(&self.xstate.reserved);
        for reg in &self.ymm_high {
            buf.put_slice(reg);
        }
    }

    fn read_from<B: Buf>(buf: &mut B) -> Self {
        let env = XmmEnvironment {
            control_word: buf.get_u16_le(),
            status_word: buf.get_u16_le(),
            tag_word: buf.get_u8(),
            zero: buf.get_u8(),
            opcode: buf.get_u16_le(),
            rip: buf.get_u64_le(),
            rdp: buf.get_u64_le(),
            mxcsr: buf.get_u32_le(),
            mxcsr_mask: buf.get_u32_le(),
        };
        let mut acc = [FpAccumulator::default(); 8];
        for slot in acc.iter_mut() {
            slot.bytes = get_array(buf);
            slot.pad = get_array(buf);
        }
        let mut xmm = [[0u8; 16]; 16];
        for reg in xmm.iter_mut() {
            *reg = get_array(buf);
        }
        let pad = get_array(buf);
        let xstate = XStateHeader {
            xstate_bv: buf.get_u64_le(),
            reserved0: get_array(buf),
            reserved: get_array(buf),
        };
        let mut ymm_high = [[0u8; 16]; 16];
        for reg in ymm_high.iter_mut() {
            *reg = get_array(buf);
        }
        FpRegisters {
            env,
            acc,
            xmm,
            pad,
            xstate,
            ymm_high,
        }
    }
}

/// Hardware debug registers DR0..DR15
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugRegisters {
    pub dr: [u64; 16],
}

impl DebugRegisters {
    /// DR7, the debug control register
    pub fn control(&self) -> u64 {
        self.dr[7]
    }

    /// DR6, the debug status register
    pub fn status(&self) -> u64 {
        self.dr[6]
    }
}

impl WireRecord for DebugRegisters {
    const SIZE: usize = 0x80;
    const NAME: &'static str = "debug registers";

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        for v in self.dr {
            buf.put_u64_le(v);
        }
    }

    fn read_from<B: Buf>(buf: &mut B) -> Self {
        let mut dr = [0u64; 16];
        for v in dr.iter_mut() {
            *v = buf.get_u64_le();
        }
        DebugRegisters { dr }
    }
}

/// Per-thread information record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    pub pid: i32,
    pub priority: i32,
    pub name: String,
}

impl ThreadInfo {
    pub const NAME_WIDTH: usize = 32;
}

impl WireRecord for ThreadInfo {
    const SIZE: usize = 40;
    const NAME: &'static str = "thread info";

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.pid);
        buf.put_i32_le(self.priority);
        put_fixed_str(buf, &self.name, Self::NAME_WIDTH);
    }

    fn read_from<B: Buf>(buf: &mut B) -> Self {
        ThreadInfo {
            pid: buf.get_i32_le(),
            priority: buf.get_i32_le(),
            name: get_fixed_str(buf, Self::NAME_WIDTH),
        }
    }
}

/// Notification pushed by the target when a thread traps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptEvent {
    pub lwpid: u32,
    pub status: u32,
    pub thread_name: String,
    pub registers: Registers,
    pub fp_registers: FpRegisters,
    pub debug_registers: DebugRegisters,
}

impl InterruptEvent {
    pub const THREAD_NAME_WIDTH: usize = 40;
}

impl WireRecord for InterruptEvent {
    const SIZE: usize = 0x4A0;
    const NAME: &'static str = "interrupt";

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.lwpid);
        buf.put_u32_le(self.status);
        put_fixed_str(buf, &self.thread_name, Self::THREAD_NAME_WIDTH);
        self.registers.write_to(buf);
        self.fp_registers.write_to(buf);
        self.debug_registers.write_to(buf);
    }

    fn read_from<B: Buf>(buf: &mut B) -> Self {
        InterruptEvent {
            lwpid: buf.get_u32_le(),
            status: buf.get_u32_le(),
            thread_name: get_fixed_str(buf, Self::THREAD_NAME_WIDTH),
            registers: Registers::read_from(buf),
            fp_registers: FpRegisters::read_from(buf),
            debug_registers: DebugRegisters::read_from(buf),
        }
    }
}
