//! Wire formats for processor-to-memory traffic.
//!
//! All integers travel little-endian. Requests open with a fixed header;
//! the opcode selects the payload layout. Miss replies are discriminated
//! by length: a 4-byte reply is a status code, anything longer is line
//! data. Flush replies are always a 4-byte negated errno (0 on success).

use alloc::vec::Vec;

use crate::config::CACHELINE_SIZE;
use crate::error::{KernelError, KernelResult};

// Request opcodes
pub const P2M_LLC_MISS: u32 = 0x20;
pub const P2M_PCACHE_FLUSH: u32 = 0x21;

/// Status codes carried in 4-byte miss replies. ESIGSEGV has no errno;
/// it is 128 plus the signal number, mirroring shell exit status.
pub const RET_ESRCH: i32 = 3;
pub const RET_ENOMEM: i32 = 12;
pub const RET_EFAULT: i32 = 14;
pub const RET_ESIGSEGV: i32 = 128 + 11;

/// Fixed prefix of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub opcode: u32,
    /// Requesting node.
    pub src_nid: u32,
}

impl MessageHeader {
    pub const WIRE_SIZE: usize = 8;

    pub fn from_bytes(buf: &[u8]) -> KernelResult<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        Ok(MessageHeader {
            opcode: get_u32(buf, 0),
            src_nid: get_u32(buf, 4),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.opcode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.src_nid.to_le_bytes());
        buf
    }
}

/// Cache-miss fault request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlcMissRequest {
    pub pid: u32,
    /// Fault qualifier bits; bit 0 is a write access.
    pub flags: u32,
    pub missing_vaddr: u64,
    /// Byte offset of the requested line within its page.
    pub offset: u64,
}

impl LlcMissRequest {
    pub const WIRE_SIZE: usize = 24;

    pub fn from_bytes(buf: &[u8]) -> KernelResult<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        Ok(LlcMissRequest {
            pid: get_u32(buf, 0),
            flags: get_u32(buf, 4),
            missing_vaddr: get_u64(buf, 8),
            offset: get_u64(buf, 16),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.missing_vaddr.to_le_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }
}

/// Dirty-line writeback request. The line itself rides behind the fixed
/// fields and must be exactly one cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRequest<'a> {
    pub pid: u32,
    pub user_va: u64,
    pub line: &'a [u8],
}

impl<'a> FlushRequest<'a> {
    pub const FIXED_SIZE: usize = 12;
    pub const WIRE_SIZE: usize = Self::FIXED_SIZE + CACHELINE_SIZE as usize;

    pub fn from_bytes(buf: &'a [u8]) -> KernelResult<Self> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        Ok(FlushRequest {
            pid: get_u32(buf, 0),
            user_va: get_u64(buf, 4),
            line: &buf[Self::FIXED_SIZE..],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.extend_from_slice(&self.pid.to_le_bytes());
        buf.extend_from_slice(&self.user_va.to_le_bytes());
        buf.extend_from_slice(self.line);
        buf
    }
}

/// 4-byte status reply, shared by both reply families: miss replies carry
/// the positive codes above, flush replies carry negated errnos.
pub fn status_reply(code: i32) -> [u8; 4] {
    code.to_le_bytes()
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
