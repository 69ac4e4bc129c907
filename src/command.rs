//! NVMe command structures: submission and completion queue entries
//!
//! This module handles the 64-byte Submission Queue Entry and 16-byte
//! Completion Queue Entry layouts from the NVMe base specification, the
//! fabrics repurposing of those layouts from the NVMe-oF specification,
//! and builders for every command this client issues.

// Command builders take many parameters per the NVMe specification
#![allow(clippy::too_many_arguments)]

use crate::error::{NvmeError, NvmeResult};
use byteorder::{ByteOrder, LittleEndian};

/// Submission Queue Entry size in bytes
pub const SQE_SIZE: usize = 64;

/// Completion Queue Entry size in bytes
pub const CQE_SIZE: usize = 16;

/// Fabric Connect data block size in bytes
pub const CONNECT_DATA_SIZE: usize = 1024;

/// NQN wire field size: 223 usable bytes, NUL-padded to 256
pub const NQN_FIELD_SIZE: usize = 256;
pub const NQN_MAX_LEN: usize = 223;

/// Admin command opcodes (NVMe base spec Figure "Opcodes for Admin Commands")
pub mod admin_opcode {
    pub const GET_LOG_PAGE: u8 = 0x02;
    pub const IDENTIFY: u8 = 0x06;
    pub const SET_FEATURES: u8 = 0x09;
    pub const GET_FEATURES: u8 = 0x0A;
    pub const ASYNC_EVENT_REQUEST: u8 = 0x0C;
    pub const KEEP_ALIVE: u8 = 0x18;
    pub const FABRICS: u8 = 0x7F;
}

/// NVM I/O command opcodes
pub mod nvm_opcode {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_ZEROES: u8 = 0x08;
    pub const DATASET_MANAGEMENT: u8 = 0x09;
    pub const RESERVATION_REGISTER: u8 = 0x0D;
    pub const RESERVATION_REPORT: u8 = 0x0E;
    pub const RESERVATION_ACQUIRE: u8 = 0x11;
    pub const RESERVATION_RELEASE: u8 = 0x15;
}

/// Fabrics command types (byte 4 of a fabrics SQE)
pub mod fabrics_type {
    pub const PROPERTY_SET: u8 = 0x00;
    pub const CONNECT: u8 = 0x01;
    pub const PROPERTY_GET: u8 = 0x04;
}

/// Identify CNS values
pub mod cns {
    pub const NAMESPACE: u8 = 0x00;
    pub const CONTROLLER: u8 = 0x01;
    pub const ACTIVE_NAMESPACE_LIST: u8 = 0x02;
}

/// Feature identifiers used by this client
pub mod feature_id {
    pub const NUMBER_OF_QUEUES: u8 = 0x07;
    pub const ASYNC_EVENT_CONFIG: u8 = 0x0B;
    pub const HOST_IDENTIFIER: u8 = 0x81;
    pub const RESERVATION_PERSISTENCE: u8 = 0x83;
}

/// Controller property offsets (fabrics register space)
pub mod property {
    pub const CAP: u32 = 0x00; // 8 bytes
    pub const VS: u32 = 0x08; // 4 bytes
    pub const CC: u32 = 0x14; // 4 bytes
    pub const CSTS: u32 = 0x1C; // 4 bytes
    pub const NSSR: u32 = 0x20; // 4 bytes
}

/// Submission Queue Entry - 64 bytes, little-endian
///
/// ```text
/// Bytes  0       opcode
///        1       flags (PSDT in bits 7:6, FUSE in bits 1:0)
///        2-3     command identifier
///        4-7     NSID (fabrics: FCTYPE in byte 4)
///        8-15    CDW2/CDW3
///        16-23   metadata pointer
///        24-39   data pointer (SGL entry 1)
///        40-63   CDW10..CDW15
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub dptr: [u8; 16],
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

/// PSDT 01b: SGLs are used for the data transfer
const FLAG_SGL_METADATA_POINTER: u8 = 0x40;

impl Default for Sqe {
    fn default() -> Self {
        Sqe {
            opcode: 0,
            flags: FLAG_SGL_METADATA_POINTER,
            cid: 0,
            nsid: 0,
            cdw2: 0,
            cdw3: 0,
            mptr: 0,
            dptr: [0u8; 16],
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }
}

impl Sqe {
    /// Serialize to the 64-byte wire layout
    pub fn to_bytes(&self) -> [u8; SQE_SIZE] {
        let mut buf = [0u8; SQE_SIZE];
        buf[0] = self.opcode;
        buf[1] = self.flags;
        LittleEndian::write_u16(&mut buf[2..4], self.cid);
        LittleEndian::write_u32(&mut buf[4..8], self.nsid);
        LittleEndian::write_u32(&mut buf[8..12], self.cdw2);
        LittleEndian::write_u32(&mut buf[12..16], self.cdw3);
        LittleEndian::write_u64(&mut buf[16..24], self.mptr);
        buf[24..40].copy_from_slice(&self.dptr);
        LittleEndian::write_u32(&mut buf[40..44], self.cdw10);
        LittleEndian::write_u32(&mut buf[44..48], self.cdw11);
        LittleEndian::write_u32(&mut buf[48..52], self.cdw12);
        LittleEndian::write_u32(&mut buf[52..56], self.cdw13);
        LittleEndian::write_u32(&mut buf[56..60], self.cdw14);
        LittleEndian::write_u32(&mut buf[60..64], self.cdw15);
        buf
    }

    /// Parse from the 64-byte wire layout
    pub fn from_bytes(buf: &[u8]) -> NvmeResult<Self> {
        if buf.len() < SQE_SIZE {
            return Err(NvmeError::Protocol(format!(
                "SQE too short: {} bytes, need {}",
                buf.len(),
                SQE_SIZE
            )));
        }
        let mut dptr = [0u8; 16];
        dptr.copy_from_slice(&buf[24..40]);
        Ok(Sqe {
            opcode: buf[0],
            flags: buf[1],
            cid: LittleEndian::read_u16(&buf[2..4]),
            nsid: LittleEndian::read_u32(&buf[4..8]),
            cdw2: LittleEndian::read_u32(&buf[8..12]),
            cdw3: LittleEndian::read_u32(&buf[12..16]),
            mptr: LittleEndian::read_u64(&buf[16..24]),
            dptr,
            cdw10: LittleEndian::read_u32(&buf[40..44]),
            cdw11: LittleEndian::read_u32(&buf[44..48]),
            cdw12: LittleEndian::read_u32(&buf[48..52]),
            cdw13: LittleEndian::read_u32(&buf[52..56]),
            cdw14: LittleEndian::read_u32(&buf[56..60]),
            cdw15: LittleEndian::read_u32(&buf[60..64]),
        })
    }

    /// Fabrics command type, meaningful when `opcode` is 0x7F
    pub fn fctype(&self) -> u8 {
        (self.nsid & 0xFF) as u8
    }
}

/// Completion Queue Entry - 16 bytes, little-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cqe {
    /// Command-specific result
    pub dw0: u32,
    /// Reserved (fabrics: high half of 8-byte property values)
    pub dw1: u32,
    /// Submission queue head pointer
    pub sqhd: u16,
    /// Submission queue identifier
    pub sqid: u16,
    /// Command identifier
    pub cid: u16,
    /// Phase tag (bit 0) and status field (bits 15:1)
    pub status: u16,
}

impl Cqe {
    pub fn to_bytes(&self) -> [u8; CQE_SIZE] {
        let mut buf = [0u8; CQE_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.dw0);
        LittleEndian::write_u32(&mut buf[4..8], self.dw1);
        LittleEndian::write_u16(&mut buf[8..10], self.sqhd);
        LittleEndian::write_u16(&mut buf[10..12], self.sqid);
        LittleEndian::write_u16(&mut buf[12..14], self.cid);
        LittleEndian::write_u16(&mut buf[14..16], self.status);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> NvmeResult<Self> {
        if buf.len() < CQE_SIZE {
            return Err(NvmeError::Protocol(format!(
                "CQE too short: {} bytes, need {}",
                buf.len(),
                CQE_SIZE
            )));
        }
        Ok(Cqe {
            dw0: LittleEndian::read_u32(&buf[0..4]),
            dw1: LittleEndian::read_u32(&buf[4..8]),
            sqhd: LittleEndian::read_u16(&buf[8..10]),
            sqid: LittleEndian::read_u16(&buf[10..12]),
            cid: LittleEndian::read_u16(&buf[12..14]),
            status: LittleEndian::read_u16(&buf[14..16]),
        })
    }

    /// Phase tag (bit 0)
    pub fn phase(&self) -> bool {
        self.status & 0x0001 != 0
    }

    /// The full 15-bit status field (bits 15:1)
    pub fn status_field(&self) -> u16 {
        self.status >> 1
    }

    /// Status Code (bits 8:1)
    pub fn sc(&self) -> u8 {
        ((self.status >> 1) & 0xFF) as u8
    }

    /// Status Code Type (bits 11:9)
    pub fn sct(&self) -> u8 {
        ((self.status >> 9) & 0x07) as u8
    }

    /// Do Not Retry (bit 15)
    pub fn dnr(&self) -> bool {
        self.status & 0x8000 != 0
    }

    /// More (bit 14)
    pub fn more(&self) -> bool {
        self.status & 0x4000 != 0
    }

    pub fn is_error(&self) -> bool {
        self.status_field() != 0
    }

    /// Combined 8-byte value for a Property Get response
    pub fn property_value(&self) -> u64 {
        (self.dw1 as u64) << 32 | self.dw0 as u64
    }
}

// ============================================================================
// SGL descriptors
// ============================================================================

/// SGL descriptor for data carried in the command capsule at a byte offset
pub fn sgl_incapsule(len: u32) -> [u8; 16] {
    let mut sgl = [0u8; 16];
    // Address field holds the in-capsule byte offset (0: immediately after SQE)
    LittleEndian::write_u32(&mut sgl[8..12], len);
    sgl[15] = 0x01; // Data Block descriptor, offset sub type
    sgl
}

/// Transport SGL data block descriptor: data moves via C2H/H2C Data PDUs
pub fn sgl_transport(len: u32) -> [u8; 16] {
    let mut sgl = [0u8; 16];
    LittleEndian::write_u32(&mut sgl[8..12], len);
    sgl[15] = 0x5A; // Transport Data Block descriptor, transport sub type
    sgl
}

// ============================================================================
// Fabrics command builders
// ============================================================================

impl Sqe {
    /// Fabric Connect command for the given queue
    ///
    /// `sqsize` is 0's based. The 1024-byte Connect data block travels
    /// in-capsule.
    pub fn fabric_connect(cid: u16, qid: u16, sqsize: u16, cattr: u8, kato_ms: u32) -> Sqe {
        Sqe {
            opcode: admin_opcode::FABRICS,
            cid,
            nsid: fabrics_type::CONNECT as u32,
            dptr: sgl_incapsule(CONNECT_DATA_SIZE as u32),
            // CDW10: RECFMT (record format 0) | QID
            cdw10: (qid as u32) << 16,
            cdw11: (sqsize as u32) | (cattr as u32) << 16,
            cdw12: kato_ms,
            ..Sqe::default()
        }
    }

    /// Property Get; `size8` selects an 8-byte read
    pub fn property_get(cid: u16, offset: u32, size8: bool) -> Sqe {
        Sqe {
            opcode: admin_opcode::FABRICS,
            cid,
            nsid: fabrics_type::PROPERTY_GET as u32,
            cdw10: if size8 { 1 } else { 0 },
            cdw11: offset,
            ..Sqe::default()
        }
    }

    /// Property Set; `size8` selects an 8-byte write
    pub fn property_set(cid: u16, offset: u32, value: u64, size8: bool) -> Sqe {
        Sqe {
            opcode: admin_opcode::FABRICS,
            cid,
            nsid: fabrics_type::PROPERTY_SET as u32,
            cdw10: if size8 { 1 } else { 0 },
            cdw11: offset,
            cdw12: (value & 0xFFFF_FFFF) as u32,
            cdw13: (value >> 32) as u32,
            ..Sqe::default()
        }
    }
}

/// Build the 1024-byte Fabric Connect data block
///
/// Layout: host identifier (16), CNTLID (2, 0xFFFF requests a dynamic
/// controller), reserved to 256, subsystem NQN (256), host NQN (256),
/// reserved to 1024.
pub fn connect_data(host_id: &[u8; 16], subsystem_nqn: &str, host_nqn: &str) -> NvmeResult<Vec<u8>> {
    let mut buf = vec![0u8; CONNECT_DATA_SIZE];
    buf[0..16].copy_from_slice(host_id);
    LittleEndian::write_u16(&mut buf[16..18], 0xFFFF);
    write_nqn(&mut buf[256..512], subsystem_nqn)?;
    write_nqn(&mut buf[512..768], host_nqn)?;
    Ok(buf)
}

/// Write an NQN into a fixed 256-byte NUL-padded wire field
pub fn write_nqn(field: &mut [u8], nqn: &str) -> NvmeResult<()> {
    let bytes = nqn.as_bytes();
    if bytes.len() > NQN_MAX_LEN {
        return Err(NvmeError::Protocol(format!(
            "NQN too long: {} bytes (max {})",
            bytes.len(),
            NQN_MAX_LEN
        )));
    }
    field[..bytes.len()].copy_from_slice(bytes);
    for b in field.iter_mut().skip(bytes.len()) {
        *b = 0;
    }
    Ok(())
}

// ============================================================================
// Admin command builders
// ============================================================================

impl Sqe {
    /// Identify; 4096 bytes of data come back over C2H Data PDUs
    pub fn identify(cid: u16, cns_value: u8, nsid: u32) -> Sqe {
        Sqe {
            opcode: admin_opcode::IDENTIFY,
            cid,
            nsid,
            dptr: sgl_transport(4096),
            cdw10: cns_value as u32,
            ..Sqe::default()
        }
    }

    /// Get Log Page; `len` must be a multiple of 4
    pub fn get_log_page(cid: u16, lid: u8, nsid: u32, len: u32) -> Sqe {
        let numd = len / 4 - 1; // 0's based dword count
        Sqe {
            opcode: admin_opcode::GET_LOG_PAGE,
            cid,
            nsid,
            dptr: sgl_transport(len),
            cdw10: (lid as u32) | (numd & 0xFFFF) << 16,
            cdw11: numd >> 16,
            ..Sqe::default()
        }
    }

    pub fn get_features(cid: u16, fid: u8, nsid: u32) -> Sqe {
        Sqe {
            opcode: admin_opcode::GET_FEATURES,
            cid,
            nsid,
            cdw10: fid as u32, // SEL 000b: current value
            ..Sqe::default()
        }
    }

    pub fn set_features(cid: u16, fid: u8, value: u32, nsid: u32) -> Sqe {
        Sqe {
            opcode: admin_opcode::SET_FEATURES,
            cid,
            nsid,
            cdw10: fid as u32,
            cdw11: value,
            ..Sqe::default()
        }
    }

    pub fn async_event_request(cid: u16) -> Sqe {
        Sqe {
            opcode: admin_opcode::ASYNC_EVENT_REQUEST,
            cid,
            ..Sqe::default()
        }
    }

    pub fn keep_alive(cid: u16) -> Sqe {
        Sqe {
            opcode: admin_opcode::KEEP_ALIVE,
            cid,
            ..Sqe::default()
        }
    }
}

// ============================================================================
// NVM I/O command builders
// ============================================================================

impl Sqe {
    /// Read `nblocks` logical blocks starting at `slba`
    ///
    /// `nblocks` must be in 1..=65536; NLB is a 0's based 16-bit field.
    pub fn read(cid: u16, nsid: u32, slba: u64, nblocks: u32, data_len: u32) -> Sqe {
        Sqe {
            opcode: nvm_opcode::READ,
            cid,
            nsid,
            dptr: sgl_transport(data_len),
            cdw10: (slba & 0xFFFF_FFFF) as u32,
            cdw11: (slba >> 32) as u32,
            cdw12: nblocks.wrapping_sub(1) & 0xFFFF,
            ..Sqe::default()
        }
    }

    /// Write `data_len` bytes (`nblocks` logical blocks) starting at `slba`
    pub fn write(cid: u16, nsid: u32, slba: u64, nblocks: u32, data_len: u32) -> Sqe {
        Sqe {
            opcode: nvm_opcode::WRITE,
            cid,
            nsid,
            dptr: sgl_transport(data_len),
            cdw10: (slba & 0xFFFF_FFFF) as u32,
            cdw11: (slba >> 32) as u32,
            cdw12: nblocks.wrapping_sub(1) & 0xFFFF,
            ..Sqe::default()
        }
    }

    pub fn write_zeroes(cid: u16, nsid: u32, slba: u64, nblocks: u32) -> Sqe {
        Sqe {
            opcode: nvm_opcode::WRITE_ZEROES,
            cid,
            nsid,
            cdw10: (slba & 0xFFFF_FFFF) as u32,
            cdw11: (slba >> 32) as u32,
            cdw12: nblocks.wrapping_sub(1) & 0xFFFF,
            ..Sqe::default()
        }
    }

    pub fn flush(cid: u16, nsid: u32) -> Sqe {
        Sqe {
            opcode: nvm_opcode::FLUSH,
            cid,
            nsid,
            ..Sqe::default()
        }
    }

    /// Dataset Management with the Deallocate attribute over one LBA range
    pub fn dataset_management(cid: u16, nsid: u32) -> Sqe {
        Sqe {
            opcode: nvm_opcode::DATASET_MANAGEMENT,
            cid,
            nsid,
            dptr: sgl_transport(16),
            cdw10: 0,   // NR: one range, 0's based
            cdw11: 0x4, // AD: deallocate
            ..Sqe::default()
        }
    }
}

/// Build a single 16-byte Dataset Management range entry
pub fn dsm_range(slba: u64, nblocks: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    LittleEndian::write_u32(&mut buf[4..8], nblocks);
    LittleEndian::write_u64(&mut buf[8..16], slba);
    buf
}

// ============================================================================
// Reservation command builders
// ============================================================================

impl Sqe {
    /// Reservation Register; the 16-byte key payload travels as data-out
    pub fn reservation_register(cid: u16, nsid: u32, action: u8, cptpl: u8) -> Sqe {
        Sqe {
            opcode: nvm_opcode::RESERVATION_REGISTER,
            cid,
            nsid,
            dptr: sgl_transport(16),
            cdw10: (action & 0x7) as u32 | (cptpl as u32 & 0x3) << 30,
            ..Sqe::default()
        }
    }

    pub fn reservation_acquire(cid: u16, nsid: u32, action: u8, rtype: u8) -> Sqe {
        Sqe {
            opcode: nvm_opcode::RESERVATION_ACQUIRE,
            cid,
            nsid,
            dptr: sgl_transport(16),
            cdw10: (action & 0x7) as u32 | (rtype as u32) << 8,
            ..Sqe::default()
        }
    }

    pub fn reservation_release(cid: u16, nsid: u32, action: u8, rtype: u8) -> Sqe {
        Sqe {
            opcode: nvm_opcode::RESERVATION_RELEASE,
            cid,
            nsid,
            dptr: sgl_transport(8),
            cdw10: (action & 0x7) as u32 | (rtype as u32) << 8,
            ..Sqe::default()
        }
    }

    pub fn reservation_report(cid: u16, nsid: u32, len: u32, extended: bool) -> Sqe {
        Sqe {
            opcode: nvm_opcode::RESERVATION_REPORT,
            cid,
            nsid,
            dptr: sgl_transport(len),
            cdw10: len / 4 - 1,
            cdw11: if extended { 1 } else { 0 },
            ..Sqe::default()
        }
    }
}

/// Payload for Reservation Register: current key, new key
pub fn reservation_register_data(current_key: u64, new_key: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    LittleEndian::write_u64(&mut buf[0..8], current_key);
    LittleEndian::write_u64(&mut buf[8..16], new_key);
    buf
}

/// Payload for Reservation Acquire: current key, preempt key
pub fn reservation_acquire_data(current_key: u64, preempt_key: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    LittleEndian::write_u64(&mut buf[0..8], current_key);
    LittleEndian::write_u64(&mut buf[8..16], preempt_key);
    buf
}

/// Payload for Reservation Release: current key
pub fn reservation_release_data(current_key: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    LittleEndian::write_u64(&mut buf[0..8], current_key);
    buf
}

// ============================================================================
// Unit Tests
// ============================================================================
