//! Decoders for Identify data structures
//!
//! Field offsets follow the NVMe base specification. Identification
//! strings are ASCII, space-padded on the right; NQNs are NUL-padded.

use crate::error::{NvmeError, NvmeResult};
use byteorder::{ByteOrder, LittleEndian};

/// Identify data structure size in bytes
pub const IDENTIFY_SIZE: usize = 4096;

/// Parsed Identify Controller data (CNS 0x01)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    /// PCI vendor id
    pub vid: u16,
    /// PCI subsystem vendor id
    pub ssvid: u16,
    /// Serial number, right-trimmed
    pub serial_number: String,
    /// Model number, right-trimmed
    pub model_number: String,
    /// Firmware revision, right-trimmed
    pub firmware_rev: String,
    /// Recommended arbitration burst
    pub rab: u8,
    /// IEEE OUI identifier
    pub ieee: [u8; 3],
    /// Controller multi-path I/O and namespace sharing capabilities
    pub cmic: u8,
    /// Maximum data transfer size as a power of two of the minimum page size
    pub mdts: u8,
    pub controller_id: u16,
    /// Version the controller implements
    pub version: u32,
    pub rtd3r: u32,
    pub rtd3e: u32,
    /// Optional asynchronous events supported
    pub oaes: u32,
    pub ctratt: u32,
    /// Optional admin command support
    pub oacs: u16,
    /// Number of namespaces
    pub nn: u32,
    pub sanicap: u32,
    pub hmpre: u32,
    pub hmmin: u32,
    pub subnqn: String,
    /// I/O queue command capsule size in 16-byte units (fabrics)
    pub ioccsz: u32,
    /// I/O queue response capsule size in 16-byte units (fabrics)
    pub iorcsz: u32,
}

impl ControllerInfo {
    pub fn parse(buf: &[u8]) -> NvmeResult<Self> {
        if buf.len() < IDENTIFY_SIZE {
            return Err(NvmeError::Protocol(format!(
                "Identify Controller data too short: {} bytes, need {}",
                buf.len(),
                IDENTIFY_SIZE
            )));
        }
        let mut ieee = [0u8; 3];
        ieee.copy_from_slice(&buf[73..76]);
        Ok(ControllerInfo {
            vid: LittleEndian::read_u16(&buf[0..2]),
            ssvid: LittleEndian::read_u16(&buf[2..4]),
            serial_number: ascii_string(&buf[4..24]),
            model_number: ascii_string(&buf[24..64]),
            firmware_rev: ascii_string(&buf[64..72]),
            rab: buf[72],
            ieee,
            cmic: buf[76],
            mdts: buf[77],
            controller_id: LittleEndian::read_u16(&buf[78..80]),
            version: LittleEndian::read_u32(&buf[80..84]),
            rtd3r: LittleEndian::read_u32(&buf[84..88]),
            rtd3e: LittleEndian::read_u32(&buf[88..92]),
            oaes: LittleEndian::read_u32(&buf[92..96]),
            ctratt: LittleEndian::read_u32(&buf[96..100]),
            oacs: LittleEndian::read_u16(&buf[256..258]),
            hmpre: LittleEndian::read_u32(&buf[272..276]),
            hmmin: LittleEndian::read_u32(&buf[276..280]),
            sanicap: LittleEndian::read_u32(&buf[328..332]),
            nn: LittleEndian::read_u32(&buf[516..520]),
            subnqn: nqn_string(&buf[768..1024]),
            ioccsz: LittleEndian::read_u32(&buf[1792..1796]),
            iorcsz: LittleEndian::read_u32(&buf[1796..1800]),
        })
    }

    /// Largest data-out payload that fits in a command capsule
    ///
    /// IOCCSZ counts 16-byte units and includes the 64-byte SQE.
    pub fn incapsule_data_limit(&self) -> usize {
        (self.ioccsz as usize * 16).saturating_sub(crate::command::SQE_SIZE)
    }
}

/// One entry of the namespace LBA format table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaFormat {
    /// Metadata bytes per block
    pub metadata_size: u16,
    /// LBA data size as a power of two
    pub lbads: u8,
    /// Relative performance (0 = best)
    pub relative_performance: u8,
}

/// Parsed Identify Namespace data (CNS 0x00)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// Namespace size in logical blocks
    pub nsze: u64,
    /// Namespace capacity in logical blocks
    pub ncap: u64,
    /// Namespace utilisation in logical blocks
    pub nuse: u64,
    pub nsfeat: u8,
    /// Number of LBA formats, 0's based
    pub nlbaf: u8,
    /// Formatted LBA size; current format index in bits 3:0
    pub flbas: u8,
    pub mc: u8,
    pub dpc: u8,
    pub dps: u8,
    pub nmic: u8,
    /// Reservation capabilities
    pub rescap: u8,
    pub fpi: u8,
    pub nawun: u16,
    pub nawupf: u16,
    pub nabsn: u16,
    pub nabo: u16,
    pub nabspf: u16,
    pub lba_formats: Vec<LbaFormat>,
}

impl NamespaceInfo {
    pub fn parse(buf: &[u8]) -> NvmeResult<Self> {
        if buf.len() < IDENTIFY_SIZE {
            return Err(NvmeError::Protocol(format!(
                "Identify Namespace data too short: {} bytes, need {}",
                buf.len(),
                IDENTIFY_SIZE
            )));
        }
        let mut lba_formats = Vec::with_capacity(16);
        for i in 0..16 {
            let entry = &buf[128 + i * 4..128 + i * 4 + 4];
            lba_formats.push(LbaFormat {
                metadata_size: LittleEndian::read_u16(&entry[0..2]),
                lbads: entry[2],
                relative_performance: entry[3] & 0x3,
            });
        }
        let info = NamespaceInfo {
            nsze: LittleEndian::read_u64(&buf[0..8]),
            ncap: LittleEndian::read_u64(&buf[8..16]),
            nuse: LittleEndian::read_u64(&buf[16..24]),
            nsfeat: buf[24],
            nlbaf: buf[25],
            flbas: buf[26],
            mc: buf[27],
            dpc: buf[28],
            dps: buf[29],
            nmic: buf[30],
            rescap: buf[31],
            fpi: buf[32],
            nawun: LittleEndian::read_u16(&buf[34..36]),
            nawupf: LittleEndian::read_u16(&buf[36..38]),
            nabsn: LittleEndian::read_u16(&buf[40..42]),
            nabo: LittleEndian::read_u16(&buf[42..44]),
            nabspf: LittleEndian::read_u16(&buf[44..46]),
            lba_formats,
        };
        if info.current_format_index() > info.nlbaf as usize {
            return Err(NvmeError::Protocol(format!(
                "FLBAS selects format {} but only {} formats exist",
                info.current_format_index(),
                info.nlbaf as usize + 1
            )));
        }
        Ok(info)
    }

    fn current_format_index(&self) -> usize {
        (self.flbas & 0x0F) as usize
    }

    /// The LBA format currently in use
    pub fn current_format(&self) -> LbaFormat {
        self.lba_formats[self.current_format_index()]
    }

    /// Logical block size in bytes of the current format
    pub fn block_size(&self) -> u32 {
        1u32 << self.current_format().lbads
    }
}

/// Parse an active namespace list (CNS 0x02): ordered NSIDs, zero-terminated
pub fn parse_namespace_list(buf: &[u8]) -> NvmeResult<Vec<u32>> {
    if buf.len() < IDENTIFY_SIZE {
        return Err(NvmeError::Protocol(format!(
            "namespace list too short: {} bytes, need {}",
            buf.len(),
            IDENTIFY_SIZE
        )));
    }
    let mut nsids = Vec::new();
    for chunk in buf[..IDENTIFY_SIZE].chunks_exact(4) {
        let nsid = LittleEndian::read_u32(chunk);
        if nsid == 0 {
            break;
        }
        nsids.push(nsid);
    }
    Ok(nsids)
}

/// Right-trim an ASCII identification field
pub(crate) fn ascii_string(buf: &[u8]) -> String {
    let s: String = buf
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect();
    s.trim_end_matches([' ', '\0']).to_string()
}

/// An NQN field: NUL-terminated within its 256-byte slot
pub(crate) fn nqn_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}
