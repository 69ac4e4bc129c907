//! Decoders for log pages: ANA, Discovery, and the error log
//!
//! Each decoder consumes the raw Get Log Page payload and produces typed
//! records, failing with a protocol error when a length field would index
//! past the end of the buffer.

use crate::error::{NvmeError, NvmeResult};
use crate::identify::{ascii_string, nqn_string};
use byteorder::{ByteOrder, LittleEndian};

/// Log page identifiers used by this client
pub mod log_page_id {
    pub const ERROR_INFORMATION: u8 = 0x01;
    pub const SMART_HEALTH: u8 = 0x02;
    pub const CHANGED_NAMESPACE_LIST: u8 = 0x0B;
    pub const ANA: u8 = 0x0C;
    pub const DISCOVERY: u8 = 0x70;
}

/// Asymmetric Namespace Access state of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnaState {
    Optimized,
    NonOptimized,
    Inaccessible,
    PersistentLoss,
    Change,
}

impl AnaState {
    pub fn from_u8(value: u8) -> NvmeResult<Self> {
        match value & 0x0F {
            0x01 => Ok(AnaState::Optimized),
            0x02 => Ok(AnaState::NonOptimized),
            0x03 => Ok(AnaState::Inaccessible),
            0x04 => Ok(AnaState::PersistentLoss),
            0x0F => Ok(AnaState::Change),
            other => Err(NvmeError::Protocol(format!(
                "unknown ANA state 0x{:02x}",
                other
            ))),
        }
    }
}

/// One ANA group descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnaGroup {
    pub group_id: u32,
    pub change_count: u64,
    pub state: AnaState,
    /// Namespaces that belong to this group
    pub namespace_ids: Vec<u32>,
}

/// Parsed ANA log page (LID 0x0C)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnaLogPage {
    pub change_count: u64,
    pub groups: Vec<AnaGroup>,
}

impl AnaLogPage {
    pub fn parse(buf: &[u8]) -> NvmeResult<Self> {
        if buf.len() < 16 {
            return Err(NvmeError::Protocol(format!(
                "ANA log too short: {} bytes, need at least 16",
                buf.len()
            )));
        }
        let change_count = LittleEndian::read_u64(&buf[0..8]);
        let ngrps = LittleEndian::read_u16(&buf[8..10]) as usize;

        let mut groups = Vec::with_capacity(ngrps);
        let mut offset = 16;
        for _ in 0..ngrps {
            if buf.len() < offset + 32 {
                return Err(NvmeError::Protocol(format!(
                    "ANA log truncated: group descriptor at {} exceeds {} bytes",
                    offset,
                    buf.len()
                )));
            }
            let desc = &buf[offset..];
            let group_id = LittleEndian::read_u32(&desc[0..4]);
            let nnsids = LittleEndian::read_u32(&desc[4..8]) as usize;
            let group_change_count = LittleEndian::read_u64(&desc[8..16]);
            let state = AnaState::from_u8(desc[16])?;

            let ids_end = offset + 32 + nnsids * 4;
            if buf.len() < ids_end {
                return Err(NvmeError::Protocol(format!(
                    "ANA log truncated: group {} declares {} namespaces beyond the buffer",
                    group_id, nnsids
                )));
            }
            let namespace_ids = buf[offset + 32..ids_end]
                .chunks_exact(4)
                .map(LittleEndian::read_u32)
                .collect();

            groups.push(AnaGroup {
                group_id,
                change_count: group_change_count,
                state,
                namespace_ids,
            });
            offset = ids_end;
        }

        Ok(AnaLogPage {
            change_count,
            groups,
        })
    }
}

/// Discovery log record size in bytes
pub const DISCOVERY_RECORD_SIZE: usize = 1024;

/// One discovery log entry describing a reachable subsystem port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEntry {
    /// Transport type (3 = TCP)
    pub trtype: u8,
    /// Address family (1 = IPv4, 2 = IPv6)
    pub adrfam: u8,
    /// Subsystem type (1 = discovery, 2 = NVM)
    pub subtype: u8,
    /// Transport requirements (secure channel bits)
    pub treq: u8,
    pub port_id: u16,
    pub controller_id: u16,
    /// Admin max SQ size
    pub asqsz: u16,
    /// Transport service id; for TCP, the decimal port number
    pub trsvcid: String,
    pub subnqn: String,
    pub traddr: String,
    /// Transport-specific address subtype bytes
    pub tsas: Vec<u8>,
}

/// Parsed Discovery log page (LID 0x70)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLogPage {
    /// Generation counter; changes whenever the log changes
    pub genctr: u64,
    /// Total records available at the controller
    pub numrec: u64,
    pub recfmt: u16,
    /// Records present in this payload
    pub entries: Vec<DiscoveryEntry>,
}

impl DiscoveryLogPage {
    /// Parse the header and however many whole records the payload holds
    pub fn parse(buf: &[u8]) -> NvmeResult<Self> {
        if buf.len() < 18 {
            return Err(NvmeError::Protocol(format!(
                "discovery log too short: {} bytes, need at least 18",
                buf.len()
            )));
        }
        let genctr = LittleEndian::read_u64(&buf[0..8]);
        let numrec = LittleEndian::read_u64(&buf[8..16]);
        let recfmt = LittleEndian::read_u16(&buf[16..18]);
        if recfmt != 0 {
            return Err(NvmeError::Protocol(format!(
                "unsupported discovery record format {}",
                recfmt
            )));
        }

        let present = ((buf.len().saturating_sub(DISCOVERY_RECORD_SIZE))
            / DISCOVERY_RECORD_SIZE)
            .min(numrec as usize);
        let mut entries = Vec::with_capacity(present);
        for i in 0..present {
            let offset = DISCOVERY_RECORD_SIZE * (i + 1);
            let rec = &buf[offset..offset + DISCOVERY_RECORD_SIZE];
            entries.push(DiscoveryEntry {
                trtype: rec[0],
                adrfam: rec[1],
                subtype: rec[2],
                treq: rec[3],
                port_id: LittleEndian::read_u16(&rec[4..6]),
                controller_id: LittleEndian::read_u16(&rec[6..8]),
                asqsz: LittleEndian::read_u16(&rec[8..10]),
                trsvcid: ascii_string(&rec[32..64]),
                subnqn: nqn_string(&rec[256..512]),
                traddr: ascii_string(&rec[512..768]),
                tsas: rec[768..1024].to_vec(),
            });
        }

        Ok(DiscoveryLogPage {
            genctr,
            numrec,
            recfmt,
            entries,
        })
    }
}

/// One error log entry (LID 0x01), 64 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLogEntry {
    /// Monotonic error count; 0 marks an unused entry
    pub error_count: u64,
    pub sqid: u16,
    pub cid: u16,
    pub status: u16,
    pub parameter_error_location: u16,
    pub lba: u64,
    pub nsid: u32,
}

/// Parse the error information log, skipping unused entries
pub fn parse_error_log(buf: &[u8]) -> NvmeResult<Vec<ErrorLogEntry>> {
    if buf.len() % 64 != 0 {
        return Err(NvmeError::Protocol(format!(
            "error log length {} is not a multiple of 64",
            buf.len()
        )));
    }
    let mut entries = Vec::new();
    for rec in buf.chunks_exact(64) {
        let error_count = LittleEndian::read_u64(&rec[0..8]);
        if error_count == 0 {
            continue;
        }
        entries.push(ErrorLogEntry {
            error_count,
            sqid: LittleEndian::read_u16(&rec[8..10]),
            cid: LittleEndian::read_u16(&rec[10..12]),
            status: LittleEndian::read_u16(&rec[12..14]),
            parameter_error_location: LittleEndian::read_u16(&rec[14..16]),
            lba: LittleEndian::read_u64(&rec[16..24]),
            nsid: LittleEndian::read_u32(&rec[24..28]),
        });
    }
    Ok(entries)
}
