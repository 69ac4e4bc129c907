//! NVMe/TCP PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary framing of the NVMe/TCP transport:
//! the 8-byte common header, the per-type PDU bodies, and the optional
//! CRC32C header/data digests. All multi-byte fields are little-endian.

use crate::command::{Cqe, Sqe, CQE_SIZE, SQE_SIZE};
use crate::error::{NvmeError, NvmeResult};
use byteorder::{ByteOrder, LittleEndian};

/// Common header size in bytes
pub const PDU_HDR_SIZE: usize = 8;

/// ICReq/ICResp total PDU size
pub const IC_PDU_SIZE: usize = 128;

/// CRC32C digest size in bytes
pub const DIGEST_SIZE: usize = 4;

/// Largest PDU accepted from the peer (data + headers + digests)
pub const MAX_PDU_SIZE: usize = 4 * 1024 * 1024 + 128;

/// Largest termination request PDU (header + offending PDU header)
pub const MAX_TERM_PDU_SIZE: usize = 152;

/// NVMe/TCP PDU types
pub mod pdu_type {
    pub const ICREQ: u8 = 0x00;
    pub const ICRESP: u8 = 0x01;
    pub const H2C_TERM_REQ: u8 = 0x02;
    pub const C2H_TERM_REQ: u8 = 0x03;
    pub const CAPSULE_CMD: u8 = 0x04;
    pub const CAPSULE_RESP: u8 = 0x05;
    pub const H2C_DATA: u8 = 0x06;
    pub const C2H_DATA: u8 = 0x07;
    pub const R2T: u8 = 0x09;
}

/// Common-header flag bits
pub mod flags {
    /// Header digest present
    pub const HDGST: u8 = 0x01;
    /// Data digest present
    pub const DDGST: u8 = 0x02;
    /// Last data PDU of the transfer
    pub const LAST_PDU: u8 = 0x04;
    /// C2HData only: command completed successfully, no response capsule follows
    pub const SUCCESS: u8 = 0x08;
}

/// Fatal Error Status codes carried in termination requests
pub mod fes {
    pub const INVALID_PDU_HEADER_FIELD: u16 = 0x01;
    pub const PDU_SEQUENCE_ERROR: u16 = 0x02;
    pub const HEADER_DIGEST_ERROR: u16 = 0x03;
    pub const DATA_TRANSFER_OUT_OF_RANGE: u16 = 0x04;
    pub const DATA_TRANSFER_LIMIT_EXCEEDED: u16 = 0x05;
    pub const UNSUPPORTED_PARAMETER: u16 = 0x06;

    pub fn name(value: u16) -> &'static str {
        match value {
            INVALID_PDU_HEADER_FIELD => "Invalid PDU Header Field",
            PDU_SEQUENCE_ERROR => "PDU Sequence Error",
            HEADER_DIGEST_ERROR => "Header Digest Error",
            DATA_TRANSFER_OUT_OF_RANGE => "Data Transfer Out of Range",
            DATA_TRANSFER_LIMIT_EXCEEDED => "Data Transfer Limit Exceeded",
            UNSUPPORTED_PARAMETER => "Unsupported Parameter",
            _ => "Unknown",
        }
    }
}

/// Negotiated digest enablement applied when encoding and decoding PDUs
///
/// Initialise-connection and termination PDUs never carry digests; the
/// state only affects capsule and data PDUs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestState {
    pub header: bool,
    pub data: bool,
}

/// Initialise Connection Request (host → controller), 128 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcReq {
    /// PDU format version; only 0x0000 is defined
    pub pfv: u16,
    /// Host PDU data alignment requirement, in (HPDA+1)*4 byte units
    pub hpda: u8,
    /// Digest enablement proposed by the host
    pub digest: DigestState,
    /// Maximum number of outstanding R2Ts per command
    pub maxr2t: u32,
}

/// Initialise Connection Response (controller → host), 128 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcResp {
    pub pfv: u16,
    /// Controller PDU data alignment requirement for host-sent data
    pub cpda: u8,
    /// Digest enablement accepted by the controller
    pub digest: DigestState,
    /// Maximum data length per H2CData PDU
    pub maxh2cdata: u32,
}

/// Command capsule: one SQE plus optional in-capsule data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleCmd {
    pub sqe: Sqe,
    pub data: Vec<u8>,
}

/// Response capsule: one CQE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleResp {
    pub cqe: Cqe,
}

/// Host-to-controller data transfer PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2cData {
    /// Command identifier of the command this data belongs to
    pub cccid: u16,
    /// Transfer tag from the soliciting R2T
    pub ttag: u16,
    /// Offset of this data within the command's data buffer
    pub datao: u32,
    pub data: Vec<u8>,
    /// Last PDU of this data transfer
    pub last: bool,
}

/// Controller-to-host data transfer PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct C2hData {
    pub cccid: u16,
    pub datao: u32,
    pub data: Vec<u8>,
    pub last: bool,
    /// Completion is implied; no response capsule follows
    pub success: bool,
}

/// Ready to Transfer: controller grants a window of host-to-controller data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct R2t {
    pub cccid: u16,
    pub ttag: u16,
    /// Requested data offset
    pub r2to: u32,
    /// Requested data length
    pub r2tl: u32,
}

/// Connection termination request (either direction)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermReq {
    /// Fatal error status
    pub fes: u16,
    /// Fatal error information (field offset or digest value)
    pub fei: u32,
    /// Header of the PDU that caused the error
    pub offending_header: Vec<u8>,
}

/// A decoded NVMe/TCP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    IcReq(IcReq),
    IcResp(IcResp),
    CapsuleCmd(CapsuleCmd),
    CapsuleResp(CapsuleResp),
    H2cData(H2cData),
    C2hData(C2hData),
    R2t(R2t),
    H2cTermReq(TermReq),
    C2hTermReq(TermReq),
}

/// Byte offset at which PDU data starts, honouring the peer's alignment
///
/// `pda` is the negotiated 0's based alignment in dwords: data must start
/// at a multiple of `(pda + 1) * 4` bytes from the start of the PDU.
pub fn data_offset(hlen: usize, pda: u8) -> usize {
    let align = (pda as usize + 1) * 4;
    hlen.div_ceil(align) * align
}

impl Pdu {
    pub fn pdu_type(&self) -> u8 {
        match self {
            Pdu::IcReq(_) => pdu_type::ICREQ,
            Pdu::IcResp(_) => pdu_type::ICRESP,
            Pdu::CapsuleCmd(_) => pdu_type::CAPSULE_CMD,
            Pdu::CapsuleResp(_) => pdu_type::CAPSULE_RESP,
            Pdu::H2cData(_) => pdu_type::H2C_DATA,
            Pdu::C2hData(_) => pdu_type::C2H_DATA,
            Pdu::R2t(_) => pdu_type::R2T,
            Pdu::H2cTermReq(_) => pdu_type::H2C_TERM_REQ,
            Pdu::C2hTermReq(_) => pdu_type::C2H_TERM_REQ,
        }
    }

    /// Get the PDU type name for debugging
    pub fn type_name(&self) -> &'static str {
        match self.pdu_type() {
            pdu_type::ICREQ => "ICReq",
            pdu_type::ICRESP => "ICResp",
            pdu_type::H2C_TERM_REQ => "H2CTermReq",
            pdu_type::C2H_TERM_REQ => "C2HTermReq",
            pdu_type::CAPSULE_CMD => "CapsuleCmd",
            pdu_type::CAPSULE_RESP => "CapsuleResp",
            pdu_type::H2C_DATA => "H2CData",
            pdu_type::C2H_DATA => "C2HData",
            pdu_type::R2T => "R2T",
            _ => "Unknown",
        }
    }

    /// Serialize to wire bytes
    ///
    /// Produces exactly `plen` bytes. `digest` is the negotiated digest
    /// state; `pda` the peer's data alignment requirement (applied to
    /// capsule and H2C data offsets).
    pub fn to_bytes(&self, digest: DigestState, pda: u8) -> Vec<u8> {
        match self {
            Pdu::IcReq(ic) => {
                let mut buf = ic_header(pdu_type::ICREQ);
                LittleEndian::write_u16(&mut buf[8..10], ic.pfv);
                buf[10] = ic.hpda;
                buf[11] = digest_bits(ic.digest);
                LittleEndian::write_u32(&mut buf[12..16], ic.maxr2t);
                buf
            }
            Pdu::IcResp(ic) => {
                let mut buf = ic_header(pdu_type::ICRESP);
                LittleEndian::write_u16(&mut buf[8..10], ic.pfv);
                buf[10] = ic.cpda;
                buf[11] = digest_bits(ic.digest);
                LittleEndian::write_u32(&mut buf[12..16], ic.maxh2cdata);
                buf
            }
            Pdu::CapsuleCmd(cmd) => {
                encode_with_data(
                    pdu_type::CAPSULE_CMD,
                    0,
                    &cmd.sqe.to_bytes(),
                    &cmd.data,
                    digest,
                    pda,
                )
            }
            Pdu::CapsuleResp(resp) => {
                encode_with_data(
                    pdu_type::CAPSULE_RESP,
                    0,
                    &resp.cqe.to_bytes(),
                    &[],
                    digest,
                    pda,
                )
            }
            Pdu::H2cData(h2c) => {
                let mut specific = [0u8; 16];
                LittleEndian::write_u16(&mut specific[0..2], h2c.cccid);
                LittleEndian::write_u16(&mut specific[2..4], h2c.ttag);
                LittleEndian::write_u32(&mut specific[4..8], h2c.datao);
                LittleEndian::write_u32(&mut specific[8..12], h2c.data.len() as u32);
                let extra = if h2c.last { flags::LAST_PDU } else { 0 };
                encode_with_data(pdu_type::H2C_DATA, extra, &specific, &h2c.data, digest, pda)
            }
            Pdu::C2hData(c2h) => {
                let mut specific = [0u8; 16];
                LittleEndian::write_u16(&mut specific[0..2], c2h.cccid);
                LittleEndian::write_u32(&mut specific[4..8], c2h.datao);
                LittleEndian::write_u32(&mut specific[8..12], c2h.data.len() as u32);
                let mut extra = 0;
                if c2h.last {
                    extra |= flags::LAST_PDU;
                }
                if c2h.success {
                    extra |= flags::SUCCESS;
                }
                encode_with_data(pdu_type::C2H_DATA, extra, &specific, &c2h.data, digest, pda)
            }
            Pdu::R2t(r2t) => {
                let mut specific = [0u8; 16];
                LittleEndian::write_u16(&mut specific[0..2], r2t.cccid);
                LittleEndian::write_u16(&mut specific[2..4], r2t.ttag);
                LittleEndian::write_u32(&mut specific[4..8], r2t.r2to);
                LittleEndian::write_u32(&mut specific[8..12], r2t.r2tl);
                encode_with_data(pdu_type::R2T, 0, &specific, &[], digest, pda)
            }
            Pdu::H2cTermReq(term) => encode_term(pdu_type::H2C_TERM_REQ, term),
            Pdu::C2hTermReq(term) => encode_term(pdu_type::C2H_TERM_REQ, term),
        }
    }

    /// Parse a PDU from bytes
    ///
    /// `buf` must contain exactly the `plen` bytes announced in the common
    /// header. Digest presence must match the negotiated `digest` state;
    /// digests are verified and a mismatch is a protocol error.
    pub fn from_bytes(buf: &[u8], digest: DigestState) -> NvmeResult<Pdu> {
        if buf.len() < PDU_HDR_SIZE {
            return Err(NvmeError::Protocol(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                PDU_HDR_SIZE
            )));
        }

        let ptype = buf[0];
        let pflags = buf[1];
        let hlen = buf[2] as usize;
        let pdo = buf[3] as usize;
        let plen = LittleEndian::read_u32(&buf[4..8]) as usize;

        if plen > MAX_PDU_SIZE {
            return Err(NvmeError::Protocol(format!(
                "PLEN {} exceeds maximum PDU size {}",
                plen, MAX_PDU_SIZE
            )));
        }
        if buf.len() != plen {
            return Err(NvmeError::Protocol(format!(
                "PLEN mismatch: header announces {} bytes, got {}",
                plen,
                buf.len()
            )));
        }

        match ptype {
            pdu_type::ICREQ | pdu_type::ICRESP => {
                if hlen != IC_PDU_SIZE || plen != IC_PDU_SIZE {
                    return Err(NvmeError::Protocol(format!(
                        "IC PDU with hlen={} plen={}, expected {}",
                        hlen, plen, IC_PDU_SIZE
                    )));
                }
                if pflags & (flags::HDGST | flags::DDGST) != 0 {
                    return Err(NvmeError::Protocol(
                        "IC PDU carries digest flags".to_string(),
                    ));
                }
                let pfv = LittleEndian::read_u16(&buf[8..10]);
                let pda = buf[10];
                let dgst = DigestState {
                    header: buf[11] & flags::HDGST != 0,
                    data: buf[11] & flags::DDGST != 0,
                };
                let dw = LittleEndian::read_u32(&buf[12..16]);
                if ptype == pdu_type::ICREQ {
                    Ok(Pdu::IcReq(IcReq {
                        pfv,
                        hpda: pda,
                        digest: dgst,
                        maxr2t: dw,
                    }))
                } else {
                    Ok(Pdu::IcResp(IcResp {
                        pfv,
                        cpda: pda,
                        digest: dgst,
                        maxh2cdata: dw,
                    }))
                }
            }
            pdu_type::CAPSULE_CMD => {
                let body = decode_body(buf, hlen, pdo, PDU_HDR_SIZE + SQE_SIZE, digest)?;
                let sqe = Sqe::from_bytes(&buf[PDU_HDR_SIZE..PDU_HDR_SIZE + SQE_SIZE])?;
                Ok(Pdu::CapsuleCmd(CapsuleCmd {
                    sqe,
                    data: body.data,
                }))
            }
            pdu_type::CAPSULE_RESP => {
                let body = decode_body(buf, hlen, pdo, PDU_HDR_SIZE + CQE_SIZE, digest)?;
                if !body.data.is_empty() {
                    return Err(NvmeError::Protocol(
                        "CapsuleResp with trailing data".to_string(),
                    ));
                }
                let cqe = Cqe::from_bytes(&buf[PDU_HDR_SIZE..PDU_HDR_SIZE + CQE_SIZE])?;
                Ok(Pdu::CapsuleResp(CapsuleResp { cqe }))
            }
            pdu_type::H2C_DATA => {
                let body = decode_body(buf, hlen, pdo, PDU_HDR_SIZE + 16, digest)?;
                let datal = LittleEndian::read_u32(&buf[16..20]) as usize;
                if datal != body.data.len() {
                    return Err(NvmeError::Protocol(format!(
                        "H2CData DATAL {} inconsistent with {} data bytes",
                        datal,
                        body.data.len()
                    )));
                }
                Ok(Pdu::H2cData(H2cData {
                    cccid: LittleEndian::read_u16(&buf[8..10]),
                    ttag: LittleEndian::read_u16(&buf[10..12]),
                    datao: LittleEndian::read_u32(&buf[12..16]),
                    data: body.data,
                    last: pflags & flags::LAST_PDU != 0,
                }))
            }
            pdu_type::C2H_DATA => {
                let body = decode_body(buf, hlen, pdo, PDU_HDR_SIZE + 16, digest)?;
                let datal = LittleEndian::read_u32(&buf[16..20]) as usize;
                if datal != body.data.len() {
                    return Err(NvmeError::Protocol(format!(
                        "C2HData DATAL {} inconsistent with {} data bytes",
                        datal,
                        body.data.len()
                    )));
                }
                Ok(Pdu::C2hData(C2hData {
                    cccid: LittleEndian::read_u16(&buf[8..10]),
                    datao: LittleEndian::read_u32(&buf[12..16]),
                    data: body.data,
                    last: pflags & flags::LAST_PDU != 0,
                    success: pflags & flags::SUCCESS != 0,
                }))
            }
            pdu_type::R2T => {
                let body = decode_body(buf, hlen, pdo, PDU_HDR_SIZE + 16, digest)?;
                if !body.data.is_empty() {
                    return Err(NvmeError::Protocol("R2T with trailing data".to_string()));
                }
                Ok(Pdu::R2t(R2t {
                    cccid: LittleEndian::read_u16(&buf[8..10]),
                    ttag: LittleEndian::read_u16(&buf[10..12]),
                    r2to: LittleEndian::read_u32(&buf[12..16]),
                    r2tl: LittleEndian::read_u32(&buf[16..20]),
                }))
            }
            pdu_type::H2C_TERM_REQ | pdu_type::C2H_TERM_REQ => {
                if hlen != 24 || plen < 24 || plen > MAX_TERM_PDU_SIZE {
                    return Err(NvmeError::Protocol(format!(
                        "termination PDU with hlen={} plen={}",
                        hlen, plen
                    )));
                }
                let term = TermReq {
                    fes: LittleEndian::read_u16(&buf[8..10]),
                    fei: LittleEndian::read_u32(&buf[10..14]),
                    offending_header: buf[24..].to_vec(),
                };
                if ptype == pdu_type::H2C_TERM_REQ {
                    Ok(Pdu::H2cTermReq(term))
                } else {
                    Ok(Pdu::C2hTermReq(term))
                }
            }
            _ => Err(NvmeError::Protocol(format!(
                "unknown PDU type 0x{:02x}",
                ptype
            ))),
        }
    }
}

fn digest_bits(digest: DigestState) -> u8 {
    let mut bits = 0;
    if digest.header {
        bits |= flags::HDGST;
    }
    if digest.data {
        bits |= flags::DDGST;
    }
    bits
}

/// 128-byte zeroed IC PDU with the common header filled in
fn ic_header(ptype: u8) -> Vec<u8> {
    let mut buf = vec![0u8; IC_PDU_SIZE];
    buf[0] = ptype;
    buf[2] = IC_PDU_SIZE as u8;
    LittleEndian::write_u32(&mut buf[4..8], IC_PDU_SIZE as u32);
    buf
}

/// Encode a PDU with a fixed specific header and optional trailing data
fn encode_with_data(
    ptype: u8,
    extra_flags: u8,
    specific: &[u8],
    data: &[u8],
    digest: DigestState,
    pda: u8,
) -> Vec<u8> {
    let hdgst = digest.header;
    let ddgst = digest.data && !data.is_empty();
    let base_hlen = PDU_HDR_SIZE + specific.len();
    let hlen = base_hlen + if hdgst { DIGEST_SIZE } else { 0 };

    let mut pflags = extra_flags;
    if hdgst {
        pflags |= flags::HDGST;
    }
    if ddgst {
        pflags |= flags::DDGST;
    }

    let (pdo, plen) = if data.is_empty() {
        (0, hlen)
    } else {
        let off = data_offset(hlen, pda);
        (off, off + data.len() + if ddgst { DIGEST_SIZE } else { 0 })
    };

    let mut buf = Vec::with_capacity(plen);
    buf.push(ptype);
    buf.push(pflags);
    buf.push(hlen as u8);
    buf.push(pdo as u8);
    let mut plen_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut plen_bytes, plen as u32);
    buf.extend_from_slice(&plen_bytes);
    buf.extend_from_slice(specific);

    if hdgst {
        let crc = crc32c::crc32c(&buf);
        let mut crc_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut crc_bytes, crc);
        buf.extend_from_slice(&crc_bytes);
    }

    if !data.is_empty() {
        buf.resize(pdo, 0);
        buf.extend_from_slice(data);
        if ddgst {
            let crc = crc32c::crc32c(data);
            let mut crc_bytes = [0u8; 4];
            LittleEndian::write_u32(&mut crc_bytes, crc);
            buf.extend_from_slice(&crc_bytes);
        }
    }

    debug_assert_eq!(buf.len(), plen);
    buf
}

/// Termination PDUs are sent on a dying connection and never carry digests
fn encode_term(ptype: u8, term: &TermReq) -> Vec<u8> {
    let header = &term.offending_header[..term.offending_header.len().min(128)];
    let plen = 24 + header.len();
    let mut buf = Vec::with_capacity(plen);
    buf.push(ptype);
    buf.push(0);
    buf.push(24);
    buf.push(0);
    let mut plen_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut plen_bytes, plen as u32);
    buf.extend_from_slice(&plen_bytes);
    let mut specific = [0u8; 16];
    LittleEndian::write_u16(&mut specific[0..2], term.fes);
    LittleEndian::write_u32(&mut specific[2..6], term.fei);
    buf.extend_from_slice(&specific);
    buf.extend_from_slice(header);
    buf
}

struct DecodedBody {
    data: Vec<u8>,
}

/// Validate hlen/pdo/digests for a capsule or data PDU and extract the data
fn decode_body(
    buf: &[u8],
    hlen: usize,
    pdo: usize,
    base_hlen: usize,
    digest: DigestState,
) -> NvmeResult<DecodedBody> {
    let pflags = buf[1];
    let hdgst = pflags & flags::HDGST != 0;
    let ddgst = pflags & flags::DDGST != 0;

    if hdgst != digest.header {
        return Err(NvmeError::Protocol(format!(
            "header digest flag {} does not match negotiated state {}",
            hdgst, digest.header
        )));
    }

    let expected_hlen = base_hlen + if hdgst { DIGEST_SIZE } else { 0 };
    if hlen != expected_hlen {
        return Err(NvmeError::Protocol(format!(
            "unexpected HLEN {} for PDU type 0x{:02x}, expected {}",
            hlen, buf[0], expected_hlen
        )));
    }
    if buf.len() < hlen {
        return Err(NvmeError::Protocol(format!(
            "PDU shorter ({}) than its header ({})",
            buf.len(),
            hlen
        )));
    }

    if hdgst {
        let announced = LittleEndian::read_u32(&buf[hlen - DIGEST_SIZE..hlen]);
        let computed = crc32c::crc32c(&buf[..hlen - DIGEST_SIZE]);
        if announced != computed {
            return Err(NvmeError::Protocol(format!(
                "header digest mismatch: announced {:08x}, computed {:08x}",
                announced, computed
            )));
        }
    }

    // No data region
    if buf.len() == hlen {
        if ddgst {
            return Err(NvmeError::Protocol(
                "data digest flag on a PDU without data".to_string(),
            ));
        }
        return Ok(DecodedBody { data: Vec::new() });
    }

    if ddgst != digest.data {
        return Err(NvmeError::Protocol(format!(
            "data digest flag {} does not match negotiated state {}",
            ddgst, digest.data
        )));
    }
    if pdo < hlen || pdo > buf.len() {
        return Err(NvmeError::Protocol(format!(
            "PDO {} outside PDU (hlen {}, plen {})",
            pdo,
            hlen,
            buf.len()
        )));
    }
    let data_end = buf.len() - if ddgst { DIGEST_SIZE } else { 0 };
    if data_end < pdo {
        return Err(NvmeError::Protocol(format!(
            "data region end {} before PDO {}",
            data_end, pdo
        )));
    }

    let data = buf[pdo..data_end].to_vec();
    if ddgst {
        let announced = LittleEndian::read_u32(&buf[data_end..]);
        let computed = crc32c::crc32c(&data);
        if announced != computed {
            return Err(NvmeError::Protocol(format!(
                "data digest mismatch: announced {:08x}, computed {:08x}",
                announced, computed
            )));
        }
    }
    Ok(DecodedBody { data })
}

// ============================================================================
// Unit Tests
// ============================================================================
