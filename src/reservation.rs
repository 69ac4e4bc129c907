//! Persistent reservation types and the Reservation Report decoder

use crate::error::{NvmeError, NvmeResult};
use byteorder::{ByteOrder, LittleEndian};

/// Reservation types (NVMe base spec)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReservationType {
    WriteExclusive = 1,
    ExclusiveAccess = 2,
    WriteExclusiveRegistrantsOnly = 3,
    ExclusiveAccessRegistrantsOnly = 4,
    WriteExclusiveAllRegistrants = 5,
    ExclusiveAccessAllRegistrants = 6,
}

impl ReservationType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ReservationType::WriteExclusive),
            2 => Some(ReservationType::ExclusiveAccess),
            3 => Some(ReservationType::WriteExclusiveRegistrantsOnly),
            4 => Some(ReservationType::ExclusiveAccessRegistrantsOnly),
            5 => Some(ReservationType::WriteExclusiveAllRegistrants),
            6 => Some(ReservationType::ExclusiveAccessAllRegistrants),
            _ => None,
        }
    }
}

/// Reservation Register actions (CDW10 RREGA)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegisterAction {
    Register = 0,
    Unregister = 1,
    Replace = 2,
}

/// Reservation Acquire actions (CDW10 RACQA)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcquireAction {
    Acquire = 0,
    Preempt = 1,
    PreemptAndAbort = 2,
}

/// Reservation Release actions (CDW10 RRELA)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReleaseAction {
    Release = 0,
    Clear = 1,
}

/// One registered controller from a Reservation Report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredController {
    pub controller_id: u16,
    /// This controller's host holds the reservation
    pub holder: bool,
    /// 8 bytes, or 16 with the extended data structure
    pub host_id: Vec<u8>,
    pub key: u64,
}

/// Parsed Reservation Report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationStatus {
    /// Generation counter, bumped by register/acquire/release
    pub generation: u32,
    /// Held reservation type; None when nothing is reserved
    pub rtype: Option<ReservationType>,
    /// Persist-through-power-loss state
    pub ptpls: u8,
    pub controllers: Vec<RegisteredController>,
}

impl ReservationStatus {
    /// Parse a Reservation Report payload
    ///
    /// `extended` selects the 64-byte descriptor layout with 16-byte host
    /// identifiers (EDS); otherwise descriptors are 24 bytes with 8-byte
    /// host identifiers.
    pub fn parse(buf: &[u8], extended: bool) -> NvmeResult<Self> {
        if buf.len() < 24 {
            return Err(NvmeError::Protocol(format!(
                "reservation report too short: {} bytes, need at least 24",
                buf.len()
            )));
        }
        let generation = LittleEndian::read_u32(&buf[0..4]);
        let rtype_raw = buf[4];
        let rtype = if rtype_raw == 0 {
            None
        } else {
            Some(ReservationType::from_u8(rtype_raw).ok_or_else(|| {
                NvmeError::Protocol(format!("unknown reservation type 0x{:02x}", rtype_raw))
            })?)
        };
        let regctl = LittleEndian::read_u16(&buf[5..7]) as usize;
        let ptpls = buf[9];

        let desc_size = if extended { 64 } else { 24 };
        let needed = 24 + regctl * desc_size;
        if buf.len() < needed {
            return Err(NvmeError::Protocol(format!(
                "reservation report declares {} controllers but holds {} bytes, need {}",
                regctl,
                buf.len(),
                needed
            )));
        }

        let mut controllers = Vec::with_capacity(regctl);
        for i in 0..regctl {
            let desc = &buf[24 + i * desc_size..24 + (i + 1) * desc_size];
            let (host_id, key) = if extended {
                (desc[16..32].to_vec(), LittleEndian::read_u64(&desc[8..16]))
            } else {
                (desc[8..16].to_vec(), LittleEndian::read_u64(&desc[16..24]))
            };
            controllers.push(RegisteredController {
                controller_id: LittleEndian::read_u16(&desc[0..2]),
                holder: desc[2] & 0x01 != 0,
                host_id,
                key,
            });
        }

        Ok(ReservationStatus {
            generation,
            rtype,
            ptpls,
            controllers,
        })
    }

    /// The registered controller currently holding the reservation, if any
    pub fn holder(&self) -> Option<&RegisteredController> {
        self.controllers.iter().find(|c| c.holder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_payload(rtype: u8, holders: &[(u16, bool, u64)]) -> Vec<u8> {
        let mut buf = vec![0u8; 24];
        LittleEndian::write_u32(&mut buf[0..4], 5);
        buf[4] = rtype;
        LittleEndian::write_u16(&mut buf[5..7], holders.len() as u16);
        buf[9] = 1;
        for &(cntlid, holder, key) in holders {
            let mut desc = vec![0u8; 24];
            LittleEndian::write_u16(&mut desc[0..2], cntlid);
            desc[2] = if holder { 1 } else { 0 };
            desc[8..16].copy_from_slice(&[0xAA; 8]);
            LittleEndian::write_u64(&mut desc[16..24], key);
            buf.extend_from_slice(&desc);
        }
        buf
    }

    #[test]
    fn test_reservation_report_parse() {
        let buf = report_payload(1, &[(0x42, true, 0xCAFE), (0x43, false, 0xBEEF)]);
        let status = ReservationStatus::parse(&buf, false).unwrap();
        assert_eq!(status.generation, 5);
        assert_eq!(status.rtype, Some(ReservationType::WriteExclusive));
        assert_eq!(status.ptpls, 1);
        assert_eq!(status.controllers.len(), 2);
        let holder = status.holder().unwrap();
        assert_eq!(holder.controller_id, 0x42);
        assert_eq!(holder.key, 0xCAFE);
        assert_eq!(holder.host_id.len(), 8);
    }

    #[test]
    fn test_reservation_report_no_reservation() {
        let buf = report_payload(0, &[(0x42, false, 0xCAFE)]);
        let status = ReservationStatus::parse(&buf, false).unwrap();
        assert_eq!(status.rtype, None);
        assert!(status.holder().is_none());
    }

    #[test]
    fn test_reservation_report_extended() {
        let mut buf = vec![0u8; 24 + 64];
        LittleEndian::write_u32(&mut buf[0..4], 1);
        buf[4] = 2;
        LittleEndian::write_u16(&mut buf[5..7], 1);
        let desc = &mut buf[24..];
        LittleEndian::write_u16(&mut desc[0..2], 7);
        desc[2] = 1;
        LittleEndian::write_u64(&mut desc[8..16], 0x1234);
        desc[16..32].copy_from_slice(&[0xBB; 16]);

        let status = ReservationStatus::parse(&buf, true).unwrap();
        let holder = status.holder().unwrap();
        assert_eq!(holder.controller_id, 7);
        assert_eq!(holder.key, 0x1234);
        assert_eq!(holder.host_id, vec![0xBB; 16]);
    }

    #[test]
    fn test_reservation_report_truncated() {
        let mut buf = report_payload(1, &[(0x42, true, 1)]);
        LittleEndian::write_u16(&mut buf[5..7], 3); // claims 3 controllers
        assert!(ReservationStatus::parse(&buf, false).is_err());
    }

    #[test]
    fn test_reservation_report_bad_rtype() {
        let buf = report_payload(9, &[]);
        assert!(ReservationStatus::parse(&buf, false).is_err());
    }
}
