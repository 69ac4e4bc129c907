//! Asynchronous Event Notification decoding
//!
//! An Asynchronous Event Request completes with an event packed into CQE
//! DW0: event type in bits 2:0, event information in bits 15:8, and the
//! associated log page identifier in bits 23:16.

use crate::logpage::log_page_id;

/// Asynchronous event types (DW0 bits 2:0)
pub mod event_type {
    pub const ERROR_STATUS: u8 = 0x0;
    pub const SMART_HEALTH: u8 = 0x1;
    pub const NOTICE: u8 = 0x2;
    pub const IO_COMMAND_SET: u8 = 0x6;
    pub const VENDOR_SPECIFIC: u8 = 0x7;
}

/// Bits for the Asynchronous Event Configuration feature (FID 0x0B)
pub mod aen_mask {
    /// All SMART / health critical warnings
    pub const SMART: u32 = 0xFF;
    pub const NAMESPACE_ATTRIBUTE: u32 = 1 << 8;
    pub const FIRMWARE_ACTIVATION: u32 = 1 << 9;
    pub const TELEMETRY: u32 = 1 << 10;
    pub const ANA_CHANGE: u32 = 1 << 11;
    /// All notice-class events
    pub const NOTICE: u32 = NAMESPACE_ATTRIBUTE | FIRMWARE_ACTIVATION | TELEMETRY | ANA_CHANGE;
}

/// A decoded asynchronous event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncEvent {
    /// Event type (bits 2:0)
    pub event_type: u8,
    /// Event information (bits 15:8)
    pub info: u8,
    /// Log page to read for details (bits 23:16)
    pub log_page_id: u8,
    /// The raw completion DW0
    pub raw: u32,
    pub description: String,
}

impl AsyncEvent {
    pub fn from_dw0(dw0: u32) -> Self {
        let event_type = (dw0 & 0x7) as u8;
        let info = ((dw0 >> 8) & 0xFF) as u8;
        let log_page_id = ((dw0 >> 16) & 0xFF) as u8;
        AsyncEvent {
            event_type,
            info,
            log_page_id,
            raw: dw0,
            description: describe(event_type, info, log_page_id),
        }
    }
}

fn describe(etype: u8, info: u8, lid: u8) -> String {
    let kind = match etype {
        event_type::ERROR_STATUS => match info {
            0x00 => "error: write to invalid doorbell",
            0x01 => "error: invalid doorbell write value",
            0x02 => "error: diagnostic failure",
            0x03 => "error: persistent internal error",
            0x04 => "error: transient internal error",
            0x05 => "error: firmware image load error",
            _ => "error status event",
        },
        event_type::SMART_HEALTH => match info {
            0x00 => "health: subsystem reliability degraded",
            0x01 => "health: temperature above threshold",
            0x02 => "health: spare capacity below threshold",
            _ => "health status event",
        },
        event_type::NOTICE => match info {
            0x00 => "notice: namespace attribute changed",
            0x01 => "notice: firmware activation starting",
            0x02 => "notice: telemetry log changed",
            0x03 => "notice: asymmetric namespace access change",
            _ => "notice event",
        },
        event_type::IO_COMMAND_SET => "I/O command set event",
        event_type::VENDOR_SPECIFIC => "vendor specific event",
        _ => "unknown event",
    };
    let page = match lid {
        log_page_id::ERROR_INFORMATION => " (Error Information log)",
        log_page_id::SMART_HEALTH => " (SMART / Health log)",
        log_page_id::CHANGED_NAMESPACE_LIST => " (Changed Namespace List log)",
        log_page_id::ANA => " (ANA log)",
        log_page_id::DISCOVERY => " (Discovery log)",
        _ => "",
    };
    format!("{}{}", kind, page)
}
