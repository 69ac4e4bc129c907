//! Error types for NVMe/TCP client operations

use std::fmt;
use thiserror::Error;

/// NVMe client errors
///
/// Every public operation fails with exactly one of these four kinds.
/// `Connection` and `Protocol` are fatal for the session; `Timeout` and
/// `Command` fail only the affected command.
#[derive(Debug, Clone, Error)]
pub enum NvmeError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("command failed: {0}")]
    Command(CommandStatus),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for NvmeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                NvmeError::Timeout(e.to_string())
            }
            _ => NvmeError::Connection(e.to_string()),
        }
    }
}

/// Result type for NVMe operations
pub type NvmeResult<T> = Result<T, NvmeError>;

/// Decomposed completion status for a failed command
///
/// Carries the 15-bit status field split into status code type and status
/// code, the Do-Not-Retry and More bits, and DW0 of the completion entry.
/// `local` marks statuses synthesised by argument validation before any
/// bytes reached the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Opcode of the command that failed
    pub opcode: u8,
    /// Status Code Type (bits 11:9 of the CQE status)
    pub sct: u8,
    /// Status Code (bits 8:1 of the CQE status)
    pub sc: u8,
    /// Do Not Retry
    pub dnr: bool,
    /// More status information available in the error log
    pub more: bool,
    /// Command-specific DW0 from the completion entry
    pub dw0: u32,
    /// True when the status was synthesised locally and never hit the wire
    pub local: bool,
}

impl CommandStatus {
    /// Status synthesised for arguments rejected before submission
    pub fn invalid_argument(opcode: u8) -> Self {
        CommandStatus {
            opcode,
            sct: sct::GENERIC,
            sc: 0x02, // Invalid Field in Command
            dnr: true,
            more: false,
            dw0: 0,
            local: true,
        }
    }

    /// Human-readable description of the status code
    pub fn description(&self) -> &'static str {
        status_description(self.sct, self.sc)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "opcode 0x{:02x}: {} (sct=0x{:x}, sc=0x{:02x}{}{})",
            self.opcode,
            self.description(),
            self.sct,
            self.sc,
            if self.dnr { ", do-not-retry" } else { "" },
            if self.local { ", rejected locally" } else { "" },
        )
    }
}

/// Status Code Type values (CQE status bits 11:9)
pub mod sct {
    pub const GENERIC: u8 = 0x0;
    pub const COMMAND_SPECIFIC: u8 = 0x1;
    pub const MEDIA_ERROR: u8 = 0x2;
    pub const PATH_RELATED: u8 = 0x3;
    pub const VENDOR_SPECIFIC: u8 = 0x7;
}

/// Map a status code type and status code to a human-readable description
pub fn status_description(sct_val: u8, sc: u8) -> &'static str {
    match (sct_val, sc) {
        (sct::GENERIC, 0x00) => "Successful Completion",
        (sct::GENERIC, 0x01) => "Invalid Command Opcode",
        (sct::GENERIC, 0x02) => "Invalid Field in Command",
        (sct::GENERIC, 0x03) => "Command ID Conflict",
        (sct::GENERIC, 0x04) => "Data Transfer Error",
        (sct::GENERIC, 0x05) => "Commands Aborted due to Power Loss Notification",
        (sct::GENERIC, 0x06) => "Internal Error",
        (sct::GENERIC, 0x07) => "Command Abort Requested",
        (sct::GENERIC, 0x08) => "Command Aborted due to SQ Deletion",
        (sct::GENERIC, 0x0B) => "Invalid Namespace or Format",
        (sct::GENERIC, 0x0C) => "Command Sequence Error",
        (sct::GENERIC, 0x18) => "Keep Alive Timer Expired",
        (sct::GENERIC, 0x19) => "Keep Alive Timeout Invalid",
        (sct::GENERIC, 0x80) => "LBA Out of Range",
        (sct::GENERIC, 0x81) => "Capacity Exceeded",
        (sct::GENERIC, 0x82) => "Namespace Not Ready",
        (sct::GENERIC, 0x83) => "Reservation Conflict",
        (sct::GENERIC, 0x84) => "Format In Progress",
        (sct::COMMAND_SPECIFIC, 0x01) => "Invalid Queue Identifier",
        (sct::COMMAND_SPECIFIC, 0x02) => "Invalid Queue Size",
        (sct::COMMAND_SPECIFIC, 0x09) => "Invalid Log Page",
        (sct::COMMAND_SPECIFIC, 0x0A) => "Invalid Format",
        (sct::COMMAND_SPECIFIC, 0x0D) => "Feature Identifier Not Saveable",
        (sct::COMMAND_SPECIFIC, 0x0E) => "Feature Not Changeable",
        (sct::COMMAND_SPECIFIC, 0x0F) => "Feature Not Namespace Specific",
        (sct::COMMAND_SPECIFIC, 0x18) => "Connect Incompatible Format",
        (sct::COMMAND_SPECIFIC, 0x19) => "Connect Invalid Parameters",
        (sct::COMMAND_SPECIFIC, 0x1A) => "Connect Restart Discovery",
        (sct::COMMAND_SPECIFIC, 0x1B) => "Connect Invalid Host",
        (sct::MEDIA_ERROR, 0x80) => "Write Fault",
        (sct::MEDIA_ERROR, 0x81) => "Unrecovered Read Error",
        (sct::MEDIA_ERROR, 0x82) => "End-to-end Guard Check Error",
        (sct::MEDIA_ERROR, 0x83) => "End-to-end Application Tag Check Error",
        (sct::MEDIA_ERROR, 0x84) => "End-to-end Reference Tag Check Error",
        (sct::MEDIA_ERROR, 0x85) => "Compare Failure",
        (sct::MEDIA_ERROR, 0x86) => "Access Denied",
        (sct::MEDIA_ERROR, 0x87) => "Deallocated or Unwritten Logical Block",
        (sct::PATH_RELATED, 0x00) => "Internal Path Error",
        (sct::PATH_RELATED, 0x01) => "Asymmetric Access Persistent Loss",
        (sct::PATH_RELATED, 0x02) => "Asymmetric Access Inaccessible",
        (sct::PATH_RELATED, 0x03) => "Asymmetric Access Transition",
        (sct::VENDOR_SPECIFIC, _) => "Vendor Specific Error",
        _ => "Unknown Status",
    }
}
