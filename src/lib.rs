//! A pure Rust NVMe over Fabrics client for the TCP transport
//!
//! This library speaks NVMe/TCP to a remote controller: it frames and
//! digests PDUs, runs the connection handshake and Fabric Connect, issues
//! Admin and I/O commands over a concurrent command engine, and decodes
//! the results into typed values.
//!
//! # Example
//!
//! ```no_run
//! use nvmeof_tcp::{ClientConfig, NvmeClient, DISCOVERY_NQN};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Discover subsystems behind a discovery controller
//! let discovery = NvmeClient::connect(
//!     ClientConfig::new("10.0.0.1").port(8009).subsystem_nqn(DISCOVERY_NQN),
//! )?;
//! for entry in discovery.get_discovery_entries(16)? {
//!     println!("{} at {}:{}", entry.subnqn, entry.traddr, entry.trsvcid);
//! }
//! discovery.disconnect();
//!
//! // Connect to a storage subsystem and do block I/O
//! let client = NvmeClient::connect(
//!     ClientConfig::new("10.0.0.1")
//!         .subsystem_nqn("nqn.2024-01.com.example:s1")
//!         .kato_ms(5000),
//! )?;
//! let block = client.read_data(1, 0, 1)?;
//! client.write_data(1, 1, &block)?;
//! # Ok(())
//! # }
//! ```

pub mod aen;
pub mod client;
pub mod command;
pub mod engine;
pub mod error;
pub mod identify;
pub mod logpage;
pub mod pdu;
pub mod reservation;
pub mod session;
pub mod transport;

pub use aen::{aen_mask, AsyncEvent};
pub use client::NvmeClient;
pub use error::{CommandStatus, NvmeError, NvmeResult};
pub use identify::{ControllerInfo, LbaFormat, NamespaceInfo};
pub use logpage::{AnaGroup, AnaLogPage, AnaState, DiscoveryEntry, ErrorLogEntry};
pub use reservation::{
    AcquireAction, RegisterAction, ReleaseAction, RegisteredController, ReservationStatus,
    ReservationType,
};
pub use session::{
    ClientConfig, ConnectionState, Negotiated, SessionInfo, DEFAULT_PORT, DISCOVERY_NQN,
    DISCOVERY_PORT,
};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
