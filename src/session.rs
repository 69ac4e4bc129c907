//! NVMe/TCP session management
//!
//! This module handles client configuration, the connection state machine,
//! and the fixed-order initialisation sequence: ICReq/ICResp, Fabric
//! Connect for the admin queue, controller property reads, and controller
//! enable. All of it runs in lockstep over the raw transport, before the
//! background receiver takes ownership of the socket.

use crate::command::{self, property, Cqe, Sqe};
use crate::error::{CommandStatus, NvmeError, NvmeResult};
use crate::pdu::{CapsuleCmd, DigestState, IcReq, Pdu};
use crate::transport::PduTransport;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Well-known NQN of the discovery subsystem
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Default NVMe/TCP port
pub const DEFAULT_PORT: u16 = 4420;

/// Conventional discovery port
pub const DISCOVERY_PORT: u16 = 8009;

/// Client configuration
///
/// ```no_run
/// use nvmeof_tcp::ClientConfig;
///
/// let config = ClientConfig::new("10.0.0.1")
///     .port(4420)
///     .subsystem_nqn("nqn.2024-01.com.example:s1")
///     .kato_ms(5000);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Target hostname or IP
    pub host: String,
    /// Target TCP port
    pub port: u16,
    /// Subsystem to connect to; the discovery NQN if not set
    pub subsystem_nqn: String,
    /// Host NQN identity; auto-generated if not set
    pub host_nqn: Option<String>,
    /// 128-bit host identifier; derived from the host NQN if not set
    pub host_id: Option<[u8; 16]>,
    /// Default per-command timeout
    pub timeout: Duration,
    /// Keep-Alive Timeout in milliseconds; 0 disables keep-alive
    pub kato_ms: u32,
    /// Offer the CRC32C header digest
    pub header_digest: bool,
    /// Offer the CRC32C data digest
    pub data_digest: bool,
    /// Admin/IO queue size in entries
    pub queue_size: u16,
    /// Error immediately instead of blocking when the queue is full
    pub fail_fast: bool,
    /// Maximum outstanding R2Ts proposed in ICReq
    pub maxr2t: u32,
}

impl ClientConfig {
    pub fn new(host: &str) -> Self {
        ClientConfig {
            host: host.to_string(),
            port: DEFAULT_PORT,
            subsystem_nqn: DISCOVERY_NQN.to_string(),
            host_nqn: None,
            host_id: None,
            timeout: Duration::from_secs(30),
            kato_ms: 0,
            header_digest: true,
            data_digest: true,
            queue_size: 32,
            fail_fast: false,
            maxr2t: 4,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn subsystem_nqn(mut self, nqn: &str) -> Self {
        self.subsystem_nqn = nqn.to_string();
        self
    }

    pub fn host_nqn(mut self, nqn: &str) -> Self {
        self.host_nqn = Some(nqn.to_string());
        self
    }

    pub fn host_id(mut self, id: [u8; 16]) -> Self {
        self.host_id = Some(id);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn kato_ms(mut self, kato: u32) -> Self {
        self.kato_ms = kato;
        self
    }

    pub fn header_digest(mut self, enabled: bool) -> Self {
        self.header_digest = enabled;
        self
    }

    pub fn data_digest(mut self, enabled: bool) -> Self {
        self.data_digest = enabled;
        self
    }

    pub fn queue_size(mut self, entries: u16) -> Self {
        self.queue_size = entries;
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    fn validate(&self) -> NvmeResult<()> {
        if self.host.is_empty() {
            return Err(NvmeError::Connection("host must not be empty".to_string()));
        }
        if !self.subsystem_nqn.starts_with("nqn.") {
            return Err(NvmeError::Connection(format!(
                "subsystem_nqn must be in NQN format, got {:?}",
                self.subsystem_nqn
            )));
        }
        if let Some(nqn) = &self.host_nqn {
            if !nqn.starts_with("nqn.") {
                return Err(NvmeError::Connection(format!(
                    "host_nqn must be in NQN format, got {:?}",
                    nqn
                )));
            }
        }
        if self.queue_size < 2 {
            return Err(NvmeError::Connection(
                "queue_size must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generate a host NQN in the UUID form recommended by the base spec
pub fn default_host_nqn() -> String {
    format!("nqn.2014-08.org.nvmexpress:uuid:{}", uuid::Uuid::new_v4())
}

/// Derive the 128-bit host identifier from a host NQN
///
/// Deterministic: the first 16 bytes of SHA-256 over the NQN bytes.
pub fn derive_host_id(host_nqn: &str) -> [u8; 16] {
    let digest = Sha256::digest(host_nqn.as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    id
}

/// Connection state machine
///
/// Only `Active` accepts user commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Initial state, and final state after disconnect
    #[default]
    Closed,
    /// TCP established, ICReq not yet answered
    TcpConnected,
    /// ICReq/ICResp done
    IcComplete,
    /// Fabric Connect done
    AdminReady,
    /// Normal operation
    Active,
    /// Fatal error seen, draining outstanding commands
    Failing,
}

/// Connection state shared between the facade, session, and engine threads
#[derive(Clone, Default)]
pub struct SharedState(Arc<Mutex<ConnectionState>>);

impl SharedState {
    pub fn new() -> Self {
        SharedState::default()
    }

    pub fn get(&self) -> ConnectionState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, state: ConnectionState) {
        let mut cur = self.0.lock().unwrap_or_else(|e| e.into_inner());
        log::debug!("connection state {:?} -> {:?}", *cur, state);
        *cur = state;
    }

    pub fn is_active(&self) -> bool {
        self.get() == ConnectionState::Active
    }
}

/// Parameters negotiated by ICReq/ICResp, immutable afterwards
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    pub header_digest: bool,
    pub data_digest: bool,
    /// Maximum data length per H2CData PDU
    pub maxh2cdata: u32,
    /// Controller data alignment for host-sent PDU data
    pub cpda: u8,
}

/// Controller session established by Fabric Connect and property reads
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub controller_id: u16,
    pub subsystem_nqn: String,
    pub host_nqn: String,
    /// Keep-Alive Timeout granted, in milliseconds
    pub kato_ms: u32,
    /// Usable queue depth: min(CAP.MQES + 1, configured queue size)
    pub max_queue_entries: u16,
    /// Controller Capabilities property
    pub cap: u64,
    /// Controller version property
    pub vs: u32,
}

/// An initialised NVMe/TCP session, ready for the command engine
pub struct Session {
    pub transport: Arc<PduTransport>,
    pub negotiated: Negotiated,
    pub info: SessionInfo,
    pub state: SharedState,
}

impl Session {
    /// Connect and run the initialisation sequence through `Active`
    pub fn establish(config: &ClientConfig) -> NvmeResult<Session> {
        config.validate()?;

        let host_nqn = config
            .host_nqn
            .clone()
            .unwrap_or_else(default_host_nqn);
        let host_id = config.host_id.unwrap_or_else(|| derive_host_id(&host_nqn));
        log::info!(
            "connecting to {}:{} subsystem {}",
            config.host,
            config.port,
            config.subsystem_nqn
        );
        log::debug!("host nqn {}, host id {}", host_nqn, hex::encode(host_id));

        let state = SharedState::new();
        let transport = Arc::new(PduTransport::connect(
            &config.host,
            config.port,
            config.timeout,
        )?);
        state.set(ConnectionState::TcpConnected);

        let mut session = HandshakeCtx {
            transport: &transport,
            timeout: config.timeout,
            next_cid: 0,
        };

        // Step 1: initialise the connection
        let negotiated = match session.initialise(config) {
            Ok(n) => n,
            Err(e) => {
                state.set(ConnectionState::Closed);
                transport.close();
                return Err(e);
            }
        };
        state.set(ConnectionState::IcComplete);

        // Steps 2-4: Connect, properties, controller enable
        let result = session.admin_connect(config, &host_id, &host_nqn, &state);
        let info = match result {
            Ok(info) => info,
            Err(e) => {
                state.set(ConnectionState::Closed);
                transport.close();
                return Err(e);
            }
        };

        state.set(ConnectionState::Active);
        log::info!(
            "session active: controller {} at {}",
            info.controller_id,
            transport.peer_addr()
        );

        Ok(Session {
            transport,
            negotiated,
            info,
            state,
        })
    }
}

/// Lockstep request/response context used only during initialisation
struct HandshakeCtx<'a> {
    transport: &'a Arc<PduTransport>,
    timeout: Duration,
    next_cid: u16,
}

impl HandshakeCtx<'_> {
    fn initialise(&mut self, config: &ClientConfig) -> NvmeResult<Negotiated> {
        let icreq = IcReq {
            pfv: 0,
            hpda: 0,
            digest: DigestState {
                header: config.header_digest,
                data: config.data_digest,
            },
            maxr2t: config.maxr2t,
        };
        self.transport.send_pdu(&Pdu::IcReq(icreq))?;

        let icresp = match self.transport.recv_pdu(Some(self.timeout))? {
            Pdu::IcResp(resp) => resp,
            other => {
                return Err(NvmeError::Protocol(format!(
                    "expected ICResp, got {}",
                    other.type_name()
                )))
            }
        };

        if icresp.pfv != 0 {
            return Err(NvmeError::Connection(format!(
                "controller PDU format version 0x{:04x} not supported",
                icresp.pfv
            )));
        }
        // The controller may only enable digests the host offered
        if (icresp.digest.header && !config.header_digest)
            || (icresp.digest.data && !config.data_digest)
        {
            return Err(NvmeError::Protocol(
                "controller enabled a digest the host did not offer".to_string(),
            ));
        }
        if icresp.maxh2cdata < 4096 {
            return Err(NvmeError::Protocol(format!(
                "MAXH2CDATA {} below the 4096-byte minimum",
                icresp.maxh2cdata
            )));
        }

        let negotiated = Negotiated {
            header_digest: icresp.digest.header,
            data_digest: icresp.digest.data,
            maxh2cdata: icresp.maxh2cdata,
            cpda: icresp.cpda,
        };
        self.transport
            .set_negotiated(icresp.digest, icresp.cpda);
        log::debug!(
            "connection initialised: hdgst={} ddgst={} maxh2cdata={} cpda={}",
            negotiated.header_digest,
            negotiated.data_digest,
            negotiated.maxh2cdata,
            negotiated.cpda
        );
        Ok(negotiated)
    }

    fn admin_connect(
        &mut self,
        config: &ClientConfig,
        host_id: &[u8; 16],
        host_nqn: &str,
        state: &SharedState,
    ) -> NvmeResult<SessionInfo> {
        // Fabric Connect for the admin queue (SQID 0); SQSIZE is 0's based
        let cid = self.alloc_cid();
        let sqe = Sqe::fabric_connect(cid, 0, config.queue_size - 1, 0, config.kato_ms);
        let data = command::connect_data(host_id, &config.subsystem_nqn, host_nqn)?;
        let cqe = self.roundtrip(sqe, data)?;
        let controller_id = (cqe.dw0 & 0xFFFF) as u16;
        log::debug!("fabric connect done, controller id {}", controller_id);
        state.set(ConnectionState::AdminReady);

        // Read capabilities and version
        let cap = self.property_get(property::CAP, true)?;
        let vs = self.property_get(property::VS, false)? as u32;
        let mqes = (cap & 0xFFFF) as u16;
        let ready_timeout = Duration::from_millis(500) * ((cap >> 24) & 0xFF).max(1) as u32;
        log::debug!(
            "controller CAP {:#018x} (MQES {}), VS {}.{}",
            cap,
            mqes,
            vs >> 16,
            (vs >> 8) & 0xFF
        );

        // Enable the controller: IOSQES 6, IOCQES 4, CSS NVM, EN
        self.property_set(property::CC, 0x0046_0001, false)?;
        self.wait_ready(ready_timeout)?;

        Ok(SessionInfo {
            controller_id,
            subsystem_nqn: config.subsystem_nqn.clone(),
            host_nqn: host_nqn.to_string(),
            kato_ms: config.kato_ms,
            max_queue_entries: config.queue_size.min(mqes.saturating_add(1)),
            cap,
            vs,
        })
    }

    fn property_get(&mut self, offset: u32, size8: bool) -> NvmeResult<u64> {
        let cid = self.alloc_cid();
        let cqe = self.roundtrip(Sqe::property_get(cid, offset, size8), Vec::new())?;
        Ok(if size8 {
            cqe.property_value()
        } else {
            cqe.dw0 as u64
        })
    }

    fn property_set(&mut self, offset: u32, value: u64, size8: bool) -> NvmeResult<()> {
        let cid = self.alloc_cid();
        self.roundtrip(Sqe::property_set(cid, offset, value, size8), Vec::new())?;
        Ok(())
    }

    /// Poll CSTS until the controller reports ready
    fn wait_ready(&mut self, ready_timeout: Duration) -> NvmeResult<()> {
        let deadline = Instant::now() + ready_timeout;
        loop {
            let csts = self.property_get(property::CSTS, false)?;
            if csts & 0x2 != 0 {
                return Err(NvmeError::Connection(
                    "controller reports fatal status".to_string(),
                ));
            }
            if csts & 0x1 != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NvmeError::Timeout(format!(
                    "controller not ready within {:?}",
                    ready_timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn alloc_cid(&mut self) -> u16 {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        cid
    }

    /// Send one command capsule and wait for its response capsule
    fn roundtrip(&mut self, sqe: Sqe, data: Vec<u8>) -> NvmeResult<Cqe> {
        let opcode = sqe.opcode;
        let cid = sqe.cid;
        self.transport
            .send_pdu(&Pdu::CapsuleCmd(CapsuleCmd { sqe, data }))?;

        let cqe = match self.transport.recv_pdu(Some(self.timeout))? {
            Pdu::CapsuleResp(resp) => resp.cqe,
            other => {
                return Err(NvmeError::Protocol(format!(
                    "expected CapsuleResp during initialisation, got {}",
                    other.type_name()
                )))
            }
        };
        if cqe.cid != cid {
            return Err(NvmeError::Protocol(format!(
                "response for command id {} while {} was outstanding",
                cqe.cid, cid
            )));
        }
        if cqe.is_error() {
            return Err(NvmeError::Command(CommandStatus {
                opcode,
                sct: cqe.sct(),
                sc: cqe.sc(),
                dnr: cqe.dnr(),
                more: cqe.more(),
                dw0: cqe.dw0,
                local: false,
            }));
        }
        Ok(cqe)
    }
}
