//! NVMe over Fabrics client facade
//!
//! `NvmeClient` wraps the command engine with typed entry points: each
//! operation builds the appropriate submission entry, submits it, and
//! decodes the completion payload into an application-level value.
//!
//! # Example
//!
//! ```no_run
//! use nvmeof_tcp::{ClientConfig, NvmeClient};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = NvmeClient::connect(
//!     ClientConfig::new("10.0.0.1").subsystem_nqn("nqn.2024-01.com.example:s1"),
//! )?;
//!
//! let ctrl = client.controller_info();
//! println!("connected to {} ({})", ctrl.model_number, ctrl.serial_number);
//!
//! for nsid in client.list_namespaces()? {
//!     let ns = client.identify_namespace(nsid)?;
//!     println!("namespace {}: {} blocks of {} bytes", nsid, ns.nsze, ns.block_size());
//! }
//!
//! let data = client.read_data(1, 0, 8)?;
//! client.write_data(1, 8, &data)?;
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

use crate::aen::AsyncEvent;
use crate::command::{
    self, admin_opcode, cns, feature_id, nvm_opcode, Cqe, Sqe,
};
use crate::engine::{CommandEngine, EngineConfig};
use crate::error::{CommandStatus, NvmeError, NvmeResult};
use crate::identify::{
    parse_namespace_list, ControllerInfo, NamespaceInfo, IDENTIFY_SIZE,
};
use crate::logpage::{
    log_page_id, AnaLogPage, DiscoveryEntry, DiscoveryLogPage, ErrorLogEntry,
    DISCOVERY_RECORD_SIZE,
};
use crate::reservation::{
    AcquireAction, RegisterAction, ReleaseAction, ReservationStatus, ReservationType,
};
use crate::session::{ClientConfig, ConnectionState, Negotiated, Session, SessionInfo};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Largest block count expressible in the 16-bit 0's based NLB field
const MAX_BLOCKS_PER_COMMAND: u64 = 65536;

/// A connected NVMe/TCP client
///
/// All operations are blocking request/response; the asynchronous event
/// channel is the one exception, drained explicitly with
/// [`poll_async_events`](NvmeClient::poll_async_events).
pub struct NvmeClient {
    engine: Arc<CommandEngine>,
    session: SessionInfo,
    negotiated: Negotiated,
    controller: ControllerInfo,
    /// Logical block sizes by NSID, filled lazily by Identify Namespace
    block_sizes: Mutex<HashMap<u32, u32>>,
}

impl NvmeClient {
    /// Connect to a controller and bring the session to `Active`
    ///
    /// Runs ICReq/ICResp, Fabric Connect, property reads, and controller
    /// enable, then starts the background receiver (and keep-alive when
    /// KATO is non-zero) and caches Identify Controller data.
    pub fn connect(config: ClientConfig) -> NvmeResult<NvmeClient> {
        let session = Session::establish(&config)?;
        let engine = CommandEngine::start(
            Arc::clone(&session.transport),
            session.state.clone(),
            EngineConfig {
                max_queue_entries: session.info.max_queue_entries,
                default_timeout: config.timeout,
                kato_ms: config.kato_ms,
                fail_fast: config.fail_fast,
                maxh2cdata: session.negotiated.maxh2cdata,
            },
        )?;

        let controller = match fetch_controller_info(&engine) {
            Ok(info) => info,
            Err(e) => {
                engine.stop();
                return Err(e);
            }
        };
        engine.set_incapsule_limit(controller.incapsule_data_limit());
        log::debug!(
            "controller {} ({}), in-capsule data limit {} bytes",
            controller.model_number,
            controller.serial_number,
            controller.incapsule_data_limit()
        );

        Ok(NvmeClient {
            engine,
            session: session.info,
            negotiated: session.negotiated,
            controller,
            block_sizes: Mutex::new(HashMap::new()),
        })
    }

    /// Close the connection, failing any outstanding commands
    ///
    /// Idempotent; also invoked on drop.
    pub fn disconnect(&self) {
        log::info!("disconnecting from {}", self.session.subsystem_nqn);
        self.engine.stop();
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        // The engine owns the live state; the session struct seeded it
        self.engine.state()
    }

    /// Identify Controller data cached at connect time
    pub fn controller_info(&self) -> &ControllerInfo {
        &self.controller
    }

    pub fn session_info(&self) -> &SessionInfo {
        &self.session
    }

    /// Parameters negotiated during connection initialisation
    pub fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    // ------------------------------------------------------------------
    // Identify
    // ------------------------------------------------------------------

    /// Fetch fresh Identify Controller data (Admin 0x06, CNS 0x01)
    pub fn identify_controller(&self) -> NvmeResult<ControllerInfo> {
        let data = self.identify_raw(cns::CONTROLLER, 0)?;
        ControllerInfo::parse(&data)
    }

    /// Fetch Identify Namespace data (Admin 0x06, CNS 0x00)
    pub fn identify_namespace(&self, nsid: u32) -> NvmeResult<NamespaceInfo> {
        if nsid == 0 {
            return Err(invalid_argument(admin_opcode::IDENTIFY));
        }
        let data = self.identify_raw(cns::NAMESPACE, nsid)?;
        let info = NamespaceInfo::parse(&data)?;
        self.block_sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(nsid, info.block_size());
        Ok(info)
    }

    /// Ordered list of active namespace ids (Admin 0x06, CNS 0x02)
    pub fn list_namespaces(&self) -> NvmeResult<Vec<u32>> {
        let data = self.identify_raw(cns::ACTIVE_NAMESPACE_LIST, 0)?;
        parse_namespace_list(&data)
    }

    fn identify_raw(&self, cns_value: u8, nsid: u32) -> NvmeResult<Vec<u8>> {
        let (_, data) = self.engine.submit(
            |cid| Sqe::identify(cid, cns_value, nsid),
            None,
            IDENTIFY_SIZE,
            None,
        )?;
        data.ok_or_else(|| {
            NvmeError::Protocol("Identify completed without data".to_string())
        })
    }

    // ------------------------------------------------------------------
    // Log pages
    // ------------------------------------------------------------------

    /// Fetch `size` bytes of log page `lid` (Admin 0x02)
    pub fn get_log_page(&self, lid: u8, nsid: u32, size: usize) -> NvmeResult<Vec<u8>> {
        if size == 0 {
            return Err(invalid_argument(admin_opcode::GET_LOG_PAGE));
        }
        // The wire length is dword-granular
        let wire_len = size.div_ceil(4) * 4;
        let (_, data) = self.engine.submit(
            |cid| Sqe::get_log_page(cid, lid, nsid, wire_len as u32),
            None,
            wire_len,
            None,
        )?;
        let mut data = data.ok_or_else(|| {
            NvmeError::Protocol("Get Log Page completed without data".to_string())
        })?;
        data.truncate(size);
        Ok(data)
    }

    /// Fetch and parse the ANA log page (LID 0x0C)
    pub fn get_ana_log_page(&self) -> NvmeResult<AnaLogPage> {
        let data = self.get_log_page(log_page_id::ANA, 0, 4096)?;
        AnaLogPage::parse(&data)
    }

    /// Fetch discovery log entries (LID 0x70), up to `max_entries`
    ///
    /// Reads the header first, then the records it announces. A change of
    /// the generation counter between the two reads means the log was
    /// modified mid-fetch and is reported as a protocol error.
    pub fn get_discovery_entries(&self, max_entries: usize) -> NvmeResult<Vec<DiscoveryEntry>> {
        let header = self.get_log_page(log_page_id::DISCOVERY, 0, DISCOVERY_RECORD_SIZE)?;
        let log = DiscoveryLogPage::parse(&header)?;
        if log.numrec == 0 || max_entries == 0 {
            return Ok(Vec::new());
        }

        let want = (log.numrec as usize).min(max_entries);
        let full = self.get_log_page(
            log_page_id::DISCOVERY,
            0,
            DISCOVERY_RECORD_SIZE * (want + 1),
        )?;
        let mut parsed = DiscoveryLogPage::parse(&full)?;
        if parsed.genctr != log.genctr {
            return Err(NvmeError::Protocol(format!(
                "discovery log changed during fetch (genctr {} -> {})",
                log.genctr, parsed.genctr
            )));
        }
        parsed.entries.truncate(want);
        Ok(parsed.entries)
    }

    /// Fetch and parse the error information log (LID 0x01)
    pub fn get_error_log(&self, entries: usize) -> NvmeResult<Vec<ErrorLogEntry>> {
        if entries == 0 {
            return Err(invalid_argument(admin_opcode::GET_LOG_PAGE));
        }
        let data = self.get_log_page(log_page_id::ERROR_INFORMATION, 0, entries * 64)?;
        crate::logpage::parse_error_log(&data)
    }

    // ------------------------------------------------------------------
    // I/O
    // ------------------------------------------------------------------

    /// Read `nblocks` logical blocks starting at `lba` (NVM 0x02)
    ///
    /// Returns exactly `nblocks * block_size` bytes.
    pub fn read_data(&self, nsid: u32, lba: u64, nblocks: u32) -> NvmeResult<Vec<u8>> {
        if nblocks == 0 || nblocks as u64 > MAX_BLOCKS_PER_COMMAND {
            return Err(invalid_argument(nvm_opcode::READ));
        }
        let block_size = self.block_size(nsid)?;
        let len = nblocks as usize * block_size as usize;
        let (_, data) = self.engine.submit(
            |cid| Sqe::read(cid, nsid, lba, nblocks, len as u32),
            None,
            len,
            None,
        )?;
        data.ok_or_else(|| NvmeError::Protocol("Read completed without data".to_string()))
    }

    /// Write `data` starting at `lba` (NVM 0x01)
    ///
    /// The length must be a non-zero multiple of the namespace block size.
    /// The payload goes in-capsule when it fits the negotiated capsule
    /// size, otherwise through the R2T path.
    pub fn write_data(&self, nsid: u32, lba: u64, data: &[u8]) -> NvmeResult<()> {
        let block_size = self.block_size(nsid)? as usize;
        if data.is_empty() || data.len() % block_size != 0 {
            return Err(invalid_argument(nvm_opcode::WRITE));
        }
        let nblocks = (data.len() / block_size) as u64;
        if nblocks > MAX_BLOCKS_PER_COMMAND {
            return Err(invalid_argument(nvm_opcode::WRITE));
        }
        self.engine.submit(
            |cid| Sqe::write(cid, nsid, lba, nblocks as u32, data.len() as u32),
            Some(data.to_vec()),
            0,
            None,
        )?;
        Ok(())
    }

    /// Zero `nblocks` logical blocks starting at `lba` (NVM 0x08)
    pub fn write_zeroes(&self, nsid: u32, lba: u64, nblocks: u32) -> NvmeResult<()> {
        if nblocks == 0 || nblocks as u64 > MAX_BLOCKS_PER_COMMAND {
            return Err(invalid_argument(nvm_opcode::WRITE_ZEROES));
        }
        self.engine
            .submit(|cid| Sqe::write_zeroes(cid, nsid, lba, nblocks), None, 0, None)?;
        Ok(())
    }

    /// Flush the namespace's volatile write cache (NVM 0x00)
    pub fn flush_namespace(&self, nsid: u32) -> NvmeResult<()> {
        self.engine
            .submit(|cid| Sqe::flush(cid, nsid), None, 0, None)?;
        Ok(())
    }

    /// Deallocate `nblocks` logical blocks starting at `lba` (NVM 0x09, AD)
    pub fn deallocate(&self, nsid: u32, lba: u64, nblocks: u32) -> NvmeResult<()> {
        if nblocks == 0 {
            return Err(invalid_argument(nvm_opcode::DATASET_MANAGEMENT));
        }
        let range = command::dsm_range(lba, nblocks);
        self.engine.submit(
            |cid| Sqe::dataset_management(cid, nsid),
            Some(range),
            0,
            None,
        )?;
        Ok(())
    }

    /// Logical block size of a namespace, from the local cache or Identify
    pub fn block_size(&self, nsid: u32) -> NvmeResult<u32> {
        if let Some(&size) = self
            .block_sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&nsid)
        {
            return Ok(size);
        }
        Ok(self.identify_namespace(nsid)?.block_size())
    }

    // ------------------------------------------------------------------
    // Features and properties
    // ------------------------------------------------------------------

    /// Get Features (Admin 0x0A); returns the completion DW0 value
    pub fn get_features(&self, fid: u8, nsid: u32) -> NvmeResult<u32> {
        let (cqe, _) = self
            .engine
            .submit(|cid| Sqe::get_features(cid, fid, nsid), None, 0, None)?;
        Ok(cqe.dw0)
    }

    /// Set Features (Admin 0x09); returns the completion DW0 value
    pub fn set_features(&self, fid: u8, value: u32, nsid: u32) -> NvmeResult<u32> {
        let (cqe, _) = self.engine.submit(
            |cid| Sqe::set_features(cid, fid, value, nsid),
            None,
            0,
            None,
        )?;
        Ok(cqe.dw0)
    }

    /// Read a controller property (fabrics Property Get)
    pub fn property_get(&self, offset: u32, size8: bool) -> NvmeResult<u64> {
        let (cqe, _) = self.engine.submit(
            |cid| Sqe::property_get(cid, offset, size8),
            None,
            0,
            None,
        )?;
        Ok(if size8 {
            cqe.property_value()
        } else {
            cqe.dw0 as u64
        })
    }

    /// Write a controller property (fabrics Property Set)
    pub fn property_set(&self, offset: u32, value: u64, size8: bool) -> NvmeResult<()> {
        self.engine.submit(
            |cid| Sqe::property_set(cid, offset, value, size8),
            None,
            0,
            None,
        )?;
        Ok(())
    }

    /// Send one Keep-Alive command (Admin 0x18)
    pub fn keep_alive(&self) -> NvmeResult<()> {
        self.engine.submit(Sqe::keep_alive, None, 0, None)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reservations
    // ------------------------------------------------------------------

    /// Register, replace, or unregister a reservation key (NVM 0x0D)
    ///
    /// The action is derived from the keys: a zero `new_key` unregisters
    /// `current_key`; a zero `current_key` registers `new_key`; both
    /// non-zero replaces one with the other.
    pub fn reservation_register(
        &self,
        nsid: u32,
        current_key: u64,
        new_key: u64,
        cptpl: u8,
    ) -> NvmeResult<()> {
        let action = if new_key == 0 {
            RegisterAction::Unregister
        } else if current_key == 0 {
            RegisterAction::Register
        } else {
            RegisterAction::Replace
        };
        let payload = command::reservation_register_data(current_key, new_key);
        self.engine.submit(
            |cid| Sqe::reservation_register(cid, nsid, action as u8, cptpl),
            Some(payload),
            0,
            None,
        )?;
        Ok(())
    }

    /// Acquire or preempt a reservation (NVM 0x11)
    pub fn reservation_acquire(
        &self,
        nsid: u32,
        key: u64,
        rtype: ReservationType,
        action: AcquireAction,
    ) -> NvmeResult<()> {
        let payload = command::reservation_acquire_data(key, 0);
        self.engine.submit(
            |cid| Sqe::reservation_acquire(cid, nsid, action as u8, rtype as u8),
            Some(payload),
            0,
            None,
        )?;
        Ok(())
    }

    /// Release a held reservation (NVM 0x15)
    pub fn reservation_release(
        &self,
        nsid: u32,
        key: u64,
        rtype: ReservationType,
    ) -> NvmeResult<()> {
        let payload = command::reservation_release_data(key);
        self.engine.submit(
            |cid| {
                Sqe::reservation_release(cid, nsid, ReleaseAction::Release as u8, rtype as u8)
            },
            Some(payload),
            0,
            None,
        )?;
        Ok(())
    }

    /// Fetch and parse the reservation state of a namespace (NVM 0x0E)
    pub fn reservation_report(&self, nsid: u32) -> NvmeResult<ReservationStatus> {
        let len = 4096;
        let (_, data) = self.engine.submit(
            |cid| Sqe::reservation_report(cid, nsid, len as u32, false),
            None,
            len,
            None,
        )?;
        let data = data.ok_or_else(|| {
            NvmeError::Protocol("Reservation Report completed without data".to_string())
        })?;
        ReservationStatus::parse(&data, false)
    }

    // ------------------------------------------------------------------
    // Asynchronous events
    // ------------------------------------------------------------------

    /// Configure which event classes the controller may report
    ///
    /// `mask` is the Asynchronous Event Configuration feature value; see
    /// [`crate::aen::aen_mask`].
    pub fn enable_async_events(&self, mask: u32) -> NvmeResult<()> {
        self.set_features(feature_id::ASYNC_EVENT_CONFIG, mask, 0)?;
        Ok(())
    }

    /// Pre-post `n` Asynchronous Event Requests (Admin 0x0C)
    ///
    /// Completions are queued as [`AsyncEvent`]s. The engine does not
    /// re-post: call this again after draining to keep the channel primed.
    pub fn request_async_events(&self, n: usize) -> NvmeResult<()> {
        for _ in 0..n {
            self.engine.post_async_event_request()?;
        }
        Ok(())
    }

    /// Drain queued events, waiting up to `timeout` for the first
    pub fn poll_async_events(&self, timeout: Duration) -> Vec<AsyncEvent> {
        self.engine.poll_async_events(timeout)
    }

    /// Events dropped so far due to AEN queue overflow
    pub fn aen_overflow_count(&self) -> u64 {
        self.engine.aen_overflow_count()
    }

    /// Number of commands currently in flight
    pub fn in_flight(&self) -> usize {
        self.engine.in_flight()
    }
}

impl Drop for NvmeClient {
    fn drop(&mut self) {
        self.engine.stop();
    }
}

/// Identify the controller through the engine during connect
fn fetch_controller_info(engine: &Arc<CommandEngine>) -> NvmeResult<ControllerInfo> {
    let (_, data): (Cqe, Option<Vec<u8>>) = engine.submit(
        |cid| Sqe::identify(cid, cns::CONTROLLER, 0),
        None,
        IDENTIFY_SIZE,
        None,
    )?;
    let data = data.ok_or_else(|| {
        NvmeError::Protocol("Identify Controller completed without data".to_string())
    })?;
    ControllerInfo::parse(&data)
}

fn invalid_argument(opcode: u8) -> NvmeError {
    NvmeError::Command(CommandStatus::invalid_argument(opcode))
}
