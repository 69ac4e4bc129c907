//! Command engine: submission, correlation, and the background receiver
//!
//! One receiver thread per connection owns the socket for reading and
//! demultiplexes incoming PDUs onto per-command slots. Callers submit
//! commands, then block on a single-shot rendezvous until the receiver,
//! the timeout sweep, or connection teardown delivers an outcome.

use crate::aen::AsyncEvent;
use crate::command::{sgl_incapsule, Cqe, Sqe};
use crate::error::{CommandStatus, NvmeError, NvmeResult};
use crate::pdu::{fes, C2hData, CapsuleCmd, H2cData, Pdu, R2t, TermReq};
use crate::session::{ConnectionState, SharedState};
use crate::transport::PduTransport;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Resolution of the deadline sweep
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the asynchronous event queue
pub const AEN_QUEUE_CAPACITY: usize = 64;

type Outcome = NvmeResult<(Cqe, Option<Vec<u8>>)>;

/// One in-flight command
struct Slot {
    opcode: u8,
    /// None for pre-posted async event requests, which have no deadline
    deadline: Option<Instant>,
    /// Rendezvous back to the submitting caller; None for AEN slots
    tx: Option<SyncSender<Outcome>>,
    /// Assembly buffer for data-in commands, written by C2HData offset
    read_buf: Option<Vec<u8>>,
    /// True once the last data PDU arrived (or no data was expected)
    data_done: bool,
    /// Pending payload for data-out commands serviced through R2T
    write_data: Option<Vec<u8>>,
    /// Completion held back because data PDUs were still in flight
    cqe: Option<Cqe>,
    aen: bool,
}

/// Command-id space and live slots, guarded by one mutex
///
/// Invariant: no two live slots share a command id.
struct Registry {
    slots: HashMap<u16, Slot>,
    free_ids: Vec<u16>,
    next_id: u16,
    limit: usize,
}

impl Registry {
    fn new(limit: usize) -> Self {
        Registry {
            slots: HashMap::new(),
            free_ids: Vec::new(),
            next_id: 0,
            limit,
        }
    }

    /// Allocate a command id, or None when the queue is at capacity
    fn alloc_id(&mut self) -> Option<u16> {
        if self.slots.len() >= self.limit {
            return None;
        }
        if let Some(id) = self.free_ids.pop() {
            return Some(id);
        }
        // Monotonic counter wrapped to 16 bits, skipping ids still live
        for _ in 0..=u16::MAX as u32 {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.slots.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn release(&mut self, cid: u16) {
        self.free_ids.push(cid);
    }
}

/// Bounded FIFO of decoded async events with drop-oldest overflow
struct AenChannel {
    inner: Mutex<AenState>,
    avail: Condvar,
}

struct AenState {
    events: VecDeque<AsyncEvent>,
    dropped: u64,
}

impl AenChannel {
    fn new() -> Self {
        AenChannel {
            inner: Mutex::new(AenState {
                events: VecDeque::new(),
                dropped: 0,
            }),
            avail: Condvar::new(),
        }
    }

    fn push(&self, event: AsyncEvent) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.events.len() >= AEN_QUEUE_CAPACITY {
            state.events.pop_front();
            state.dropped += 1;
            log::warn!("async event queue overflow, oldest event dropped");
        }
        state.events.push_back(event);
        self.avail.notify_all();
    }

    /// Wait up to `timeout` for at least one event, then drain them all
    fn poll(&self, timeout: Duration, stopped: &AtomicBool) -> Vec<AsyncEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        while state.events.is_empty() && !stopped.load(Ordering::SeqCst) {
            let Some(wait) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            let (guard, result) = self
                .avail
                .wait_timeout(state, wait)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            if result.timed_out() {
                break;
            }
        }
        state.events.drain(..).collect()
    }

    fn dropped(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }
}

/// Engine construction parameters, taken from the negotiated session
pub struct EngineConfig {
    pub max_queue_entries: u16,
    pub default_timeout: Duration,
    pub kato_ms: u32,
    pub fail_fast: bool,
    pub maxh2cdata: u32,
}

/// The per-connection command engine
pub struct CommandEngine {
    transport: Arc<PduTransport>,
    state: SharedState,
    registry: Mutex<Registry>,
    slot_freed: Condvar,
    aen: AenChannel,
    /// Largest data-out payload carried in-capsule; 0 forces the R2T path
    incapsule_max: AtomicUsize,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    default_timeout: Duration,
    fail_fast: bool,
    maxh2cdata: u32,
    kato_ms: u32,
}

impl CommandEngine {
    /// Spawn the receiver (and keep-alive, if enabled) threads
    pub fn start(
        transport: Arc<PduTransport>,
        state: SharedState,
        config: EngineConfig,
    ) -> NvmeResult<Arc<CommandEngine>> {
        let engine = Arc::new(CommandEngine {
            transport,
            state,
            registry: Mutex::new(Registry::new(config.max_queue_entries as usize)),
            slot_freed: Condvar::new(),
            aen: AenChannel::new(),
            incapsule_max: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            default_timeout: config.default_timeout,
            fail_fast: config.fail_fast,
            maxh2cdata: config.maxh2cdata,
            kato_ms: config.kato_ms,
        });

        let receiver = Arc::clone(&engine);
        let handle = std::thread::Builder::new()
            .name("nvme-recv".to_string())
            .spawn(move || receiver.receiver_loop())
            .map_err(NvmeError::from)?;
        engine
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);

        if config.kato_ms > 0 {
            let keepalive = Arc::clone(&engine);
            let handle = std::thread::Builder::new()
                .name("nvme-keepalive".to_string())
                .spawn(move || keepalive.keepalive_loop())
                .map_err(NvmeError::from)?;
            engine
                .threads
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
        }

        Ok(engine)
    }

    /// Raise the in-capsule data threshold once IOCCSZ is known
    pub fn set_incapsule_limit(&self, bytes: usize) {
        self.incapsule_max.store(bytes, Ordering::SeqCst);
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Number of live command slots
    pub fn in_flight(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .slots
            .len()
    }

    pub fn aen_overflow_count(&self) -> u64 {
        self.aen.dropped()
    }

    /// Submit one command and block until its outcome
    ///
    /// `build` receives the allocated command id. A data-out payload is
    /// carried in-capsule when it fits the negotiated threshold, otherwise
    /// it is retained for R2T servicing. `data_in_len` sizes the buffer
    /// assembled from C2HData PDUs.
    pub fn submit(
        &self,
        build: impl FnOnce(u16) -> Sqe,
        data_out: Option<Vec<u8>>,
        data_in_len: usize,
        timeout: Option<Duration>,
    ) -> NvmeResult<(Cqe, Option<Vec<u8>>)> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let (tx, rx) = mpsc::sync_channel(1);

        // Build the SQE and insert the slot under the allocation lock so
        // the id can never be handed out twice
        let (cid, sqe, capsule_data) = {
            let (mut reg, cid) = self.alloc_cid(deadline)?;
            let mut sqe = build(cid);
            let mut slot = Slot {
                opcode: sqe.opcode,
                deadline: Some(deadline),
                tx: Some(tx),
                read_buf: if data_in_len > 0 {
                    Some(vec![0u8; data_in_len])
                } else {
                    None
                },
                data_done: data_in_len == 0,
                write_data: None,
                cqe: None,
                aen: false,
            };

            let mut capsule_data = Vec::new();
            if let Some(data) = data_out {
                if data.len() <= self.incapsule_max.load(Ordering::SeqCst) {
                    sqe.dptr = sgl_incapsule(data.len() as u32);
                    capsule_data = data;
                } else {
                    slot.write_data = Some(data);
                }
            }
            reg.slots.insert(cid, slot);
            (cid, sqe, capsule_data)
        };

        if let Err(e) = self.transport.send_pdu(&Pdu::CapsuleCmd(CapsuleCmd {
            sqe,
            data: capsule_data,
        })) {
            self.drop_slot(cid);
            self.fatal(e.clone());
            return Err(e);
        }

        match rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(NvmeError::Connection("command engine stopped".to_string())),
        }
    }

    /// Pre-post one Asynchronous Event Request
    ///
    /// The completion is translated into an `AsyncEvent` and queued instead
    /// of waking a caller. AEN slots have no deadline; the controller
    /// completes them at its discretion.
    pub fn post_async_event_request(&self) -> NvmeResult<()> {
        let deadline = Instant::now() + self.default_timeout;
        let cid = {
            let (mut reg, cid) = self.alloc_cid(deadline)?;
            reg.slots.insert(
                cid,
                Slot {
                    opcode: crate::command::admin_opcode::ASYNC_EVENT_REQUEST,
                    deadline: None,
                    tx: None,
                    read_buf: None,
                    data_done: true,
                    write_data: None,
                    cqe: None,
                    aen: true,
                },
            );
            cid
        };
        if let Err(e) = self.transport.send_pdu(&Pdu::CapsuleCmd(CapsuleCmd {
            sqe: Sqe::async_event_request(cid),
            data: Vec::new(),
        })) {
            self.drop_slot(cid);
            self.fatal(e.clone());
            return Err(e);
        }
        log::debug!("async event request pre-posted as command {}", cid);
        Ok(())
    }

    /// Drain queued async events, waiting up to `timeout` for the first
    pub fn poll_async_events(&self, timeout: Duration) -> Vec<AsyncEvent> {
        self.aen.poll(timeout, &self.shutdown)
    }

    /// Close the connection and fail every outstanding command
    ///
    /// Idempotent. Joins the receiver and keep-alive threads.
    pub fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            self.transport.close();
            self.fail_all(&NvmeError::Connection("connection closed".to_string()));
            self.state.set(ConnectionState::Closed);
        }
        let handles: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Submission internals
    // ------------------------------------------------------------------

    /// Allocate a command id, blocking while the queue is full
    ///
    /// Returns the registry guard along with the id so the caller can
    /// insert the slot before releasing the lock.
    fn alloc_cid(
        &self,
        deadline: Instant,
    ) -> NvmeResult<(std::sync::MutexGuard<'_, Registry>, u16)> {
        if !self.state.is_active() {
            return Err(NvmeError::Connection(format!(
                "connection is {:?}, not accepting commands",
                self.state.get()
            )));
        }
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(cid) = reg.alloc_id() {
                return Ok((reg, cid));
            }
            if self.fail_fast {
                return Err(NvmeError::Timeout(
                    "submission queue full".to_string(),
                ));
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(NvmeError::Timeout(
                    "submission queue full until deadline".to_string(),
                ));
            };
            let (guard, _) = self
                .slot_freed
                .wait_timeout(reg, remaining.min(SWEEP_INTERVAL))
                .unwrap_or_else(|e| e.into_inner());
            reg = guard;
            if !self.state.is_active() {
                return Err(NvmeError::Connection(
                    "connection failed while waiting for a queue slot".to_string(),
                ));
            }
        }
    }

    /// Remove a slot that never made it onto the wire
    fn drop_slot(&self, cid: u16) {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if reg.slots.remove(&cid).is_some() {
            reg.release(cid);
        }
        self.slot_freed.notify_one();
    }

    // ------------------------------------------------------------------
    // Receiver
    // ------------------------------------------------------------------

    fn receiver_loop(&self) {
        log::debug!("receiver thread started for {}", self.transport.peer_addr());
        let mut last_sweep = Instant::now();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.transport.recv_pdu(Some(SWEEP_INTERVAL)) {
                Ok(pdu) => {
                    if let Err(e) = self.handle_pdu(pdu) {
                        self.fatal(e);
                        break;
                    }
                }
                // Idle tick; deadlines still advance below
                Err(NvmeError::Timeout(_)) => {}
                Err(e) => {
                    if !self.shutdown.load(Ordering::SeqCst) {
                        self.fatal(e);
                    }
                    break;
                }
            }
            if last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.sweep_deadlines();
                last_sweep = Instant::now();
            }
        }
        log::debug!("receiver thread exiting");
    }

    /// Returns Err only for faults that are fatal to the connection
    fn handle_pdu(&self, pdu: Pdu) -> NvmeResult<()> {
        match pdu {
            Pdu::CapsuleResp(resp) => self.on_capsule_resp(resp.cqe),
            Pdu::C2hData(c2h) => self.on_c2h_data(c2h),
            Pdu::R2t(r2t) => self.on_r2t(r2t),
            Pdu::C2hTermReq(term) => self.on_term_req(term),
            other => Err(NvmeError::Protocol(format!(
                "unexpected {} PDU from controller",
                other.type_name()
            ))),
        }
    }

    fn on_capsule_resp(&self, cqe: Cqe) -> NvmeResult<()> {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());

        match reg.slots.get_mut(&cqe.cid) {
            None => {
                // Typically a completion that lost the race with the sweep
                log::warn!(
                    "completion for unknown command id {} discarded (status 0x{:04x})",
                    cqe.cid,
                    cqe.status
                );
                return Ok(());
            }
            Some(slot) if !slot.aen && !slot.data_done && !cqe.is_error() => {
                // Data PDUs still in flight; hold the completion
                slot.cqe = Some(cqe);
                return Ok(());
            }
            Some(_) => {}
        }

        let mut slot = match reg.slots.remove(&cqe.cid) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        reg.release(cqe.cid);
        self.slot_freed.notify_one();
        drop(reg);

        if slot.aen {
            if cqe.is_error() {
                log::warn!(
                    "async event request {} failed with status 0x{:04x}",
                    cqe.cid,
                    cqe.status
                );
            } else {
                let event = AsyncEvent::from_dw0(cqe.dw0);
                log::info!("async event received: {}", event.description);
                self.aen.push(event);
            }
            return Ok(());
        }

        let outcome = if cqe.is_error() {
            Err(NvmeError::Command(CommandStatus {
                opcode: slot.opcode,
                sct: cqe.sct(),
                sc: cqe.sc(),
                dnr: cqe.dnr(),
                more: cqe.more(),
                dw0: cqe.dw0,
                local: false,
            }))
        } else {
            Ok((cqe, slot.read_buf.take()))
        };
        deliver(slot.tx.take(), outcome, cqe.cid);
        Ok(())
    }

    fn on_c2h_data(&self, c2h: C2hData) -> NvmeResult<()> {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let slot = match reg.slots.get_mut(&c2h.cccid) {
            Some(slot) => slot,
            None => {
                log::warn!("C2H data for unknown command id {} discarded", c2h.cccid);
                return Ok(());
            }
        };
        let buf = slot.read_buf.as_mut().ok_or_else(|| {
            NvmeError::Protocol(format!(
                "C2H data for command {} which transfers no data",
                c2h.cccid
            ))
        })?;

        let offset = c2h.datao as usize;
        let end = offset.checked_add(c2h.data.len()).ok_or_else(|| {
            NvmeError::Protocol("C2H data offset overflow".to_string())
        })?;
        if end > buf.len() {
            return Err(NvmeError::Protocol(format!(
                "C2H data [{}, {}) outside the {}-byte command buffer",
                offset,
                end,
                buf.len()
            )));
        }
        buf[offset..end].copy_from_slice(&c2h.data);

        if !c2h.last {
            return Ok(());
        }
        slot.data_done = true;

        // Either the completion already arrived, or this PDU implies it
        let cqe = if c2h.success {
            Some(Cqe {
                cid: c2h.cccid,
                ..Cqe::default()
            })
        } else {
            slot.cqe.take()
        };
        if let Some(cqe) = cqe {
            let mut slot = match reg.slots.remove(&c2h.cccid) {
                Some(slot) => slot,
                None => return Ok(()),
            };
            reg.release(c2h.cccid);
            self.slot_freed.notify_one();
            drop(reg);
            let data = slot.read_buf.take();
            deliver(slot.tx.take(), Ok((cqe, data)), c2h.cccid);
        }
        Ok(())
    }

    /// Service a Ready-to-Transfer grant from the pending write payload
    fn on_r2t(&self, r2t: R2t) -> NvmeResult<()> {
        let window = {
            let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let slot = match reg.slots.get_mut(&r2t.cccid) {
                Some(slot) => slot,
                None => {
                    log::warn!("R2T for unknown command id {} discarded", r2t.cccid);
                    return Ok(());
                }
            };
            let data = slot.write_data.as_ref().ok_or_else(|| {
                NvmeError::Protocol(format!(
                    "R2T for command {} with no pending write data",
                    r2t.cccid
                ))
            })?;
            let offset = r2t.r2to as usize;
            let len = r2t.r2tl as usize;
            if len == 0 {
                return Err(NvmeError::Protocol("R2T with zero length".to_string()));
            }
            let end = offset.checked_add(len).filter(|&e| e <= data.len());
            let end = end.ok_or_else(|| {
                NvmeError::Protocol(format!(
                    "R2T window [{}, {}) outside the {}-byte payload",
                    offset,
                    offset + len,
                    data.len()
                ))
            })?;
            data[offset..end].to_vec()
        };

        let max = self.maxh2cdata as usize;
        let mut sent = 0;
        while sent < window.len() {
            let n = (window.len() - sent).min(max);
            let last = sent + n == window.len();
            self.transport.send_pdu(&Pdu::H2cData(H2cData {
                cccid: r2t.cccid,
                ttag: r2t.ttag,
                datao: r2t.r2to + sent as u32,
                data: window[sent..sent + n].to_vec(),
                last,
            }))?;
            sent += n;
        }
        log::trace!(
            "serviced R2T for command {}: {} bytes at offset {}",
            r2t.cccid,
            window.len(),
            r2t.r2to
        );
        Ok(())
    }

    fn on_term_req(&self, term: TermReq) -> NvmeResult<()> {
        Err(NvmeError::Protocol(format!(
            "controller terminated the connection: {} (FES 0x{:02x}, FEI 0x{:x})",
            fes::name(term.fes),
            term.fes,
            term.fei
        )))
    }

    /// Fail slots whose deadline has passed; late completions are discarded
    fn sweep_deadlines(&self) {
        let now = Instant::now();
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<u16> = reg
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline.is_some_and(|d| d <= now))
            .map(|(&cid, _)| cid)
            .collect();
        if expired.is_empty() {
            return;
        }
        for cid in expired {
            if let Some(mut slot) = reg.slots.remove(&cid) {
                reg.release(cid);
                log::warn!("command {} (opcode 0x{:02x}) timed out", cid, slot.opcode);
                deliver(
                    slot.tx.take(),
                    Err(NvmeError::Timeout(format!(
                        "command {} deadline expired",
                        cid
                    ))),
                    cid,
                );
            }
        }
        self.slot_freed.notify_all();
    }

    /// Tear the connection down after a fatal error
    fn fatal(&self, err: NvmeError) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!("fatal connection error: {}", err);
        self.state.set(ConnectionState::Failing);
        self.transport.close();
        self.fail_all(&err);
        self.state.set(ConnectionState::Closed);
    }

    fn fail_all(&self, err: &NvmeError) {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let cids: Vec<u16> = reg.slots.keys().copied().collect();
        for cid in cids {
            if let Some(mut slot) = reg.slots.remove(&cid) {
                reg.release(cid);
                deliver(slot.tx.take(), Err(err.clone()), cid);
            }
        }
        self.slot_freed.notify_all();
        // Wake any pollers so they observe the shutdown
        self.aen.avail.notify_all();
    }

    // ------------------------------------------------------------------
    // Keep-alive
    // ------------------------------------------------------------------

    fn keepalive_loop(&self) {
        let interval = Duration::from_millis((self.kato_ms / 2).max(1) as u64);
        log::debug!("keep-alive thread started, interval {:?}", interval);
        loop {
            let until = Instant::now() + interval;
            while let Some(remaining) = until.checked_duration_since(Instant::now()) {
                if self.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(remaining.min(Duration::from_millis(100)));
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            // A keep-alive that cannot complete within half the timeout
            // means the controller is gone
            match self.submit(Sqe::keep_alive, None, 0, Some(interval)) {
                Ok(_) => log::trace!("keep-alive acknowledged"),
                Err(e) => {
                    if !self.shutdown.load(Ordering::SeqCst) {
                        log::error!("keep-alive failed: {}", e);
                        self.fatal(NvmeError::Timeout(format!(
                            "keep-alive not acknowledged: {}",
                            e
                        )));
                    }
                    return;
                }
            }
        }
    }
}

fn deliver(tx: Option<SyncSender<Outcome>>, outcome: Outcome, cid: u16) {
    if let Some(tx) = tx {
        if tx.try_send(outcome).is_err() {
            log::debug!("completion for abandoned command {} discarded", cid);
        }
    }
}
