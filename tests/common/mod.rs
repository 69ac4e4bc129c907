//! In-process mock NVMe/TCP controller used by the integration tests
//!
//! Speaks just enough of the protocol to exercise the client end to end:
//! connection initialisation with digest negotiation, Fabric Connect,
//! controller properties, Identify data, log pages, block I/O with both
//! in-capsule and R2T write paths, reservations, and asynchronous events.

#![allow(dead_code)]

use byteorder::{ByteOrder, LittleEndian};
use nvmeof_tcp::command::{admin_opcode, fabrics_type, nvm_opcode, property, Cqe, Sqe};
use nvmeof_tcp::pdu::{C2hData, CapsuleResp, DigestState, IcResp, Pdu, R2t, PDU_HDR_SIZE};
use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MOCK_SUBNQN: &str = "nqn.2024-01.com.example:s1";
pub const MOCK_MODEL: &str = "Mock NVMe-oF Controller";
pub const MOCK_SERIAL: &str = "MOCKSN0001";
pub const BLOCK_SIZE: usize = 512;
pub const NAMESPACE_BLOCKS: u64 = 2048;
pub const CNTLID: u16 = 1;

/// In-capsule data limit advertised via IOCCSZ: (516 * 16) - 64 = 8192
pub const IOCCSZ: u32 = 516;
pub const INCAPSULE_LIMIT: usize = 8192;

static ACTIVE_NSIDS: Lazy<Vec<u32>> = Lazy::new(|| vec![1, 2]);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub maxh2cdata: u32,
    pub cpda: u8,
    pub accept_digests: bool,
    /// Send the response capsule before the C2H data PDUs of a read
    pub cqe_before_data: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        MockConfig {
            maxh2cdata: 4096,
            cpda: 0,
            accept_digests: true,
            cqe_before_data: false,
        }
    }
}

#[derive(Default)]
struct ResvState {
    keys: Vec<u64>,
    rtype: u8,
    holder: u64,
}

struct Shared {
    disks: Mutex<HashMap<u32, Vec<u8>>>,
    resv: Mutex<ResvState>,
    events: Mutex<VecDeque<u32>>,
    spurious: Mutex<Vec<u16>>,
    blackhole: Mutex<Option<u8>>,
    r2t_count: Mutex<usize>,
    features: Mutex<HashMap<u8, u32>>,
}

pub struct MockController {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockController {
    pub fn start() -> Self {
        Self::start_with(MockConfig::default())
    }

    pub fn start_with(cfg: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock listener");
        let addr = listener.local_addr().unwrap();

        let mut disks = HashMap::new();
        for &nsid in ACTIVE_NSIDS.iter() {
            disks.insert(nsid, vec![0u8; NAMESPACE_BLOCKS as usize * BLOCK_SIZE]);
        }
        let shared = Arc::new(Shared {
            disks: Mutex::new(disks),
            resv: Mutex::new(ResvState::default()),
            events: Mutex::new(VecDeque::new()),
            spurious: Mutex::new(Vec::new()),
            blackhole: Mutex::new(None),
            r2t_count: Mutex::new(0),
            features: Mutex::new(HashMap::new()),
        });

        let accept_shared = Arc::clone(&shared);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let shared = Arc::clone(&accept_shared);
                let cfg = cfg.clone();
                std::thread::spawn(move || serve(stream, shared, cfg));
            }
        });

        MockController { addr, shared }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Queue an asynchronous event; paired with the next parked AER
    pub fn trigger_event(&self, dw0: u32) {
        self.shared.events.lock().unwrap().push_back(dw0);
    }

    /// Emit a completion for a command id that was never issued
    pub fn inject_spurious_completion(&self, cid: u16) {
        self.shared.spurious.lock().unwrap().push(cid);
    }

    /// Swallow every command with this opcode, never completing it
    pub fn blackhole_opcode(&self, opcode: u8) {
        *self.shared.blackhole.lock().unwrap() = Some(opcode);
    }

    pub fn clear_blackhole(&self) {
        *self.shared.blackhole.lock().unwrap() = None;
    }

    /// Number of writes serviced through the R2T path
    pub fn r2t_count(&self) -> usize {
        *self.shared.r2t_count.lock().unwrap()
    }

    pub fn disk_contents(&self, nsid: u32, lba: u64, len: usize) -> Vec<u8> {
        let disks = self.shared.disks.lock().unwrap();
        let disk = disks.get(&nsid).unwrap();
        let start = lba as usize * BLOCK_SIZE;
        disk[start..start + len].to_vec()
    }
}

struct Conn {
    digest: DigestState,
    cpda: u8,
    cc: u32,
    next_ttag: u16,
    pending_aers: VecDeque<u16>,
}

fn serve(mut stream: TcpStream, shared: Arc<Shared>, cfg: MockConfig) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(Duration::from_millis(50)));
    let mut conn = Conn {
        digest: DigestState::default(),
        cpda: 0,
        cc: 0,
        next_ttag: 1,
        pending_aers: VecDeque::new(),
    };

    loop {
        // Pair triggered events with parked AER command ids
        loop {
            let dw0 = {
                let mut events = shared.events.lock().unwrap();
                if events.is_empty() || conn.pending_aers.is_empty() {
                    break;
                }
                events.pop_front().unwrap()
            };
            let cid = conn.pending_aers.pop_front().unwrap();
            send(
                &mut stream,
                &conn,
                &Pdu::CapsuleResp(CapsuleResp {
                    cqe: Cqe {
                        dw0,
                        cid,
                        ..Cqe::default()
                    },
                }),
            );
        }
        for cid in shared.spurious.lock().unwrap().drain(..) {
            send(
                &mut stream,
                &conn,
                &Pdu::CapsuleResp(CapsuleResp {
                    cqe: Cqe {
                        cid,
                        ..Cqe::default()
                    },
                }),
            );
        }

        let pdu = match read_pdu(&mut stream, conn.digest) {
            Ok(Some(pdu)) => pdu,
            Ok(None) => continue,
            Err(_) => return,
        };

        match pdu {
            Pdu::IcReq(req) => {
                assert_eq!(req.pfv, 0);
                let negotiated = DigestState {
                    header: req.digest.header && cfg.accept_digests,
                    data: req.digest.data && cfg.accept_digests,
                };
                let resp = Pdu::IcResp(IcResp {
                    pfv: 0,
                    cpda: cfg.cpda,
                    digest: negotiated,
                    maxh2cdata: cfg.maxh2cdata,
                });
                send(&mut stream, &conn, &resp);
                conn.digest = negotiated;
                conn.cpda = cfg.cpda;
            }
            Pdu::CapsuleCmd(cmd) => {
                if !handle_command(&mut stream, &mut conn, &shared, &cfg, cmd.sqe, cmd.data) {
                    return;
                }
            }
            // Unsolicited data is dropped; the command collecting it reads
            // its own H2C PDUs inline
            Pdu::H2cData(_) => {}
            other => panic!("mock received unexpected {} PDU", other.type_name()),
        }
    }
}

fn handle_command(
    stream: &mut TcpStream,
    conn: &mut Conn,
    shared: &Arc<Shared>,
    cfg: &MockConfig,
    sqe: Sqe,
    capsule_data: Vec<u8>,
) -> bool {
    if shared.blackhole.lock().unwrap().is_some_and(|op| op == sqe.opcode) {
        return true;
    }
    let cid = sqe.cid;

    if sqe.opcode == admin_opcode::FABRICS {
        match sqe.fctype() {
            fabrics_type::CONNECT => {
                assert_eq!(capsule_data.len(), 1024);
                let subnqn = &capsule_data[256..512];
                assert!(subnqn.starts_with(b"nqn."));
                send_cqe(stream, conn, Cqe {
                    dw0: CNTLID as u32,
                    cid,
                    ..Cqe::default()
                });
            }
            fabrics_type::PROPERTY_GET => {
                let value: u64 = match sqe.cdw11 {
                    property::CAP => 31 | (10u64 << 24),
                    property::VS => 0x0001_0400,
                    property::CC => conn.cc as u64,
                    property::CSTS => {
                        if conn.cc & 0x1 != 0 {
                            0x1
                        } else {
                            0x0
                        }
                    }
                    _ => 0,
                };
                send_cqe(stream, conn, Cqe {
                    dw0: (value & 0xFFFF_FFFF) as u32,
                    dw1: (value >> 32) as u32,
                    cid,
                    ..Cqe::default()
                });
            }
            fabrics_type::PROPERTY_SET => {
                if sqe.cdw11 == property::CC {
                    conn.cc = sqe.cdw12;
                }
                send_ok(stream, conn, cid);
            }
            other => panic!("mock: unhandled fabrics type 0x{:02x}", other),
        }
        return true;
    }

    match sqe.opcode {
        admin_opcode::IDENTIFY => {
            let payload = match (sqe.cdw10 & 0xFF) as u8 {
                0x00 => build_namespace_identify(),
                0x01 => build_controller_identify(),
                0x02 => build_namespace_list(),
                cns => panic!("mock: unhandled CNS 0x{:02x}", cns),
            };
            send_data_then_cqe(stream, conn, cfg, cid, &payload);
        }
        admin_opcode::GET_LOG_PAGE => {
            let lid = (sqe.cdw10 & 0xFF) as u8;
            let numd = (sqe.cdw10 >> 16) | (sqe.cdw11 << 16);
            let len = (numd as usize + 1) * 4;
            let mut payload = match lid {
                0x01 => vec![0u8; len],
                0x0C => build_ana_log(),
                0x70 => build_discovery_log(),
                _ => vec![0u8; len],
            };
            payload.resize(len, 0);
            send_data_then_cqe(stream, conn, cfg, cid, &payload);
        }
        admin_opcode::GET_FEATURES => {
            let fid = (sqe.cdw10 & 0xFF) as u8;
            let value = shared.features.lock().unwrap().get(&fid).copied().unwrap_or(0);
            send_cqe(stream, conn, Cqe {
                dw0: value,
                cid,
                ..Cqe::default()
            });
        }
        admin_opcode::SET_FEATURES => {
            let fid = (sqe.cdw10 & 0xFF) as u8;
            shared.features.lock().unwrap().insert(fid, sqe.cdw11);
            send_ok(stream, conn, cid);
        }
        admin_opcode::ASYNC_EVENT_REQUEST => {
            conn.pending_aers.push_back(cid);
        }
        admin_opcode::KEEP_ALIVE => {
            send_ok(stream, conn, cid);
        }
        nvm_opcode::READ => {
            let slba = sqe.cdw10 as u64 | (sqe.cdw11 as u64) << 32;
            let nlb = (sqe.cdw12 & 0xFFFF) as u64 + 1;
            if slba + nlb > NAMESPACE_BLOCKS {
                send_cqe(stream, conn, status_cqe(cid, 0x02, 0x80));
                return true;
            }
            let payload = {
                let disks = shared.disks.lock().unwrap();
                let disk = disks.get(&sqe.nsid).expect("mock: unknown nsid");
                let start = slba as usize * BLOCK_SIZE;
                disk[start..start + nlb as usize * BLOCK_SIZE].to_vec()
            };
            send_data_then_cqe(stream, conn, cfg, cid, &payload);
        }
        nvm_opcode::WRITE => {
            let slba = sqe.cdw10 as u64 | (sqe.cdw11 as u64) << 32;
            let nlb = (sqe.cdw12 & 0xFFFF) as u64 + 1;
            let len = nlb as usize * BLOCK_SIZE;
            let data = if !capsule_data.is_empty() {
                assert_eq!(capsule_data.len(), len, "in-capsule write length");
                capsule_data
            } else {
                *shared.r2t_count.lock().unwrap() += 1;
                match collect_h2c(stream, conn, cid, len) {
                    Some(data) => data,
                    None => return false,
                }
            };
            if slba + nlb > NAMESPACE_BLOCKS {
                send_cqe(stream, conn, status_cqe(cid, 0x02, 0x80));
                return true;
            }
            {
                let mut disks = shared.disks.lock().unwrap();
                let disk = disks.get_mut(&sqe.nsid).expect("mock: unknown nsid");
                let start = slba as usize * BLOCK_SIZE;
                disk[start..start + len].copy_from_slice(&data);
            }
            send_ok(stream, conn, cid);
        }
        nvm_opcode::WRITE_ZEROES => {
            let slba = sqe.cdw10 as u64 | (sqe.cdw11 as u64) << 32;
            let nlb = (sqe.cdw12 & 0xFFFF) as u64 + 1;
            if slba + nlb > NAMESPACE_BLOCKS {
                send_cqe(stream, conn, status_cqe(cid, 0x02, 0x80));
                return true;
            }
            let mut disks = shared.disks.lock().unwrap();
            let disk = disks.get_mut(&sqe.nsid).expect("mock: unknown nsid");
            let start = slba as usize * BLOCK_SIZE;
            disk[start..start + nlb as usize * BLOCK_SIZE].fill(0);
            drop(disks);
            send_ok(stream, conn, cid);
        }
        nvm_opcode::FLUSH | nvm_opcode::DATASET_MANAGEMENT => {
            send_ok(stream, conn, cid);
        }
        nvm_opcode::RESERVATION_REGISTER => {
            let crkey = LittleEndian::read_u64(&capsule_data[0..8]);
            let nrkey = LittleEndian::read_u64(&capsule_data[8..16]);
            let mut resv = shared.resv.lock().unwrap();
            match sqe.cdw10 & 0x7 {
                0 => resv.keys.push(nrkey),
                1 => resv.keys.retain(|&k| k != crkey),
                2 => {
                    resv.keys.retain(|&k| k != crkey);
                    resv.keys.push(nrkey);
                }
                _ => {}
            }
            drop(resv);
            send_ok(stream, conn, cid);
        }
        nvm_opcode::RESERVATION_ACQUIRE => {
            let crkey = LittleEndian::read_u64(&capsule_data[0..8]);
            let mut resv = shared.resv.lock().unwrap();
            if !resv.keys.contains(&crkey) {
                drop(resv);
                send_cqe(stream, conn, status_cqe(cid, 0x00, 0x83));
                return true;
            }
            resv.rtype = ((sqe.cdw10 >> 8) & 0xFF) as u8;
            resv.holder = crkey;
            drop(resv);
            send_ok(stream, conn, cid);
        }
        nvm_opcode::RESERVATION_RELEASE => {
            let crkey = LittleEndian::read_u64(&capsule_data[0..8]);
            let mut resv = shared.resv.lock().unwrap();
            if resv.holder == crkey {
                resv.holder = 0;
                resv.rtype = 0;
            }
            drop(resv);
            send_ok(stream, conn, cid);
        }
        nvm_opcode::RESERVATION_REPORT => {
            let payload = build_resv_report(&shared.resv.lock().unwrap());
            send_data_then_cqe(stream, conn, cfg, cid, &payload);
        }
        other => panic!("mock: unhandled opcode 0x{:02x}", other),
    }
    true
}

/// Solicit and assemble the write payload over H2C data PDUs
fn collect_h2c(stream: &mut TcpStream, conn: &mut Conn, cid: u16, len: usize) -> Option<Vec<u8>> {
    let ttag = conn.next_ttag;
    conn.next_ttag = conn.next_ttag.wrapping_add(1);
    send(
        stream,
        conn,
        &Pdu::R2t(R2t {
            cccid: cid,
            ttag,
            r2to: 0,
            r2tl: len as u32,
        }),
    );

    let mut buf = vec![0u8; len];
    loop {
        match read_pdu(stream, conn.digest) {
            Ok(Some(Pdu::H2cData(h2c))) => {
                assert_eq!(h2c.cccid, cid);
                assert_eq!(h2c.ttag, ttag);
                let offset = h2c.datao as usize;
                buf[offset..offset + h2c.data.len()].copy_from_slice(&h2c.data);
                if h2c.last {
                    return Some(buf);
                }
            }
            Ok(Some(other)) => panic!(
                "mock: expected H2CData while collecting a write, got {}",
                other.type_name()
            ),
            Ok(None) => continue,
            Err(_) => return None,
        }
    }
}

fn read_pdu(stream: &mut TcpStream, digest: DigestState) -> std::io::Result<Option<Pdu>> {
    let mut header = [0u8; PDU_HDR_SIZE];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            return Ok(None)
        }
        Err(e) => return Err(e),
    }
    let plen = LittleEndian::read_u32(&header[4..8]) as usize;
    let mut buf = vec![0u8; plen];
    buf[..PDU_HDR_SIZE].copy_from_slice(&header);
    let mut filled = PDU_HDR_SIZE;
    while filled < plen {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Some(
        Pdu::from_bytes(&buf, digest).expect("mock: PDU decode failed"),
    ))
}

fn send(stream: &mut TcpStream, conn: &Conn, pdu: &Pdu) {
    let bytes = pdu.to_bytes(conn.digest, conn.cpda);
    stream.write_all(&bytes).expect("mock: write failed");
}

fn send_cqe(stream: &mut TcpStream, conn: &Conn, cqe: Cqe) {
    send(stream, conn, &Pdu::CapsuleResp(CapsuleResp { cqe }));
}

fn send_ok(stream: &mut TcpStream, conn: &Conn, cid: u16) {
    send_cqe(stream, conn, Cqe {
        cid,
        ..Cqe::default()
    });
}

fn status_cqe(cid: u16, sct: u8, sc: u8) -> Cqe {
    Cqe {
        cid,
        status: ((sct as u16 & 0x7) << 9) | ((sc as u16) << 1),
        ..Cqe::default()
    }
}

/// Stream a data-in payload as C2H PDUs (≤ 2048 bytes each, assembled by
/// offset on the client side), then the response capsule
fn send_data_then_cqe(
    stream: &mut TcpStream,
    conn: &Conn,
    cfg: &MockConfig,
    cid: u16,
    payload: &[u8],
) {
    let ok = Cqe {
        cid,
        ..Cqe::default()
    };
    if cfg.cqe_before_data {
        send_cqe(stream, conn, ok);
    }
    let chunks: Vec<_> = payload.chunks(2048).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        send(
            stream,
            conn,
            &Pdu::C2hData(C2hData {
                cccid: cid,
                datao: (i * 2048) as u32,
                data: chunk.to_vec(),
                last: i == chunks.len() - 1,
                success: false,
            }),
        );
    }
    if !cfg.cqe_before_data {
        send_cqe(stream, conn, ok);
    }
}

// ============================================================================
// Reference payload builders
// ============================================================================

pub fn build_controller_identify() -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    LittleEndian::write_u16(&mut buf[0..2], 0x1B96);
    LittleEndian::write_u16(&mut buf[2..4], 0x1B96);
    write_padded(&mut buf[4..24], MOCK_SERIAL);
    write_padded(&mut buf[24..64], MOCK_MODEL);
    write_padded(&mut buf[64..72], "1.0");
    buf[73..76].copy_from_slice(&[0x00, 0x02, 0x3D]);
    buf[77] = 5; // MDTS
    LittleEndian::write_u16(&mut buf[78..80], CNTLID);
    LittleEndian::write_u32(&mut buf[80..84], 0x0001_0400);
    LittleEndian::write_u32(&mut buf[92..96], 0x0000_0900); // OAES
    LittleEndian::write_u32(&mut buf[516..520], ACTIVE_NSIDS.len() as u32);
    buf[768..768 + MOCK_SUBNQN.len()].copy_from_slice(MOCK_SUBNQN.as_bytes());
    LittleEndian::write_u32(&mut buf[1792..1796], IOCCSZ);
    LittleEndian::write_u32(&mut buf[1796..1800], 1);
    buf
}

pub fn build_namespace_identify() -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    LittleEndian::write_u64(&mut buf[0..8], NAMESPACE_BLOCKS);
    LittleEndian::write_u64(&mut buf[8..16], NAMESPACE_BLOCKS);
    LittleEndian::write_u64(&mut buf[16..24], NAMESPACE_BLOCKS / 2);
    buf[25] = 0; // one LBA format
    buf[26] = 0; // current format 0
    buf[31] = 0x03; // RESCAP
    buf[128 + 2] = 9; // 512-byte blocks
    buf
}

fn build_namespace_list() -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    for (i, &nsid) in ACTIVE_NSIDS.iter().enumerate() {
        LittleEndian::write_u32(&mut buf[i * 4..i * 4 + 4], nsid);
    }
    buf
}

/// Two ANA groups covering the two active namespaces
fn build_ana_log() -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    LittleEndian::write_u64(&mut buf[0..8], 11);
    LittleEndian::write_u16(&mut buf[8..10], 2);
    for (gid, state, nsid) in [(1u32, 0x01u8, 1u32), (2, 0x02, 2)] {
        let mut desc = vec![0u8; 32];
        LittleEndian::write_u32(&mut desc[0..4], gid);
        LittleEndian::write_u32(&mut desc[4..8], 1);
        LittleEndian::write_u64(&mut desc[8..16], 11);
        desc[16] = state;
        buf.extend_from_slice(&desc);
        let mut id = [0u8; 4];
        LittleEndian::write_u32(&mut id, nsid);
        buf.extend_from_slice(&id);
    }
    buf
}

fn build_discovery_log() -> Vec<u8> {
    let mut buf = vec![0u8; 1024];
    LittleEndian::write_u64(&mut buf[0..8], 7);
    LittleEndian::write_u64(&mut buf[8..16], 2);
    for (port, subnqn, subtype) in [
        ("4420", MOCK_SUBNQN, 2u8),
        ("8009", "nqn.2014-08.org.nvmexpress.discovery", 1),
    ] {
        let mut rec = vec![0u8; 1024];
        rec[0] = 3; // TCP
        rec[1] = 1; // IPv4
        rec[2] = subtype;
        LittleEndian::write_u16(&mut rec[4..6], 1);
        LittleEndian::write_u16(&mut rec[6..8], 0xFFFF);
        LittleEndian::write_u16(&mut rec[8..10], 31);
        write_padded(&mut rec[32..64], port);
        rec[256..256 + subnqn.len()].copy_from_slice(subnqn.as_bytes());
        write_padded(&mut rec[512..768], "127.0.0.1");
        buf.extend_from_slice(&rec);
    }
    buf
}

fn build_resv_report(resv: &ResvState) -> Vec<u8> {
    let mut buf = vec![0u8; 24];
    LittleEndian::write_u32(&mut buf[0..4], 1);
    buf[4] = resv.rtype;
    LittleEndian::write_u16(&mut buf[5..7], resv.keys.len() as u16);
    for &key in &resv.keys {
        let mut desc = vec![0u8; 24];
        LittleEndian::write_u16(&mut desc[0..2], CNTLID);
        desc[2] = if resv.holder != 0 && key == resv.holder {
            1
        } else {
            0
        };
        desc[8..16].copy_from_slice(&[0xAA; 8]);
        LittleEndian::write_u64(&mut desc[16..24], key);
        buf.extend_from_slice(&desc);
    }
    buf.resize(4096, 0);
    buf
}

fn write_padded(field: &mut [u8], value: &str) {
    field.fill(b' ');
    field[..value.len()].copy_from_slice(value.as_bytes());
}
