//! TCP transport for NVMe/TCP PDUs
//!
//! Owns the socket and frames PDU reads/writes: the 8-byte common header
//! is read first, then the remaining `plen - 8` bytes, and the whole PDU
//! is handed to the codec. Writes are atomic per PDU and serialised by an
//! internal mutex. After session activation the receiver thread is the
//! sole reader.

use crate::error::{NvmeError, NvmeResult};
use crate::pdu::{DigestState, Pdu, MAX_PDU_SIZE, PDU_HDR_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Deadline for the remainder of a PDU once its header has arrived
const BODY_TIMEOUT: Duration = Duration::from_secs(30);

/// Negotiated PDU parameters applied to encode/decode
#[derive(Debug, Clone, Copy, Default)]
struct PduParams {
    digest: DigestState,
    cpda: u8,
}

/// Framed PDU transport over a TCP stream
pub struct PduTransport {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    /// Unlocked handle so `close` can interrupt a blocked reader or writer
    ctrl: TcpStream,
    params: Mutex<PduParams>,
    closed: AtomicBool,
    peer: SocketAddr,
}

impl PduTransport {
    /// Connect to `host:port` with a connection timeout
    pub fn connect(host: &str, port: u16, timeout: Duration) -> NvmeResult<Self> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| NvmeError::Connection(format!("cannot resolve {}:{}: {}", host, port, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(NvmeError::Connection(format!(
                "no addresses for {}:{}",
                host, port
            )));
        }

        let mut last_err = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    let peer = stream.peer_addr()?;
                    let writer = stream.try_clone()?;
                    let ctrl = stream.try_clone()?;
                    log::debug!("TCP connection established to {}", peer);
                    return Ok(PduTransport {
                        reader: Mutex::new(stream),
                        writer: Mutex::new(writer),
                        ctrl,
                        params: Mutex::new(PduParams::default()),
                        closed: AtomicBool::new(false),
                        peer,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(NvmeError::Connection(format!(
            "cannot connect to {}:{}: {}",
            host,
            port,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Record the parameters negotiated by ICReq/ICResp
    ///
    /// Applied to every PDU sent or received from this point on.
    pub fn set_negotiated(&self, digest: DigestState, cpda: u8) {
        let mut params = self.params.lock().unwrap_or_else(|e| e.into_inner());
        params.digest = digest;
        params.cpda = cpda;
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serialize and send one PDU
    pub fn send_pdu(&self, pdu: &Pdu) -> NvmeResult<()> {
        if self.is_closed() {
            return Err(NvmeError::Connection("transport is closed".to_string()));
        }
        let params = *self.params.lock().unwrap_or_else(|e| e.into_inner());
        let bytes = pdu.to_bytes(params.digest, params.cpda);
        log::trace!(
            "sending {} PDU, {} bytes to {}",
            pdu.type_name(),
            bytes.len(),
            self.peer
        );
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Receive one PDU, waiting up to `timeout` for it to begin arriving
    ///
    /// `None` blocks indefinitely. Once the common header has arrived the
    /// body is read under a fixed generous deadline so a slow peer cannot
    /// desynchronise the stream on a short poll interval.
    pub fn recv_pdu(&self, timeout: Option<Duration>) -> NvmeResult<Pdu> {
        if self.is_closed() {
            return Err(NvmeError::Connection("transport is closed".to_string()));
        }
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());

        // The poll timeout applies only until the first byte arrives; once
        // a PDU has started, stalling mid-frame would desynchronise the
        // stream, so the remainder runs under the fixed body deadline.
        reader.set_read_timeout(timeout)?;
        let mut header = [0u8; PDU_HDR_SIZE];
        let mut filled = 0;
        while filled < PDU_HDR_SIZE {
            match reader.read(&mut header[filled..]) {
                Ok(0) => {
                    return Err(NvmeError::Connection("socket closed by peer".to_string()))
                }
                Ok(n) => {
                    if filled == 0 {
                        reader.set_read_timeout(Some(BODY_TIMEOUT))?;
                    }
                    filled += n;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    if filled == 0 {
                        return Err(NvmeError::Timeout("no PDU within deadline".to_string()));
                    }
                    return Err(NvmeError::Connection(
                        "peer stalled mid-PDU header".to_string(),
                    ));
                }
                Err(e) => return Err(map_read_err(e)),
            }
        }

        let plen = LittleEndian::read_u32(&header[4..8]) as usize;
        if plen < PDU_HDR_SIZE || plen > MAX_PDU_SIZE {
            return Err(NvmeError::Protocol(format!(
                "PLEN {} out of range for PDU type 0x{:02x}",
                plen, header[0]
            )));
        }

        let mut buf = vec![0u8; plen];
        buf[..PDU_HDR_SIZE].copy_from_slice(&header);
        if plen > PDU_HDR_SIZE {
            reader.set_read_timeout(Some(BODY_TIMEOUT))?;
            reader
                .read_exact(&mut buf[PDU_HDR_SIZE..])
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                        NvmeError::Connection("peer stalled mid-PDU".to_string())
                    }
                    _ => map_read_err(e),
                })?;
        }
        drop(reader);

        let params = *self.params.lock().unwrap_or_else(|e| e.into_inner());
        let pdu = Pdu::from_bytes(&buf, params.digest)?;
        log::trace!(
            "received {} PDU, {} bytes from {}",
            pdu.type_name(),
            plen,
            self.peer
        );
        Ok(pdu)
    }

    /// Shut the socket down; all subsequent operations fail
    ///
    /// NVMe/TCP has no disconnect PDU; the controller observes the close.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("closing connection to {}", self.peer);
            let _ = self.ctrl.shutdown(Shutdown::Both);
        }
    }
}

/// A read of 0 bytes means the peer closed the socket
fn map_read_err(e: std::io::Error) -> NvmeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        NvmeError::Connection("socket closed by peer".to_string())
    } else {
        NvmeError::from(e)
    }
}
