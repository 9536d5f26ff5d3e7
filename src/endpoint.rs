//! Kernel/userspace message endpoints.
//!
//! Three unix datagram surfaces connect the watchdog side to the loader
//! side, carrying the same wire formats the original device interfaces used:
//!
//! - **notify**: watchdog -> loader, ASCII `"<pgid>,<elapsed_sec>,<job_id>\0"`,
//!   sent non-blocking. The loader's endpoint address is derived from its
//!   registered pid, so `set_notify_endpoint` stays a single-integer command.
//! - **ack**: loader -> watchdog, one native-endian `i32` carrying the pgid
//!   whose profiling completed.
//! - **control**: fixed-size command payloads prefixed with a `u32` opcode;
//!   `add_pgid` carries `{pgid, job_id, worker_num}` as three `i32`s, every
//!   other command one `i32`.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::attribution::AttributionTable;
use crate::watchdog::{NotifySink, Watchdog};

const OP_ADD_PGID: u32 = 0;
const OP_REMOVE_PGID: u32 = 1;
const OP_SET_THRESHOLD: u32 = 2;
const OP_SET_NOTIFY_ENDPOINT: u32 = 3;
const OP_REQUEST_PROFILE: u32 = 4;

/// Commands accepted on the control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    AddPgid {
        pgid: i32,
        job_id: i32,
        worker_num: i32,
    },
    RemovePgid(i32),
    SetThreshold(i32),
    SetNotifyEndpoint(i32),
    RequestProfile(i32),
}

impl ControlRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        match self {
            ControlRequest::AddPgid {
                pgid,
                job_id,
                worker_num,
            } => {
                buf.extend_from_slice(&OP_ADD_PGID.to_ne_bytes());
                buf.extend_from_slice(&pgid.to_ne_bytes());
                buf.extend_from_slice(&job_id.to_ne_bytes());
                buf.extend_from_slice(&worker_num.to_ne_bytes());
            }
            ControlRequest::RemovePgid(v) => {
                buf.extend_from_slice(&OP_REMOVE_PGID.to_ne_bytes());
                buf.extend_from_slice(&v.to_ne_bytes());
            }
            ControlRequest::SetThreshold(v) => {
                buf.extend_from_slice(&OP_SET_THRESHOLD.to_ne_bytes());
                buf.extend_from_slice(&v.to_ne_bytes());
            }
            ControlRequest::SetNotifyEndpoint(v) => {
                buf.extend_from_slice(&OP_SET_NOTIFY_ENDPOINT.to_ne_bytes());
                buf.extend_from_slice(&v.to_ne_bytes());
            }
            ControlRequest::RequestProfile(v) => {
                buf.extend_from_slice(&OP_REQUEST_PROFILE.to_ne_bytes());
                buf.extend_from_slice(&v.to_ne_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            bail!("control payload too short: {} bytes", buf.len());
        }
        let op = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let arg = |off: usize| -> Result<i32> {
            let bytes = buf
                .get(off..off + 4)
                .with_context(|| format!("control payload truncated at offset {off}"))?;
            Ok(i32::from_ne_bytes(bytes.try_into().unwrap()))
        };
        match op {
            OP_ADD_PGID => Ok(ControlRequest::AddPgid {
                pgid: arg(4)?,
                job_id: arg(8)?,
                worker_num: arg(12)?,
            }),
            OP_REMOVE_PGID => Ok(ControlRequest::RemovePgid(arg(4)?)),
            OP_SET_THRESHOLD => Ok(ControlRequest::SetThreshold(arg(4)?)),
            OP_SET_NOTIFY_ENDPOINT => Ok(ControlRequest::SetNotifyEndpoint(arg(4)?)),
            OP_REQUEST_PROFILE => Ok(ControlRequest::RequestProfile(arg(4)?)),
            other => bail!("unknown control opcode {other}"),
        }
    }
}

/// Path of the loader endpoint registered under `pid`.
pub fn notify_path(run_dir: &Path, pid: i32) -> PathBuf {
    run_dir.join(format!("loader-{pid}.sock"))
}

pub fn ack_path(run_dir: &Path) -> PathBuf {
    run_dir.join("ack.sock")
}

pub fn control_path(run_dir: &Path) -> PathBuf {
    run_dir.join("control.sock")
}

/// Watchdog-side notification sender. Resolves the destination from the
/// registered loader pid on every send so `set_notify_endpoint` takes effect
/// immediately.
pub struct NotifySender {
    run_dir: PathBuf,
    loader_pid: AtomicI32,
    socket: UnixDatagram,
}

impl NotifySender {
    pub fn new(run_dir: impl Into<PathBuf>) -> Result<Self> {
        let socket = UnixDatagram::unbound().context("creating notify socket")?;
        socket.set_nonblocking(true)?;
        Ok(NotifySender {
            run_dir: run_dir.into(),
            loader_pid: AtomicI32::new(0),
            socket,
        })
    }

    pub fn set_loader_pid(&self, pid: i32) {
        info!("endpoint: notify endpoint set to pid {pid}");
        self.loader_pid.store(pid, Ordering::Relaxed);
    }
}

impl NotifySink for NotifySender {
    fn send_request(&self, pgid: i32, elapsed_secs: u64, job_id: i32) -> io::Result<()> {
        let pid = self.loader_pid.load(Ordering::Relaxed);
        if pid <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no loader registered",
            ));
        }
        let mut msg = format!("{pgid},{elapsed_secs},{job_id}").into_bytes();
        msg.push(0);
        let path = notify_path(&self.run_dir, pid);
        self.socket.send_to(&msg, &path).map(|_| ())
    }
}

/// Loader-side notification endpoint.
pub struct NotifyEndpoint {
    socket: UnixDatagram,
    path: PathBuf,
}

/// A parsed profiling request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingRequest {
    pub pgid: i32,
    pub elapsed_secs: u64,
    pub job_id: i32,
}

impl NotifyEndpoint {
    /// Bind the endpoint for this process's pid under `run_dir`.
    pub fn bind(run_dir: &Path, pid: i32) -> Result<Self> {
        std::fs::create_dir_all(run_dir)
            .with_context(|| format!("creating run dir {}", run_dir.display()))?;
        let path = notify_path(run_dir, pid);
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path)
            .with_context(|| format!("binding notify endpoint {}", path.display()))?;
        Ok(NotifyEndpoint { socket, path })
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Block until a profiling request arrives. Returns `Ok(None)` on a read
    /// timeout so callers can poll a shutdown flag.
    pub fn recv(&self) -> Result<Option<ProfilingRequest>> {
        let mut buf = [0u8; 256];
        let len = match self.socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e).context("receiving profiling request"),
        };
        parse_request(&buf[..len]).map(Some)
    }
}

impl Drop for NotifyEndpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn parse_request(buf: &[u8]) -> Result<ProfilingRequest> {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let text = std::str::from_utf8(&buf[..end]).context("profiling request is not UTF-8")?;
    let mut fields = text.trim().split(',');
    let (Some(pgid), Some(elapsed_secs), Some(job_id)) =
        (fields.next(), fields.next(), fields.next())
    else {
        bail!("malformed profiling request {text:?}");
    };
    Ok(ProfilingRequest {
        pgid: pgid.parse().with_context(|| format!("bad pgid in {text:?}"))?,
        elapsed_secs: elapsed_secs
            .parse()
            .with_context(|| format!("bad elapsed time in {text:?}"))?,
        job_id: job_id
            .parse()
            .with_context(|| format!("bad job id in {text:?}"))?,
    })
}

/// Loader-side ACK sender: one `i32` pgid.
pub fn send_ack(run_dir: &Path, pgid: i32) -> Result<()> {
    let socket = UnixDatagram::unbound()?;
    socket
        .send_to(&pgid.to_ne_bytes(), ack_path(run_dir))
        .with_context(|| format!("sending ACK for pgid {pgid}"))?;
    Ok(())
}

/// Watchdog-side ACK listener thread body: forwards pgids to the watchdog
/// until shutdown.
pub fn run_ack_listener(
    run_dir: &Path,
    watchdog: Arc<Watchdog>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    std::fs::create_dir_all(run_dir)?;
    let path = ack_path(run_dir);
    let _ = std::fs::remove_file(&path);
    let socket = UnixDatagram::bind(&path)
        .with_context(|| format!("binding ACK endpoint {}", path.display()))?;
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;

    let mut buf = [0u8; 16];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv(&mut buf) {
            Ok(len) if len >= 4 => {
                let pgid = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
                if pgid > 0 {
                    watchdog.ack(pgid);
                }
            }
            Ok(len) => debug!("endpoint: short ACK ({len} bytes)"),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("endpoint: ACK receive failed: {e}");
            }
        }
    }
    let _ = std::fs::remove_file(&path);
    Ok(())
}

/// Control server thread body: decodes fixed-size commands and applies them
/// to the watchdog. Errors are logged; the surface is fire-and-forget like
/// the device it stands in for.
pub fn run_control_server(
    run_dir: &Path,
    watchdog: Arc<Watchdog>,
    table: Arc<AttributionTable>,
    notify: Arc<NotifySender>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    std::fs::create_dir_all(run_dir)?;
    let path = control_path(run_dir);
    let _ = std::fs::remove_file(&path);
    let socket = UnixDatagram::bind(&path)
        .with_context(|| format!("binding control endpoint {}", path.display()))?;
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;
    info!("endpoint: control surface at {}", path.display());

    let mut buf = [0u8; 64];
    while !shutdown.load(Ordering::Relaxed) {
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("endpoint: control receive failed: {e}");
                continue;
            }
        };

        let request = match ControlRequest::decode(&buf[..len]) {
            Ok(r) => r,
            Err(e) => {
                warn!("endpoint: bad control payload: {e:#}");
                continue;
            }
        };

        let outcome = match request {
            ControlRequest::AddPgid {
                pgid,
                job_id,
                worker_num,
            } => watchdog.add_pgid(pgid, job_id, worker_num),
            ControlRequest::RemovePgid(pgid) => watchdog.remove_pgid(pgid, &table),
            ControlRequest::SetThreshold(secs) if secs > 0 => {
                watchdog.set_threshold(secs as u64)
            }
            ControlRequest::SetThreshold(secs) => {
                Err(anyhow::anyhow!("invalid threshold {secs}"))
            }
            ControlRequest::SetNotifyEndpoint(pid) => {
                notify.set_loader_pid(pid);
                Ok(())
            }
            ControlRequest::RequestProfile(pid) => watchdog.request_profile(pid),
        };
        if let Err(e) = outcome {
            warn!("endpoint: {request:?} failed: {e:#}");
        }
    }
    let _ = std::fs::remove_file(&path);
    Ok(())
}
