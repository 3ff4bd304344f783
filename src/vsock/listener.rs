//! Host listener for guest-initiated vsock connections.
//!
//! Firecracker forwards a guest `AF_VSOCK connect(CID=2, port)` to a Unix
//! socket at `"{uds_path}_{port}"`. One accept thread runs per bound port;
//! accepted connections are dispatched to a bounded worker pool so the
//! accept path never blocks on handler code.
//!
//! Each connection carries exactly one request-response exchange; streaming
//! transfers span multiple body frames but stay on one connection.

use crate::error::{Error, Result};
use crate::util::md5_file;
use crate::vsock::protocol::{
    self, GuestMessage, HostMessage, Parsed, CHUNK_SIZE,
};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Close connections idle for longer than this.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum concurrently running connection handlers.
const MAX_WORKERS: usize = 64;

/// Maximum queued connections awaiting a worker; beyond this the oldest
/// queued connection is closed.
const MAX_QUEUE: usize = 256;

/// Poll interval of the accept loops (the listener is non-blocking so
/// shutdown can interrupt it).
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Where the listener routes guest traffic.
///
/// Implemented by the AgentSession's router: pending file transfers are
/// looked up by `cmd_id`, everything else is delivered as an event.
pub trait TransferHooks: Send + Sync {
    /// Host path to write a guest-initiated `upload` to, if `cmd_id` names
    /// a pending `download_file`.
    fn upload_destination(&self, cmd_id: &str) -> Option<PathBuf>;

    /// Host path to stream for a guest-initiated `download`, if `cmd_id`
    /// names a pending `upload_file`.
    fn download_source(&self, cmd_id: &str) -> Option<PathBuf>;

    /// Resolve the waiter for a finished transfer.
    fn complete_transfer(&self, cmd_id: &str, result: Result<u64>);

    /// Deliver a non-transfer guest message (register, exec_result,
    /// session events, ...).
    fn deliver(&self, msg: GuestMessage);

    /// The control-port connection died underneath us (reset/broken pipe).
    fn on_connection_reset(&self);
}

/// Multi-port vsock host listener for one VM.
pub struct VsockListener {
    base: PathBuf,
    ports: Vec<u16>,
    hooks: Arc<dyn TransferHooks>,
    running: Arc<AtomicBool>,
    pool: Arc<WorkerPool>,
    accept_threads: Vec<std::thread::JoinHandle<()>>,
    bound_paths: Vec<PathBuf>,
}

impl VsockListener {
    /// Bind listener sockets at `"{base}_{port}"` for every port and start
    /// the accept loops.
    pub fn bind(base: &Path, ports: &[u16], hooks: Arc<dyn TransferHooks>) -> Result<Self> {
        if let Some(parent) = base.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let running = Arc::new(AtomicBool::new(true));
        let pool = Arc::new(WorkerPool::new(MAX_WORKERS, MAX_QUEUE));

        let mut accept_threads = Vec::new();
        let mut bound_paths = Vec::new();

        for &port in ports {
            let path = crate::vm::listener_path_for(base, port);

            // A stale socket from a dead manager blocks the bind.
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed stale vsock socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove stale socket");
                }
            }

            let listener = UnixListener::bind(&path)?;
            listener.set_nonblocking(true)?;
            bound_paths.push(path.clone());

            let running = running.clone();
            let pool = pool.clone();
            let hooks = hooks.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vsock-accept-{}", port))
                .spawn(move || accept_loop(listener, path, running, pool, hooks))
                .map_err(Error::from)?;
            accept_threads.push(handle);
        }

        tracing::info!(base = %base.display(), ?ports, "vsock listener started");

        Ok(Self {
            base: base.to_path_buf(),
            ports: ports.to_vec(),
            hooks,
            running,
            pool,
            accept_threads,
            bound_paths,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Hooks shared with the accept path, for rebinding after a snapshot.
    pub fn hooks(&self) -> Arc<dyn TransferHooks> {
        self.hooks.clone()
    }

    /// Close the listening sockets and stop all threads.
    ///
    /// Used both at VM stop and around snapshot creation (the VMM needs
    /// the backend quiesced). Idempotent.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.pool.shutdown();

        for handle in self.accept_threads.drain(..) {
            let _ = handle.join();
        }

        for path in &self.bound_paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove listener socket");
                }
            }
        }

        tracing::info!(base = %self.base.display(), "vsock listener stopped");
    }
}

impl Drop for VsockListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: UnixListener,
    path: PathBuf,
    running: Arc<AtomicBool>,
    pool: Arc<WorkerPool>,
    hooks: Arc<dyn TransferHooks>,
) {
    tracing::debug!(path = %path.display(), "accept loop started");

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let hooks = hooks.clone();
                pool.submit(stream, hooks);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(path = %path.display(), error = %e, "accept error");
                    hooks.on_connection_reset();
                }
                break;
            }
        }
    }

    tracing::debug!(path = %path.display(), "accept loop ended");
}

// ============================================================================
// Worker pool
// ============================================================================

struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue: Mutex<VecDeque<(UnixStream, Arc<dyn TransferHooks>)>>,
    available: Condvar,
    idle: AtomicUsize,
    workers: AtomicUsize,
    shutdown: AtomicBool,
    max_workers: usize,
    max_queue: usize,
}

impl WorkerPool {
    fn new(max_workers: usize, max_queue: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                idle: AtomicUsize::new(0),
                workers: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                max_workers,
                max_queue,
            }),
        }
    }

    /// Queue a connection, spawning a worker if none is idle and the pool
    /// has headroom. Over-full queues shed the oldest entry.
    fn submit(&self, stream: UnixStream, hooks: Arc<dyn TransferHooks>) {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut queue = inner.queue.lock();
        queue.push_back((stream, hooks));
        if queue.len() > inner.max_queue {
            queue.pop_front();
            tracing::warn!("vsock handler queue full, dropping oldest connection");
        }

        let needs_worker = inner.idle.load(Ordering::SeqCst) == 0
            && inner.workers.load(Ordering::SeqCst) < inner.max_workers;
        drop(queue);

        if needs_worker {
            self.spawn_worker();
        }
        inner.available.notify_one();
    }

    fn spawn_worker(&self) {
        let inner = self.inner.clone();
        inner.workers.fetch_add(1, Ordering::SeqCst);
        let result = std::thread::Builder::new()
            .name("vsock-worker".to_string())
            .spawn(move || {
                loop {
                    let job = {
                        let mut queue = inner.queue.lock();
                        loop {
                            if let Some(job) = queue.pop_front() {
                                break Some(job);
                            }
                            if inner.shutdown.load(Ordering::SeqCst) {
                                break None;
                            }
                            inner.idle.fetch_add(1, Ordering::SeqCst);
                            let timed_out = inner
                                .available
                                .wait_for(&mut queue, Duration::from_secs(30))
                                .timed_out();
                            inner.idle.fetch_sub(1, Ordering::SeqCst);
                            if timed_out && queue.is_empty() {
                                break None;
                            }
                        }
                    };

                    match job {
                        Some((stream, hooks)) => handle_connection(stream, hooks),
                        None => break,
                    }
                }
                inner.workers.fetch_sub(1, Ordering::SeqCst);
            });
        if result.is_err() {
            self.inner.workers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.queue.lock().clear();
        self.inner.available.notify_all();
    }
}

// ============================================================================
// Connection handling
// ============================================================================

fn handle_connection(stream: UnixStream, hooks: Arc<dyn TransferHooks>) {
    let _ = stream.set_read_timeout(Some(IDLE_TIMEOUT));
    let _ = stream.set_write_timeout(Some(IDLE_TIMEOUT));

    if let Err(e) = handle_exchange(stream, &hooks) {
        match &e {
            Error::Io(io) if is_reset(io) => {
                tracing::debug!(error = %io, "guest connection reset");
                hooks.on_connection_reset();
            }
            _ => tracing::warn!(error = %e, "vsock connection error"),
        }
    }
}

fn is_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
    )
}

fn handle_exchange(stream: UnixStream, hooks: &Arc<dyn TransferHooks>) -> Result<()> {
    let mut reader = BufReader::new(stream);

    let line = match protocol::read_header_line(&mut reader)? {
        Some(line) => line,
        None => return Ok(()), // guest connected and went away
    };

    let msg = match protocol::parse_header::<GuestMessage>(&line) {
        Parsed::Message(msg) => msg,
        Parsed::Unsupported { id } => {
            let mut stream = reader.into_inner();
            protocol::write_message(
                &mut stream,
                &HostMessage::Error {
                    id,
                    code: "unsupported".into(),
                    message: "unknown message type".into(),
                },
            )?;
            return Ok(());
        }
        Parsed::Malformed => {
            tracing::warn!("malformed JSON from guest, dropping connection");
            return Ok(());
        }
    };

    match msg {
        GuestMessage::Ping { id } => {
            let mut stream = reader.into_inner();
            protocol::write_message(&mut stream, &HostMessage::Pong { id })
        }
        GuestMessage::Upload {
            id,
            cmd_id,
            path,
            size,
            checksum_md5,
            mode: _,
        } => handle_upload(reader, hooks, id, cmd_id, path, size, checksum_md5),
        GuestMessage::Download { id, cmd_id, path } => {
            handle_download(reader, hooks, id, cmd_id, path)
        }
        other => {
            // register / exec_result / session events / serial-style acks.
            let id = message_id(&other);
            hooks.deliver(other);
            let mut stream = reader.into_inner();
            protocol::write_message(&mut stream, &HostMessage::Success { id, size: None })
        }
    }
}

fn message_id(msg: &GuestMessage) -> String {
    // Serializing just to fish out `id` would be silly; match instead.
    match msg {
        GuestMessage::Ping { id }
        | GuestMessage::Register { id, .. }
        | GuestMessage::Upload { id, .. }
        | GuestMessage::Download { id, .. }
        | GuestMessage::Complete { id, .. }
        | GuestMessage::ExecResult { id, .. }
        | GuestMessage::SessionOutput { id, .. }
        | GuestMessage::SessionExit { id, .. }
        | GuestMessage::FileContent { id, .. }
        | GuestMessage::FileWritten { id, .. }
        | GuestMessage::DirList { id, .. }
        | GuestMessage::FileInfo { id, .. }
        | GuestMessage::Failed { id, .. } => id.clone(),
    }
}

/// Guest streams a file to the host (the receiving half of
/// `download_file`).
fn handle_upload(
    mut reader: BufReader<UnixStream>,
    hooks: &Arc<dyn TransferHooks>,
    id: String,
    cmd_id: String,
    path: String,
    size: u64,
    checksum_md5: String,
) -> Result<()> {
    let dest = hooks
        .upload_destination(&cmd_id)
        .unwrap_or_else(|| PathBuf::from(&path));
    tracing::info!(cmd_id = %cmd_id, dest = %dest.display(), size, "receiving upload");

    // Tell the guest to start streaming.
    {
        let stream = reader.get_mut();
        protocol::write_message(
            stream,
            &HostMessage::Ready {
                id: id.clone(),
                size: None,
                checksum_md5: None,
            },
        )?;
    }

    // Stage into a temp file so a failed transfer leaves no partial file.
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = dest.with_extension("partial");
    let result = receive_body(&mut reader, &staging, size, &checksum_md5);

    match result {
        Ok(received) => {
            std::fs::rename(&staging, &dest)?;
            let stream = reader.get_mut();
            protocol::write_message(
                stream,
                &HostMessage::Success {
                    id,
                    size: Some(received),
                },
            )?;
            hooks.complete_transfer(&cmd_id, Ok(received));
            tracing::info!(cmd_id = %cmd_id, dest = %dest.display(), received, "upload complete");
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&staging);
            let stream = reader.get_mut();
            let _ = protocol::write_message(
                stream,
                &HostMessage::Error {
                    id,
                    code: error_code(&e),
                    message: e.to_string(),
                },
            );
            hooks.complete_transfer(&cmd_id, Err(e));
            Ok(())
        }
    }
}

fn error_code(e: &Error) -> String {
    match e {
        Error::ChecksumMismatch { .. } => "checksum_mismatch".into(),
        Error::NotFound(_) => "not_found".into(),
        Error::InvalidArgument(_) => "invalid_argument".into(),
        _ => "io_error".into(),
    }
}

fn receive_body(
    reader: &mut BufReader<UnixStream>,
    staging: &Path,
    size: u64,
    expected_md5: &str,
) -> Result<u64> {
    let mut file = BufWriter::new(File::create(staging)?);
    let mut ctx = md5::Context::new();
    let mut received = 0u64;

    while received < size {
        let chunk = protocol::read_chunk(reader)?
            .ok_or_else(|| Error::Internal("connection closed during upload".into()))?;
        if received + chunk.len() as u64 > size {
            return Err(Error::InvalidArgument(
                "guest sent more bytes than declared".into(),
            ));
        }
        ctx.consume(&chunk);
        file.write_all(&chunk)?;
        received += chunk.len() as u64;
    }
    file.flush()?;
    file.into_inner()
        .map_err(|e| Error::Internal(format!("flush failed: {}", e)))?
        .sync_all()?;

    let actual = format!("{:x}", ctx.compute());
    if actual != expected_md5 {
        return Err(Error::ChecksumMismatch {
            expected: expected_md5.to_string(),
            actual,
        });
    }
    Ok(received)
}

/// Guest pulls a file from the host (the sending half of `upload_file`).
fn handle_download(
    mut reader: BufReader<UnixStream>,
    hooks: &Arc<dyn TransferHooks>,
    id: String,
    cmd_id: String,
    path: String,
) -> Result<()> {
    let source = hooks
        .download_source(&cmd_id)
        .unwrap_or_else(|| PathBuf::from(&path));
    tracing::info!(cmd_id = %cmd_id, source = %source.display(), "serving download");

    let (size, checksum) = match md5_file(&source) {
        Ok(pair) => pair,
        Err(_) => {
            let stream = reader.get_mut();
            let e = Error::NotFound(format!("file {}", source.display()));
            let _ = protocol::write_message(
                stream,
                &HostMessage::Error {
                    id,
                    code: error_code(&e),
                    message: e.to_string(),
                },
            );
            hooks.complete_transfer(&cmd_id, Err(e));
            return Ok(());
        }
    };

    {
        let stream = reader.get_mut();
        protocol::write_message(
            stream,
            &HostMessage::Ready {
                id,
                size: Some(size),
                checksum_md5: Some(checksum),
            },
        )?;
    }

    let mut file = File::open(&source)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    {
        let stream = reader.get_mut();
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            protocol::write_chunk(stream, &buf[..n])?;
        }
        stream.flush()?;
    }

    // The guest confirms after writing and verifying on its side.
    let result = match protocol::read_header_line(&mut reader)? {
        Some(line) => match protocol::parse_header::<GuestMessage>(&line) {
            Parsed::Message(GuestMessage::Complete { .. }) => Ok(size),
            Parsed::Message(GuestMessage::Failed { error, .. }) => {
                Err(Error::Internal(format!("guest rejected download: {}", error)))
            }
            _ => Err(Error::Internal("unexpected reply to download".into())),
        },
        None => Err(Error::Internal("connection closed before completion".into())),
    };

    let ok = result.is_ok();
    hooks.complete_transfer(&cmd_id, result);
    if ok {
        tracing::info!(cmd_id = %cmd_id, source = %source.display(), size, "download complete");
    }
    Ok(())
}
