//! Per-VM multiplexer for exec, interactive sessions, and file transfers.
//!
//! [`AgentSession`] owns a waiter map keyed by `cmd_id` and a session map
//! keyed by `session_id`. Public operations register a waiter under a
//! short lock, send one message over the current transport, then block on
//! a per-operation condition until the listener or serial reader routes
//! the matching guest message back. Dispatch holds the map lock only long
//! enough to find the waiter.
//!
//! Fire-and-forget operations (input, signal, resize, kill) log failures
//! instead of raising.

use crate::agent::{Transport, TransportKind};
use crate::error::{Error, Result};
use crate::util::{md5_file, md5_hex};
use crate::vsock::listener::TransferHooks;
use crate::vsock::protocol::{FileStat, GuestMessage, HostMessage, StreamKind, SERIAL_TRANSFER_CAP};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Default deadline for small control operations (list_dir, stat_file,
/// serial file acks).
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for downloads, whose size the host cannot know ahead
/// of time.
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Upload deadline: `max(60s, 30s x ceil(size_mb))`.
fn transfer_timeout(size: u64) -> Duration {
    let size_mb = size.div_ceil(1024 * 1024).max(1);
    Duration::from_secs((30 * size_mb).max(60))
}

/// One chunk of streamed exec/session output.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

/// Result of a completed exec.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

/// What a waiter resolves to.
enum Outcome {
    Exec {
        exit_code: i32,
        stdout_tail: String,
        stderr_tail: String,
    },
    Transfer(u64),
    Exit(i32),
    Entries(Vec<String>),
    Stat(FileStat),
    Ack,
}

struct Waiter {
    state: Mutex<Option<Result<Outcome>>>,
    cond: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, result: Result<Outcome>) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(result);
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Duration, what: &str) -> Result<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(what.to_string()));
            }
            if self.cond.wait_for(&mut state, deadline - now).timed_out() && state.is_none() {
                return Err(Error::Timeout(what.to_string()));
            }
        }
        state.take().expect("waiter state checked above")
    }
}

struct SessionState {
    output: Vec<ExecOutput>,
    exit_code: Option<i32>,
    exit_waiter: Arc<Waiter>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            output: Vec::new(),
            exit_code: None,
            exit_waiter: Waiter::new(),
        }
    }
}

/// Shared routing state. Implements [`TransferHooks`] so both the vsock
/// listener and the serial reader feed the same maps.
pub struct SessionRouter {
    vm_id: String,
    waiters: Mutex<HashMap<String, Arc<Waiter>>>,
    sessions: Mutex<HashMap<String, SessionState>>,
    pending_pulls: Mutex<HashMap<String, PathBuf>>,
    pending_pushes: Mutex<HashMap<String, PathBuf>>,
    registered: AtomicBool,
    closed: AtomicBool,
    activity: AtomicU64,
    agent_version: Mutex<Option<String>>,
    vsock: RwLock<Option<Arc<dyn Transport>>>,
    serial: RwLock<Option<Arc<dyn Transport>>>,
    weak_self: Weak<SessionRouter>,
}

impl SessionRouter {
    fn new(vm_id: String) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            vm_id,
            waiters: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            pending_pulls: Mutex::new(HashMap::new()),
            pending_pushes: Mutex::new(HashMap::new()),
            registered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            activity: AtomicU64::new(0),
            agent_version: Mutex::new(None),
            vsock: RwLock::new(None),
            serial: RwLock::new(None),
            weak_self: weak.clone(),
        })
    }

    fn register_waiter(&self, cmd_id: &str) -> Arc<Waiter> {
        let waiter = Waiter::new();
        self.waiters.lock().insert(cmd_id.to_string(), waiter.clone());
        waiter
    }

    fn unregister(&self, cmd_id: &str) {
        self.waiters.lock().remove(cmd_id);
        self.pending_pulls.lock().remove(cmd_id);
        self.pending_pushes.lock().remove(cmd_id);
    }

    fn take_waiter(&self, cmd_id: &str) -> Option<Arc<Waiter>> {
        self.waiters.lock().remove(cmd_id)
    }

    /// The transport for the next host→guest message: vsock once the agent
    /// has registered, serial otherwise.
    fn current_transport(&self) -> Result<Arc<dyn Transport>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AgentDisconnected);
        }
        if self.registered.load(Ordering::SeqCst) {
            if let Some(t) = self.vsock.read().clone() {
                return Ok(t);
            }
        }
        self.serial
            .read()
            .clone()
            .ok_or(Error::AgentDisconnected)
    }

    fn handle_register(&self, agent_version: String, capabilities: Vec<String>) {
        tracing::info!(
            vm = %self.vm_id,
            version = %agent_version,
            ?capabilities,
            "guest agent registered"
        );
        *self.agent_version.lock() = Some(agent_version);
        self.registered.store(true, Ordering::SeqCst);
    }

    /// Serial-only inline file content answering a `read_file`.
    fn handle_file_content(&self, cmd_id: &str, data_b64: &str, checksum: Option<&str>) {
        let result = (|| -> Result<u64> {
            if data_b64.len() as u64 > SERIAL_TRANSFER_CAP * 2 {
                return Err(Error::InvalidArgument(
                    "serial payload exceeds 8 MiB cap".into(),
                ));
            }
            let data = BASE64
                .decode(data_b64)
                .map_err(|e| Error::InvalidArgument(format!("bad base64 payload: {}", e)))?;
            if let Some(expected) = checksum {
                let actual = md5_hex(&data);
                if actual != expected {
                    return Err(Error::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
            let dest = self
                .pending_pulls
                .lock()
                .remove(cmd_id)
                .ok_or_else(|| Error::Internal(format!("no pending pull for {}", cmd_id)))?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let staging = dest.with_extension("partial");
            std::fs::write(&staging, &data)?;
            std::fs::rename(&staging, &dest)?;
            Ok(data.len() as u64)
        })();

        if let Some(waiter) = self.take_waiter(cmd_id) {
            waiter.complete(result.map(Outcome::Transfer));
        }
    }

    /// Unblock every pending caller; used at stop/shutdown.
    fn fail_all(&self) {
        let waiters: Vec<_> = self.waiters.lock().drain().collect();
        for (_, waiter) in waiters {
            waiter.complete(Err(Error::AgentDisconnected));
        }
        let mut sessions = self.sessions.lock();
        for (_, state) in sessions.iter_mut() {
            state.exit_waiter.complete(Err(Error::AgentDisconnected));
        }
        self.pending_pulls.lock().clear();
        self.pending_pushes.lock().clear();
    }
}

impl TransferHooks for SessionRouter {
    fn upload_destination(&self, cmd_id: &str) -> Option<PathBuf> {
        self.pending_pulls.lock().get(cmd_id).cloned()
    }

    fn download_source(&self, cmd_id: &str) -> Option<PathBuf> {
        self.pending_pushes.lock().get(cmd_id).cloned()
    }

    fn complete_transfer(&self, cmd_id: &str, result: Result<u64>) {
        self.activity.fetch_add(1, Ordering::SeqCst);
        self.pending_pulls.lock().remove(cmd_id);
        self.pending_pushes.lock().remove(cmd_id);
        if let Some(waiter) = self.take_waiter(cmd_id) {
            waiter.complete(result.map(Outcome::Transfer));
        }
    }

    fn deliver(&self, msg: GuestMessage) {
        self.activity.fetch_add(1, Ordering::SeqCst);
        match msg {
            GuestMessage::Register {
                agent_version,
                capabilities,
                ..
            } => self.handle_register(agent_version, capabilities),

            GuestMessage::ExecResult {
                cmd_id,
                exit_code,
                stdout_tail,
                stderr_tail,
                ..
            } => {
                if let Some(waiter) = self.take_waiter(&cmd_id) {
                    waiter.complete(Ok(Outcome::Exec {
                        exit_code,
                        stdout_tail,
                        stderr_tail,
                    }));
                } else {
                    tracing::debug!(cmd_id = %cmd_id, "exec result for unknown command");
                }
            }

            GuestMessage::SessionOutput {
                session_id,
                stream,
                data_b64,
                ..
            } => match BASE64.decode(&data_b64) {
                Ok(bytes) => {
                    let mut sessions = self.sessions.lock();
                    if let Some(state) = sessions.get_mut(&session_id) {
                        state.output.push(ExecOutput { stream, bytes });
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "undecodable session output")
                }
            },

            GuestMessage::SessionExit {
                session_id,
                exit_code,
                ..
            } => {
                let waiter = {
                    let mut sessions = self.sessions.lock();
                    sessions.get_mut(&session_id).map(|state| {
                        state.exit_code = Some(exit_code);
                        state.exit_waiter.clone()
                    })
                };
                if let Some(waiter) = waiter {
                    waiter.complete(Ok(Outcome::Exit(exit_code)));
                }
            }

            GuestMessage::FileContent {
                cmd_id,
                data_b64,
                checksum_md5,
                ..
            } => self.handle_file_content(&cmd_id, &data_b64, checksum_md5.as_deref()),

            GuestMessage::FileWritten { cmd_id, .. } => {
                if let Some(waiter) = self.take_waiter(&cmd_id) {
                    waiter.complete(Ok(Outcome::Ack));
                }
            }

            GuestMessage::DirList { cmd_id, entries, .. } => {
                if let Some(waiter) = self.take_waiter(&cmd_id) {
                    waiter.complete(Ok(Outcome::Entries(entries)));
                }
            }

            GuestMessage::FileInfo { cmd_id, info, .. } => {
                if let Some(waiter) = self.take_waiter(&cmd_id) {
                    waiter.complete(Ok(Outcome::Stat(info)));
                }
            }

            GuestMessage::Failed { cmd_id, error, .. } => {
                tracing::warn!(vm = %self.vm_id, cmd_id = ?cmd_id, error = %error, "agent reported failure");
                if let Some(cmd_id) = cmd_id {
                    self.pending_pulls.lock().remove(&cmd_id);
                    self.pending_pushes.lock().remove(&cmd_id);
                    if let Some(waiter) = self.take_waiter(&cmd_id) {
                        waiter.complete(Err(Error::Internal(format!("agent: {}", error))));
                    }
                }
            }

            other => {
                tracing::debug!(vm = %self.vm_id, ?other, "unexpected guest message on event path");
            }
        }
    }

    fn on_connection_reset(&self) {
        if !self.registered.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Give the guest a reconnect window before downgrading to serial.
        let generation = self.activity.load(Ordering::SeqCst);
        let weak = self.weak_self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(crate::agent::RECONNECT_GRACE);
            if let Some(router) = weak.upgrade() {
                if router.activity.load(Ordering::SeqCst) == generation
                    && router.registered.swap(false, Ordering::SeqCst)
                {
                    tracing::warn!(vm = %router.vm_id, "vsock went quiet, falling back to serial");
                }
            }
        });
    }
}

/// The public per-VM agent handle.
pub struct AgentSession {
    router: Arc<SessionRouter>,
}

impl AgentSession {
    pub fn new(vm_id: impl Into<String>) -> Self {
        Self {
            router: SessionRouter::new(vm_id.into()),
        }
    }

    /// The sink to wire into [`VsockListener`] and [`SerialBridge`].
    ///
    /// [`VsockListener`]: crate::vsock::VsockListener
    /// [`SerialBridge`]: crate::serial::SerialBridge
    pub fn router(&self) -> Arc<SessionRouter> {
        self.router.clone()
    }

    pub fn set_vsock_transport(&self, transport: Arc<dyn Transport>) {
        *self.router.vsock.write() = Some(transport);
    }

    pub fn set_serial_transport(&self, transport: Arc<dyn Transport>) {
        *self.router.serial.write() = Some(transport);
    }

    /// Whether the agent has registered over vsock.
    pub fn registered(&self) -> bool {
        self.router.registered.load(Ordering::SeqCst)
    }

    /// Force the registered flag; used on restore, where the guest memory
    /// already holds a registered agent.
    pub fn mark_registered(&self) {
        self.router.registered.store(true, Ordering::SeqCst);
    }

    pub fn agent_version(&self) -> Option<String> {
        self.router.agent_version.lock().clone()
    }

    /// Which transport the next operation would use.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.router.current_transport().ok().map(|t| t.kind())
    }

    /// Run a command in the guest and wait for its exit.
    ///
    /// Streamed output collected while waiting is drained to `output_cb`
    /// before returning, including on timeout.
    pub fn exec(
        &self,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        cwd: Option<String>,
        timeout: Duration,
        output_cb: Option<&mut dyn FnMut(&ExecOutput)>,
    ) -> Result<ExecOutcome> {
        let cmd_id = uuid::Uuid::new_v4().to_string();
        let waiter = self.router.register_waiter(&cmd_id);
        self.router
            .sessions
            .lock()
            .insert(cmd_id.clone(), SessionState::new());

        let send_result = self.router.current_transport().and_then(|transport| {
            transport.send(&HostMessage::Exec {
                id: cmd_id.clone(),
                cmd_id: cmd_id.clone(),
                argv,
                env,
                cwd,
                timeout_ms: Some(timeout.as_millis() as u64),
                pty: false,
                cols: None,
                rows: None,
            })
        });
        if let Err(e) = send_result {
            self.router.unregister(&cmd_id);
            self.router.sessions.lock().remove(&cmd_id);
            return Err(e);
        }

        let result = waiter.wait(timeout, "exec");

        // Drain whatever output arrived, even on failure.
        let buffered = self
            .router
            .sessions
            .lock()
            .remove(&cmd_id)
            .map(|s| s.output)
            .unwrap_or_default();
        if let Some(cb) = output_cb {
            for item in &buffered {
                cb(item);
            }
        }

        match result {
            Ok(Outcome::Exec {
                exit_code,
                stdout_tail,
                stderr_tail,
            }) => Ok(ExecOutcome {
                exit_code,
                stdout_tail,
                stderr_tail,
            }),
            Ok(_) => {
                self.router.unregister(&cmd_id);
                Err(Error::Internal("mismatched reply to exec".into()))
            }
            Err(e) => {
                self.router.unregister(&cmd_id);
                if matches!(e, Error::Timeout(_)) {
                    // Treat the exec as an implicit session and reap it.
                    self.kill(&cmd_id);
                }
                Err(e)
            }
        }
    }

    /// Like [`exec`](Self::exec), but a non-zero exit is an error.
    pub fn exec_checked(
        &self,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        cwd: Option<String>,
        timeout: Duration,
    ) -> Result<ExecOutcome> {
        let outcome = self.exec(argv, env, cwd, timeout, None)?;
        if outcome.exit_code != 0 {
            return Err(Error::NonZeroExit(outcome.exit_code));
        }
        Ok(outcome)
    }

    /// Start a long-lived session; returns its id once the transport has
    /// accepted the message.
    pub fn start_session(&self, argv: Vec<String>, pty: bool) -> Result<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.router
            .sessions
            .lock()
            .insert(session_id.clone(), SessionState::new());

        let send_result = self.router.current_transport().and_then(|transport| {
            transport.send(&HostMessage::SessionStart {
                id: session_id.clone(),
                session_id: session_id.clone(),
                argv,
                pty,
                cols: if pty { Some(80) } else { None },
                rows: if pty { Some(24) } else { None },
            })
        });
        if let Err(e) = send_result {
            self.router.sessions.lock().remove(&session_id);
            return Err(e);
        }
        Ok(session_id)
    }

    /// Fire-and-forget: write to a session's stdin.
    pub fn send_input(&self, session_id: &str, data: &[u8]) {
        self.fire_and_forget(
            "session_input",
            &HostMessage::SessionInput {
                id: session_id.to_string(),
                session_id: session_id.to_string(),
                data_b64: BASE64.encode(data),
            },
        );
    }

    /// Fire-and-forget: signal a session.
    pub fn signal(&self, session_id: &str, signum: i32) {
        self.fire_and_forget(
            "session_signal",
            &HostMessage::SessionSignal {
                id: session_id.to_string(),
                session_id: session_id.to_string(),
                signum,
            },
        );
    }

    /// Fire-and-forget: resize a PTY session.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        self.fire_and_forget(
            "session_resize",
            &HostMessage::SessionResize {
                id: session_id.to_string(),
                session_id: session_id.to_string(),
                cols,
                rows,
            },
        );
    }

    /// Fire-and-forget: kill a session.
    pub fn kill(&self, session_id: &str) {
        self.fire_and_forget(
            "session_kill",
            &HostMessage::SessionKill {
                id: session_id.to_string(),
                session_id: session_id.to_string(),
            },
        );
    }

    /// Broadcast kill to every live session (the stop barrier).
    pub fn kill_all(&self) {
        let ids: Vec<String> = self.router.sessions.lock().keys().cloned().collect();
        for id in ids {
            self.kill(&id);
        }
    }

    fn fire_and_forget(&self, what: &str, msg: &HostMessage) {
        match self.router.current_transport() {
            Ok(transport) => {
                if let Err(e) = transport.send(msg) {
                    tracing::warn!(vm = %self.router.vm_id, op = what, error = %e, "agent send failed");
                }
            }
            Err(e) => {
                tracing::warn!(vm = %self.router.vm_id, op = what, error = %e, "no transport");
            }
        }
    }

    /// Take buffered output for a session.
    pub fn drain_output(&self, session_id: &str) -> Vec<ExecOutput> {
        let mut sessions = self.router.sessions.lock();
        sessions
            .get_mut(session_id)
            .map(|s| std::mem::take(&mut s.output))
            .unwrap_or_default()
    }

    /// Block until a session exits; returns its exit code.
    pub fn wait_session(&self, session_id: &str, timeout: Duration) -> Result<i32> {
        let waiter = {
            let sessions = self.router.sessions.lock();
            let state = sessions
                .get(session_id)
                .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;
            if let Some(code) = state.exit_code {
                return Ok(code);
            }
            state.exit_waiter.clone()
        };
        match waiter.wait(timeout, "session exit")? {
            Outcome::Exit(code) => {
                self.router.sessions.lock().remove(session_id);
                Ok(code)
            }
            _ => Err(Error::Internal("mismatched session exit".into())),
        }
    }

    /// Copy a host file into the guest.
    ///
    /// MD5 is computed before send and verified by the guest. Over serial
    /// the payload is inlined (capped at 8 MiB); over vsock the guest pulls
    /// the bytes through a streaming `download` exchange.
    pub fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let (size, checksum) = md5_file(local)?;
        let timeout = timeout.unwrap_or_else(|| transfer_timeout(size));

        let transport = self.router.current_transport()?;
        if let Some(cap) = transport.transfer_cap() {
            if size > cap {
                return Err(Error::InvalidArgument(format!(
                    "{} is {} bytes; serial transfers are capped at {} bytes",
                    local.display(),
                    size,
                    cap
                )));
            }
        }

        let cmd_id = uuid::Uuid::new_v4().to_string();
        let waiter = self.router.register_waiter(&cmd_id);

        let data_b64 = match transport.kind() {
            TransportKind::Vsock => {
                self.router
                    .pending_pushes
                    .lock()
                    .insert(cmd_id.clone(), local.to_path_buf());
                None
            }
            TransportKind::Serial => Some(BASE64.encode(std::fs::read(local)?)),
        };

        let send_result = transport.send(&HostMessage::WriteFile {
            id: cmd_id.clone(),
            cmd_id: cmd_id.clone(),
            path: remote.to_string(),
            size,
            checksum_md5: checksum,
            data_b64,
        });
        if let Err(e) = send_result {
            self.router.unregister(&cmd_id);
            return Err(e);
        }

        match waiter.wait(timeout, "upload") {
            Ok(Outcome::Transfer(_)) | Ok(Outcome::Ack) => Ok(()),
            Ok(_) => Err(Error::Internal("mismatched reply to upload".into())),
            Err(e) => {
                self.router.unregister(&cmd_id);
                Err(e)
            }
        }
    }

    /// Copy a guest file onto the host.
    ///
    /// The received file is staged and renamed into place only after its
    /// checksum verifies, so no partial file is left at `local`.
    pub fn download_file(
        &self,
        remote: &str,
        local: &Path,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        let timeout = timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);
        let transport = self.router.current_transport()?;

        let cmd_id = uuid::Uuid::new_v4().to_string();
        let waiter = self.router.register_waiter(&cmd_id);
        self.router
            .pending_pulls
            .lock()
            .insert(cmd_id.clone(), local.to_path_buf());

        let send_result = transport.send(&HostMessage::ReadFile {
            id: cmd_id.clone(),
            cmd_id: cmd_id.clone(),
            path: remote.to_string(),
        });
        if let Err(e) = send_result {
            self.router.unregister(&cmd_id);
            return Err(e);
        }

        match waiter.wait(timeout, "download") {
            Ok(Outcome::Transfer(size)) => Ok(size),
            Ok(_) => Err(Error::Internal("mismatched reply to download".into())),
            Err(e) => {
                self.router.unregister(&cmd_id);
                Err(e)
            }
        }
    }

    /// Small-file helper: fetch a guest file's bytes.
    pub fn get_file_contents(&self, remote: &str) -> Result<Vec<u8>> {
        let staging = std::env::temp_dir().join(format!("bandsox-dl-{}", uuid::Uuid::new_v4()));
        let result = self
            .download_file(remote, &staging, None)
            .and_then(|_| std::fs::read(&staging).map_err(Error::from));
        let _ = std::fs::remove_file(&staging);
        result
    }

    /// List a directory inside the guest.
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let cmd_id = uuid::Uuid::new_v4().to_string();
        let waiter = self.router.register_waiter(&cmd_id);

        let send_result = self.router.current_transport().and_then(|t| {
            t.send(&HostMessage::ListDir {
                id: cmd_id.clone(),
                cmd_id: cmd_id.clone(),
                path: path.to_string(),
            })
        });
        if let Err(e) = send_result {
            self.router.unregister(&cmd_id);
            return Err(e);
        }

        match waiter.wait(DEFAULT_OP_TIMEOUT, "list_dir") {
            Ok(Outcome::Entries(entries)) => Ok(entries),
            Ok(_) => Err(Error::Internal("mismatched reply to list_dir".into())),
            Err(e) => {
                self.router.unregister(&cmd_id);
                Err(e)
            }
        }
    }

    /// Stat a file inside the guest.
    pub fn stat_file(&self, path: &str) -> Result<FileStat> {
        let cmd_id = uuid::Uuid::new_v4().to_string();
        let waiter = self.router.register_waiter(&cmd_id);

        let send_result = self.router.current_transport().and_then(|t| {
            t.send(&HostMessage::StatFile {
                id: cmd_id.clone(),
                cmd_id: cmd_id.clone(),
                path: path.to_string(),
            })
        });
        if let Err(e) = send_result {
            self.router.unregister(&cmd_id);
            return Err(e);
        }

        match waiter.wait(DEFAULT_OP_TIMEOUT, "stat_file") {
            Ok(Outcome::Stat(info)) => Ok(info),
            Ok(_) => Err(Error::Internal("mismatched reply to stat_file".into())),
            Err(e) => {
                self.router.unregister(&cmd_id);
                Err(e)
            }
        }
    }

    /// Tear the session down: every pending caller unblocks with
    /// `AgentDisconnected` and no further callbacks fire.
    pub fn close(&self) {
        self.router.closed.store(true, Ordering::SeqCst);
        self.router.fail_all();
        *self.router.vsock.write() = None;
        *self.router.serial.write() = None;
    }
}
