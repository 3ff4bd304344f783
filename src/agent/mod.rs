//! Host-side session with the in-guest agent.
//!
//! Host→guest traffic rides a [`Transport`]: vsock when the agent has
//! registered, the serial console otherwise. Guest→host traffic arrives
//! through the vsock listener or the serial reader and is routed to
//! waiting callers by the session (see [`session`]).

pub mod session;

pub use session::{AgentSession, ExecOutcome, ExecOutput};

use crate::error::{Error, Result};
use crate::serial::SerialBridge;
use crate::vsock::protocol::{HostMessage, SERIAL_TRANSFER_CAP};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How long after boot to wait for the agent's `register` before falling
/// back to serial.
pub const REGISTRATION_GRACE: Duration = Duration::from_secs(5);

/// How long a dropped vsock connection may stay quiet before the session
/// downgrades to serial.
pub const RECONNECT_GRACE: Duration = Duration::from_secs(2);

/// Which channel a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Vsock,
    Serial,
}

/// A one-way host→guest message channel.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Deliver one control message to the guest.
    fn send(&self, msg: &HostMessage) -> Result<()>;

    /// Hard cap on file payload size, if the channel cannot stream.
    fn transfer_cap(&self) -> Option<u64> {
        None
    }
}

/// Host-initiated vsock connection through the VMM's hybrid endpoint.
///
/// Connecting to the VMM's `uds_path` and issuing `CONNECT <port>` opens a
/// byte pipe to the guest listener on that port. One fresh connection per
/// message; connections are not pooled.
pub struct VsockTransport {
    uds_path: PathBuf,
    guest_port: u32,
}

impl VsockTransport {
    pub fn new(uds_path: impl Into<PathBuf>, guest_port: u32) -> Self {
        Self {
            uds_path: uds_path.into(),
            guest_port,
        }
    }
}

impl Transport for VsockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Vsock
    }

    fn send(&self, msg: &HostMessage) -> Result<()> {
        let stream = UnixStream::connect(&self.uds_path).map_err(|e| {
            tracing::debug!(path = %self.uds_path.display(), error = %e, "vsock connect failed");
            Error::AgentDisconnected
        })?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;

        let mut reader = BufReader::new(stream);

        // Hybrid-vsock handshake.
        reader
            .get_mut()
            .write_all(format!("CONNECT {}\n", self.guest_port).as_bytes())
            .map_err(|_| Error::AgentDisconnected)?;
        let mut ack = String::new();
        reader
            .read_line(&mut ack)
            .map_err(|_| Error::AgentDisconnected)?;
        if !ack.starts_with("OK") {
            tracing::debug!(ack = %ack.trim(), "vsock CONNECT rejected");
            return Err(Error::AgentDisconnected);
        }

        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        reader
            .get_mut()
            .write_all(&line)
            .map_err(|_| Error::AgentDisconnected)?;
        reader
            .get_mut()
            .flush()
            .map_err(|_| Error::AgentDisconnected)?;
        Ok(())
    }
}

/// Serial console transport, shared with the [`SerialBridge`].
pub struct SerialTransport {
    bridge: Arc<SerialBridge>,
}

impl SerialTransport {
    pub fn new(bridge: Arc<SerialBridge>) -> Self {
        Self { bridge }
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn send(&self, msg: &HostMessage) -> Result<()> {
        self.bridge.send(msg)
    }

    fn transfer_cap(&self) -> Option<u64> {
        Some(SERIAL_TRANSFER_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_vsock_transport_handshake() {
        let tmp = tempfile::tempdir().unwrap();
        let uds = tmp.path().join("vm.sock");
        let listener = UnixListener::bind(&uds).unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut connect_line = String::new();
            reader.read_line(&mut connect_line).unwrap();
            reader.get_mut().write_all(b"OK 6000\n").unwrap();
            let mut payload = String::new();
            reader.read_line(&mut payload).unwrap();
            (connect_line, payload)
        });

        let transport = VsockTransport::new(&uds, 6000);
        transport
            .send(&HostMessage::SessionKill {
                id: "k".into(),
                session_id: "s".into(),
            })
            .unwrap();

        let (connect_line, payload) = server.join().unwrap();
        assert_eq!(connect_line, "CONNECT 6000\n");
        assert!(payload.contains("\"type\":\"session_kill\""));
    }

    #[test]
    fn test_vsock_transport_rejected_handshake() {
        let tmp = tempfile::tempdir().unwrap();
        let uds = tmp.path().join("vm.sock");
        let listener = UnixListener::bind(&uds).unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            reader.get_mut().write_all(b"ERR\n").unwrap();
        });

        let transport = VsockTransport::new(&uds, 6000);
        let err = transport
            .send(&HostMessage::Pong { id: "p".into() })
            .unwrap_err();
        assert!(matches!(err, Error::AgentDisconnected));
        server.join().unwrap();
    }

    #[test]
    fn test_vsock_transport_no_vmm() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = VsockTransport::new(tmp.path().join("absent.sock"), 6000);
        assert!(matches!(
            transport.send(&HostMessage::Pong { id: "p".into() }),
            Err(Error::AgentDisconnected)
        ));
    }
}
