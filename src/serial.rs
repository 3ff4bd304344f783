//! Line-framed fallback protocol over the VMM's serial console.
//!
//! The guest kernel is booted with `console=ttyS0`, so the VMM child's
//! stdio doubles as a byte pipe to the guest agent. Records are one JSON
//! object per line; anything that does not parse as JSON is kernel noise
//! and is ignored. File transfers are capped (no streaming) and carried
//! base64-inline in a single record.
//!
//! Latency and throughput are explicitly not goals here; correctness is.

use crate::error::{Error, Result};
use crate::vsock::listener::TransferHooks;
use crate::vsock::protocol::HostMessage;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bridge between the host and the guest agent over the VMM's stdio.
pub struct SerialBridge {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    closed: Arc<AtomicBool>,
    reader_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SerialBridge {
    /// Start the bridge over the VMM child's pipes. The reader thread runs
    /// until EOF (VMM exit) or [`SerialBridge::close`].
    pub fn start(
        writer: impl Write + Send + 'static,
        reader: impl Read + Send + 'static,
        hooks: Arc<dyn TransferHooks>,
    ) -> Arc<Self> {
        let closed = Arc::new(AtomicBool::new(false));

        let bridge = Arc::new(Self {
            writer: Mutex::new(Some(Box::new(writer))),
            closed: closed.clone(),
            reader_thread: Mutex::new(None),
        });

        let handle = std::thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || read_loop(reader, hooks, closed))
            .ok();
        *bridge.reader_thread.lock() = handle;

        bridge
    }

    /// Write one host record to the guest console.
    pub fn send(&self, msg: &HostMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AgentDisconnected);
        }
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(Error::AgentDisconnected)?;

        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        writer.write_all(&line).map_err(|e| {
            tracing::warn!(error = %e, "serial write failed");
            Error::AgentDisconnected
        })?;
        writer.flush().map_err(|_| Error::AgentDisconnected)?;
        Ok(())
    }

    /// Stop the bridge. Pending sends fail with `AgentDisconnected`; the
    /// reader thread winds down on its own when the VMM's pipe closes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.writer.lock() = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn read_loop(reader: impl Read, hooks: Arc<dyn TransferHooks>, closed: Arc<AtomicBool>) {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break, // VMM exited
            Ok(_) => {}
            Err(e) => {
                if !closed.load(Ordering::SeqCst) {
                    tracing::debug!(error = %e, "serial read error");
                }
                break;
            }
        }
        if closed.load(Ordering::SeqCst) {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || !trimmed.starts_with('{') {
            continue; // kernel output
        }
        match serde_json::from_str(trimmed) {
            Ok(msg) => hooks.deliver(msg),
            Err(_) => {
                // Kernel noise that happens to start with a brace.
                tracing::trace!(line = %trimmed, "ignoring non-protocol console line");
            }
        }
    }

    tracing::debug!("serial reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsock::protocol::GuestMessage;
    use parking_lot::Mutex as PlMutex;
    use std::path::PathBuf;
    use std::time::Duration;

    #[derive(Default)]
    struct Sink {
        delivered: PlMutex<Vec<GuestMessage>>,
    }

    impl TransferHooks for Sink {
        fn upload_destination(&self, _cmd_id: &str) -> Option<PathBuf> {
            None
        }
        fn download_source(&self, _cmd_id: &str) -> Option<PathBuf> {
            None
        }
        fn complete_transfer(&self, _cmd_id: &str, _result: crate::error::Result<u64>) {}
        fn deliver(&self, msg: GuestMessage) {
            self.delivered.lock().push(msg);
        }
        fn on_connection_reset(&self) {}
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_json_records_amid_kernel_noise() {
        let sink = Arc::new(Sink::default());
        let console = concat!(
            "[    0.000000] Linux version 5.10.0\n",
            "[    0.120000] Run /init as init process\n",
            "{\"type\":\"register\",\"id\":\"r1\",\"agent_version\":\"0.3.0\"}\n",
            "{ this is not json\n",
            "{\"type\":\"exec_result\",\"id\":\"e1\",\"cmd_id\":\"c1\",\"exit_code\":0}\n",
        );

        let _bridge = SerialBridge::start(
            std::io::sink(),
            std::io::Cursor::new(console.as_bytes().to_vec()),
            sink.clone(),
        );

        wait_for(|| sink.delivered.lock().len() == 2);
        let delivered = sink.delivered.lock();
        assert!(matches!(delivered[0], GuestMessage::Register { .. }));
        assert!(matches!(
            &delivered[1],
            GuestMessage::ExecResult { cmd_id, exit_code: 0, .. } if cmd_id == "c1"
        ));
    }

    #[test]
    fn test_send_writes_one_line() {
        let buffer: Arc<PlMutex<Vec<u8>>> = Arc::new(PlMutex::new(Vec::new()));

        struct Shared(Arc<PlMutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let bridge = SerialBridge::start(
            Shared(buffer.clone()),
            std::io::Cursor::new(Vec::new()),
            Arc::new(Sink::default()),
        );

        bridge
            .send(&HostMessage::SessionKill {
                id: "k1".into(),
                session_id: "s1".into(),
            })
            .unwrap();

        let written = buffer.lock();
        let text = std::str::from_utf8(&written).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.contains("\"type\":\"session_kill\""));
    }

    #[test]
    fn test_send_after_close_fails_disconnected() {
        let bridge = SerialBridge::start(
            std::io::sink(),
            std::io::Cursor::new(Vec::new()),
            Arc::new(Sink::default()),
        );
        bridge.close();
        assert!(matches!(
            bridge.send(&HostMessage::Pong { id: "x".into() }),
            Err(Error::AgentDisconnected)
        ));
    }
}
