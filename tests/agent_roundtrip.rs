//! End-to-end exercise of the host communication plane.
//!
//! A scripted guest stands in for the VMM + agent: it serves the
//! hybrid-vsock endpoint the host dials for control messages, and opens
//! fresh connections to the host listener for replies and file
//! transfers, exactly as a real agent would.

use bandsox::agent::{AgentSession, VsockTransport};
use bandsox::vm::listener_path_for;
use bandsox::vsock::protocol::{
    self, GuestMessage, HostMessage, Parsed, CHUNK_SIZE,
};
use bandsox::vsock::{VsockListener, GUEST_CONTROL_PORT};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const CONTROL_PORT: u16 = 9000;

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Connect to the host listener the way the in-guest agent would.
fn guest_connect(listener_path: &Path) -> BufReader<UnixStream> {
    for _ in 0..100 {
        if let Ok(stream) = UnixStream::connect(listener_path) {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            return BufReader::new(stream);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("listener never came up at {}", listener_path.display());
}

fn read_host_reply(reader: &mut BufReader<UnixStream>) -> HostMessage {
    let line = protocol::read_header_line(reader).unwrap().unwrap();
    serde_json::from_str(&line).unwrap()
}

/// The scripted guest: serves host-initiated control connections and
/// reacts to exec/read_file/write_file by dialing the host listener.
struct FakeGuest {
    listener_path: PathBuf,
    /// The guest's "filesystem".
    files: parking_lot::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl FakeGuest {
    fn serve(self: Arc<Self>, control: UnixListener) {
        for stream in control.incoming() {
            let Ok(stream) = stream else { break };
            let guest = self.clone();
            std::thread::spawn(move || guest.handle_control(stream));
        }
    }

    fn handle_control(&self, stream: UnixStream) {
        let mut reader = BufReader::new(stream);

        // Hybrid-vsock handshake.
        let mut connect_line = String::new();
        reader.read_line(&mut connect_line).unwrap();
        assert_eq!(
            connect_line.trim(),
            format!("CONNECT {}", GUEST_CONTROL_PORT)
        );
        reader
            .get_mut()
            .write_all(format!("OK {}\n", GUEST_CONTROL_PORT).as_bytes())
            .unwrap();

        let Ok(Some(line)) = protocol::read_header_line(&mut reader) else {
            return;
        };
        let msg: HostMessage = match protocol::parse_header(&line) {
            Parsed::Message(msg) => msg,
            _ => panic!("guest got unparseable control message: {}", line),
        };

        match msg {
            HostMessage::Exec { cmd_id, argv, .. } => {
                // "echo hi" exits 0 with its arguments as stdout.
                let stdout = format!("{}\n", argv[1..].join(" "));
                let mut conn = guest_connect(&self.listener_path);
                protocol::write_message(
                    conn.get_mut(),
                    &GuestMessage::ExecResult {
                        id: cmd_id.clone(),
                        cmd_id,
                        exit_code: 0,
                        stdout_tail: stdout,
                        stderr_tail: String::new(),
                    },
                )
                .unwrap();
                read_host_reply(&mut conn);
            }

            HostMessage::WriteFile {
                cmd_id,
                path,
                size,
                checksum_md5,
                ..
            } => {
                // Pull the payload from the host through a download
                // exchange, then "write" it into the guest filesystem.
                let mut conn = guest_connect(&self.listener_path);
                protocol::write_message(
                    conn.get_mut(),
                    &GuestMessage::Download {
                        id: cmd_id.clone(),
                        cmd_id: cmd_id.clone(),
                        path: path.clone(),
                    },
                )
                .unwrap();

                let declared = match read_host_reply(&mut conn) {
                    HostMessage::Ready {
                        size: Some(size), ..
                    } => size,
                    other => panic!("expected ready, got {:?}", other),
                };
                assert_eq!(declared, size);

                let mut data = Vec::new();
                while (data.len() as u64) < declared {
                    let chunk = protocol::read_chunk(&mut conn).unwrap().unwrap();
                    data.extend_from_slice(&chunk);
                }
                assert_eq!(md5_hex(&data), checksum_md5);
                self.files.lock().insert(path, data);

                protocol::write_message(
                    conn.get_mut(),
                    &GuestMessage::Complete {
                        id: cmd_id.clone(),
                        cmd_id,
                        checksum_md5: Some(checksum_md5),
                    },
                )
                .unwrap();
            }

            HostMessage::ReadFile { cmd_id, path, .. } => {
                // Push the requested guest file through an upload
                // exchange.
                let data = self
                    .files
                    .lock()
                    .get(&path)
                    .cloned()
                    .expect("guest file requested before it was written");

                let mut conn = guest_connect(&self.listener_path);
                protocol::write_message(
                    conn.get_mut(),
                    &GuestMessage::Upload {
                        id: cmd_id.clone(),
                        cmd_id,
                        path,
                        size: data.len() as u64,
                        checksum_md5: md5_hex(&data),
                        mode: None,
                    },
                )
                .unwrap();
                match read_host_reply(&mut conn) {
                    HostMessage::Ready { .. } => {}
                    other => panic!("expected ready, got {:?}", other),
                }
                for chunk in data.chunks(CHUNK_SIZE) {
                    protocol::write_chunk(conn.get_mut(), chunk).unwrap();
                }
                match read_host_reply(&mut conn) {
                    HostMessage::Success { .. } => {}
                    other => panic!("expected success, got {:?}", other),
                }
            }

            other => panic!("guest got unexpected control message: {:?}", other),
        }
    }
}

/// Wire up a session, its listener, and the scripted guest.
fn plumbing(tmp: &tempfile::TempDir) -> (AgentSession, VsockListener, Arc<FakeGuest>) {
    let base = tmp.path().join("vsock_itest.sock");

    let session = AgentSession::new("vm-itest");
    let listener = VsockListener::bind(&base, &[CONTROL_PORT], session.router()).unwrap();

    // The fake guest's control endpoint doubles as the VMM socket the
    // host transport dials.
    let control = UnixListener::bind(&base).unwrap();
    let guest = Arc::new(FakeGuest {
        listener_path: listener_path_for(&base, CONTROL_PORT),
        files: parking_lot::Mutex::new(std::collections::HashMap::new()),
    });
    {
        let guest = guest.clone();
        std::thread::spawn(move || guest.serve(control));
    }

    session.set_vsock_transport(Arc::new(VsockTransport::new(&base, GUEST_CONTROL_PORT)));
    session.mark_registered();

    (session, listener, guest)
}

#[test]
fn test_register_flows_through_listener() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("vsock_reg.sock");

    let session = AgentSession::new("vm-reg");
    let mut listener = VsockListener::bind(&base, &[CONTROL_PORT], session.router()).unwrap();
    assert!(!session.registered());

    let mut conn = guest_connect(&listener_path_for(&base, CONTROL_PORT));
    protocol::write_message(
        conn.get_mut(),
        &GuestMessage::Register {
            id: "r1".into(),
            agent_version: "0.3.0".into(),
            capabilities: vec!["exec".into()],
        },
    )
    .unwrap();
    read_host_reply(&mut conn);

    assert!(session.registered());
    assert_eq!(session.agent_version().as_deref(), Some("0.3.0"));
    listener.shutdown();
}

#[test]
fn test_exec_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let (session, mut listener, _guest) = plumbing(&tmp);

    let outcome = session
        .exec(
            vec!["echo".into(), "hi".into()],
            vec![],
            None,
            Duration::from_secs(10),
            None,
        )
        .unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout_tail, "hi\n");

    listener.shutdown();
}

#[test]
fn test_upload_download_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let (session, mut listener, guest) = plumbing(&tmp);

    // Deterministic pseudo-random payload spanning several chunks.
    let payload: Vec<u8> = (0..300_000u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 11) as u8)
        .collect();
    let local = tmp.path().join("outbound.bin");
    std::fs::write(&local, &payload).unwrap();

    session
        .upload_file(&local, "/data/blob.bin", Some(Duration::from_secs(10)))
        .unwrap();
    assert_eq!(
        guest.files.lock().get("/data/blob.bin").unwrap(),
        &payload
    );

    // Round-trip: what went up comes back byte-identical.
    let fetched = tmp.path().join("inbound.bin");
    let size = session
        .download_file("/data/blob.bin", &fetched, Some(Duration::from_secs(10)))
        .unwrap();
    assert_eq!(size, payload.len() as u64);
    assert_eq!(std::fs::read(&fetched).unwrap(), payload);

    listener.shutdown();
}

#[test]
fn test_get_file_contents() {
    let tmp = tempfile::tempdir().unwrap();
    let (session, mut listener, guest) = plumbing(&tmp);

    guest
        .files
        .lock()
        .insert("/bsx/marker".into(), b"1\n".to_vec());

    let bytes = session.get_file_contents("/bsx/marker").unwrap();
    assert_eq!(bytes, b"1\n");

    listener.shutdown();
}

#[test]
fn test_empty_upload_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let (session, mut listener, guest) = plumbing(&tmp);

    let local = tmp.path().join("empty.bin");
    std::fs::write(&local, b"").unwrap();

    session
        .upload_file(&local, "/data/empty", Some(Duration::from_secs(10)))
        .unwrap();
    assert_eq!(guest.files.lock().get("/data/empty").unwrap().len(), 0);

    listener.shutdown();
}
