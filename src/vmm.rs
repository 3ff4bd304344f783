//! Typed client for the Firecracker HTTP API over a Unix domain socket.
//!
//! The API surface is small enough that the HTTP/1.1 exchange is framed by
//! hand on a `UnixStream`; no HTTP stack. One connection per request, which
//! matches how Firecracker treats its API socket.
//!
//! Connection-refused errors are retried with bounded backoff (the socket
//! appears a moment after spawn); semantic errors are never retried and
//! surface as [`Error::Vmm`] with the VMM's status and body.

use crate::error::{Error, Result};
use serde_json::json;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Backoff cap for connection-refused retries during boot.
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Total budget for connection-refused retries.
const RETRY_BUDGET: Duration = Duration::from_secs(10);

/// Per-request socket timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot flavor for `snapshot_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    Full,
    Diff,
}

impl SnapshotType {
    fn as_str(self) -> &'static str {
        match self {
            SnapshotType::Full => "Full",
            SnapshotType::Diff => "Diff",
        }
    }
}

/// Client for one VMM's API socket.
#[derive(Debug, Clone)]
pub struct VmmClient {
    socket_path: PathBuf,
}

impl VmmClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait for the VMM to start answering on its API socket.
    pub fn wait_for_socket(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if UnixStream::connect(&self.socket_path).is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::BootFailed(format!(
                    "VMM API socket {} did not appear within {:?}",
                    self.socket_path.display(),
                    timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn put_machine_config(&self, vcpu: u8, mem_mib: u32) -> Result<()> {
        self.request(
            "PUT",
            "/machine-config",
            Some(json!({
                "vcpu_count": vcpu,
                "mem_size_mib": mem_mib,
                "smt": false,
            })),
        )
        .map(drop)
    }

    pub fn put_boot_source(&self, kernel_path: &Path, boot_args: &str) -> Result<()> {
        self.request(
            "PUT",
            "/boot-source",
            Some(json!({
                "kernel_image_path": kernel_path,
                "boot_args": boot_args,
            })),
        )
        .map(drop)
    }

    pub fn put_drive(
        &self,
        drive_id: &str,
        path: &Path,
        is_root: bool,
        is_read_only: bool,
    ) -> Result<()> {
        self.request(
            "PUT",
            &format!("/drives/{}", drive_id),
            Some(json!({
                "drive_id": drive_id,
                "path_on_host": path,
                "is_root_device": is_root,
                "is_read_only": is_read_only,
            })),
        )
        .map(drop)
    }

    pub fn put_network_interface(
        &self,
        iface_id: &str,
        host_tap: &str,
        mac: &str,
    ) -> Result<()> {
        self.request(
            "PUT",
            &format!("/network-interfaces/{}", iface_id),
            Some(json!({
                "iface_id": iface_id,
                "host_dev_name": host_tap,
                "guest_mac": mac,
            })),
        )
        .map(drop)
    }

    /// Configure the vsock device. The VMM will dial host listener sockets
    /// at `"{uds_path}_{port}"` for each port the guest targets.
    pub fn put_vsock(&self, cid: u32, uds_path: &Path) -> Result<()> {
        self.request(
            "PUT",
            "/vsock",
            Some(json!({
                "guest_cid": cid,
                "uds_path": uds_path,
            })),
        )
        .map(drop)
    }

    pub fn start(&self) -> Result<()> {
        self.request(
            "PUT",
            "/actions",
            Some(json!({ "action_type": "InstanceStart" })),
        )
        .map(drop)
    }

    pub fn pause(&self) -> Result<()> {
        self.request("PATCH", "/vm", Some(json!({ "state": "Paused" })))
            .map(drop)
    }

    pub fn resume(&self) -> Result<()> {
        self.request("PATCH", "/vm", Some(json!({ "state": "Resumed" })))
            .map(drop)
    }

    pub fn snapshot_create(
        &self,
        snapshot_type: SnapshotType,
        mem_path: &Path,
        state_path: &Path,
    ) -> Result<()> {
        self.request(
            "PUT",
            "/snapshot/create",
            Some(json!({
                "snapshot_type": snapshot_type.as_str(),
                "mem_file_path": mem_path,
                "snapshot_path": state_path,
            })),
        )
        .map(drop)
    }

    pub fn snapshot_load(&self, mem_path: &Path, state_path: &Path, resume: bool) -> Result<()> {
        self.request(
            "PUT",
            "/snapshot/load",
            Some(json!({
                "mem_file_path": mem_path,
                "snapshot_path": state_path,
                "resume_vm": resume,
            })),
        )
        .map(drop)
    }

    /// One API exchange, retrying only while the connect is refused.
    fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<String>> {
        let body = body.map(|b| b.to_string());
        let deadline = Instant::now() + RETRY_BUDGET;
        let mut backoff = Duration::from_millis(100);

        loop {
            match self.attempt(method, path, body.as_deref()) {
                Err(Error::Io(ref e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
                    ) && Instant::now() + backoff < deadline =>
                {
                    tracing::debug!(
                        socket = %self.socket_path.display(),
                        ?backoff,
                        "VMM socket not ready, retrying"
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                }
                other => return other,
            }
        }
    }

    fn attempt(&self, method: &str, path: &str, body: Option<&str>) -> Result<Option<String>> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
        stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;

        let mut request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\n",
            method, path
        );
        if let Some(body) = body {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");
        if let Some(body) = body {
            request.push_str(body);
        }

        stream.write_all(request.as_bytes())?;
        stream.flush()?;

        parse_response(&mut stream)
    }
}

/// Parse an HTTP/1.1 response, returning the body on 2xx.
fn parse_response(stream: &mut dyn Read) -> Result<Option<String>> {
    let mut raw = Vec::new();
    let mut header_end = None;
    let mut buf = [0u8; 1024];

    // Read until the end of headers, then until Content-Length is satisfied.
    let (status, body) = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 && header_end.is_none() {
            return Err(Error::Internal("VMM closed connection mid-response".into()));
        }
        raw.extend_from_slice(&buf[..n]);

        if header_end.is_none() {
            if let Some(pos) = find_header_end(&raw) {
                header_end = Some(pos);
            } else if n == 0 {
                return Err(Error::Internal("VMM response missing header end".into()));
            } else {
                continue;
            }
        }

        let end = header_end.unwrap();
        let head = std::str::from_utf8(&raw[..end])
            .map_err(|_| Error::Internal("non-UTF-8 VMM response headers".into()))?;
        let status = parse_status(head)?;
        let content_length = parse_content_length(head)?;

        match content_length {
            None | Some(0) => break (status, None),
            Some(len) => {
                if raw.len() >= end + len {
                    let body = String::from_utf8_lossy(&raw[end..end + len]).into_owned();
                    break (status, Some(body));
                }
                if n == 0 {
                    return Err(Error::Internal("VMM response body truncated".into()));
                }
            }
        }
    };

    if (200..300).contains(&status) {
        Ok(body)
    } else {
        Err(Error::Vmm {
            status,
            body: body.unwrap_or_default(),
        })
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_status(head: &str) -> Result<u16> {
    let line = head
        .lines()
        .next()
        .ok_or_else(|| Error::Internal("empty VMM response".into()))?;
    let code = line
        .strip_prefix("HTTP/1.1 ")
        .or_else(|| line.strip_prefix("HTTP/1.0 "))
        .ok_or_else(|| Error::Internal(format!("bad VMM status line: {}", line)))?;
    code.split_whitespace()
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| Error::Internal(format!("bad VMM status line: {}", line)))
}

fn parse_content_length(head: &str) -> Result<Option<usize>> {
    for line in head.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                let len = value.trim().parse().map_err(|_| {
                    Error::Internal(format!("bad Content-Length: {}", value.trim()))
                })?;
                return Ok(Some(len));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;

    /// Serve one canned HTTP response, capturing the request head and body.
    fn serve_once(
        socket: PathBuf,
        response: &'static str,
    ) -> std::thread::JoinHandle<(String, String)> {
        let listener = UnixListener::bind(&socket).unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);

            let mut head = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
                head.push_str(&line);
            }

            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();

            let mut stream = reader.into_inner();
            stream.write_all(response.as_bytes()).unwrap();
            (head, String::from_utf8(body).unwrap())
        })
    }

    #[test]
    fn test_put_machine_config_frames_request() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("fc.sock");
        let server = serve_once(socket.clone(), "HTTP/1.1 204 No Content\r\n\r\n");

        let client = VmmClient::new(&socket);
        client.put_machine_config(2, 256).unwrap();

        let (head, body) = server.join().unwrap();
        assert!(head.starts_with("PUT /machine-config HTTP/1.1\r\n"));
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["vcpu_count"], 2);
        assert_eq!(parsed["mem_size_mib"], 256);
        assert_eq!(parsed["smt"], false);
    }

    #[test]
    fn test_non_2xx_maps_to_vmm_error() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("fc.sock");
        let server = serve_once(
            socket.clone(),
            "HTTP/1.1 400 Bad Request\r\nContent-Length: 26\r\n\r\n{\"fault_message\":\"no kvm\"}",
        );

        let client = VmmClient::new(&socket);
        let err = client.start().unwrap_err();
        server.join().unwrap();

        match err {
            Error::Vmm { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("no kvm"));
            }
            other => panic!("expected Vmm error, got {:?}", other),
        }
    }

    #[test]
    fn test_pause_patches_vm_state() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("fc.sock");
        let server = serve_once(socket.clone(), "HTTP/1.1 204 No Content\r\n\r\n");

        let client = VmmClient::new(&socket);
        client.pause().unwrap();

        let (head, body) = server.join().unwrap();
        assert!(head.starts_with("PATCH /vm HTTP/1.1\r\n"));
        assert_eq!(body, "{\"state\":\"Paused\"}");
    }

    #[test]
    fn test_wait_for_socket_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let client = VmmClient::new(tmp.path().join("absent.sock"));
        let err = client
            .wait_for_socket(Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, Error::BootFailed(_)));
    }

    #[test]
    fn test_snapshot_create_body() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("fc.sock");
        let server = serve_once(socket.clone(), "HTTP/1.1 204 No Content\r\n\r\n");

        let client = VmmClient::new(&socket);
        client
            .snapshot_create(
                SnapshotType::Full,
                Path::new("/snap/mem"),
                Path::new("/snap/state"),
            )
            .unwrap();

        let (_, body) = server.join().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["snapshot_type"], "Full");
        assert_eq!(parsed["mem_file_path"], "/snap/mem");
        assert_eq!(parsed["snapshot_path"], "/snap/state");
    }
}
