//! Shared utility functions.

use crate::error::Result;
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp as seconds since Unix epoch.
///
/// Returns the timestamp as a simple string (e.g., "1705312345").
pub fn current_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    format!("{}", duration.as_secs())
}

/// MD5 hex digest of a byte slice.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// MD5 hex digest and size of a file, computed streaming.
pub fn md5_file(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
        size += n as u64;
    }

    Ok((size, format!("{:x}", ctx.compute())))
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// Writes to `<path>.tmp`, fsyncs, then renames over `path`, so readers
/// never observe a partial file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    use std::io::Write;

    let data = serde_json::to_vec_pretty(value)?;
    let tmp = tmp_path(path);

    let mut file = File::create(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hex_known_vectors() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_md5_file_matches_in_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let (size, digest) = md5_file(&path).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(digest, md5_hex(&data));
    }

    #[test]
    fn test_write_json_atomic_leaves_no_tmp() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");

        write_json_atomic(&path, &serde_json::json!({"n": 1})).unwrap();
        assert!(path.exists());
        assert!(!tmp.path().join("state.json.tmp").exists());

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["n"], 1);
    }
}
