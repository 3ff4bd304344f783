//! Crash-safe persistent allocators for vsock CIDs and listener ports.
//!
//! Both allocators keep their entire state in a single JSON file under the
//! storage root. Every mutation is a read-lock-modify-fsync-unlock cycle:
//! an advisory exclusive `flock` is taken on a sidecar `.lock` file (stable
//! across the atomic rename of the state file), the state is re-parsed,
//! mutated, written to a temp file and renamed into place. This makes
//! allocation safe against concurrent managers on the same host.

use crate::error::{Error, Result};
use crate::util::write_json_atomic;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// First CID handed out. 0, 1 and 2 are reserved
/// (hypervisor, local, host).
pub const FIRST_CID: u32 = 3;

/// Upper bound (exclusive) of the CID range.
pub const MAX_CID: u32 = u32::MAX - 2;

/// Inclusive vsock control port range.
pub const PORT_MIN: u16 = 9000;
pub const PORT_MAX: u16 = 9999;

/// An exclusive advisory lock on a file, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Load allocator state, defaulting when the file does not exist yet.
///
/// A present-but-unparseable state file is an error: silently resetting the
/// pool could double-allocate ids still held by live VMs.
fn load_state<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match std::fs::read(path) {
        Ok(data) if data.is_empty() => Ok(T::default()),
        Ok(data) => serde_json::from_slice(&data).map_err(|e| {
            Error::Internal(format!(
                "corrupt allocator state at {}: {}",
                path.display(),
                e
            ))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

// ============================================================================
// CID allocator
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct CidState {
    free: Vec<u32>,
    next: u32,
}

impl Default for CidState {
    fn default() -> Self {
        Self {
            free: Vec::new(),
            next: FIRST_CID,
        }
    }
}

/// Persistent allocator for vsock guest CIDs in `[3, 2^32 - 3)`.
#[derive(Debug, Clone)]
pub struct CidAllocator {
    path: PathBuf,
}

impl CidAllocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Allocate an unused CID, preferring the free-list (LIFO).
    pub fn acquire(&self) -> Result<u32> {
        let _lock = FileLock::exclusive(&lock_path(&self.path))?;
        let mut state: CidState = load_state(&self.path)?;

        let cid = if let Some(cid) = state.free.pop() {
            cid
        } else if state.next < MAX_CID {
            let cid = state.next;
            state.next += 1;
            cid
        } else {
            return Err(Error::AllocatorExhausted("vsock CIDs"));
        };

        write_json_atomic(&self.path, &state)?;
        Ok(cid)
    }

    /// Return a CID to the pool. No-op if not currently allocated.
    pub fn release(&self, cid: u32) -> Result<()> {
        let _lock = FileLock::exclusive(&lock_path(&self.path))?;
        let mut state: CidState = load_state(&self.path)?;

        if cid >= FIRST_CID && cid < state.next && !state.free.contains(&cid) {
            state.free.push(cid);
            write_json_atomic(&self.path, &state)?;
        }
        Ok(())
    }

}

// ============================================================================
// Port allocator
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct PortState {
    used: BTreeSet<u16>,
    next: u16,
}

impl Default for PortState {
    fn default() -> Self {
        Self {
            used: BTreeSet::new(),
            next: PORT_MIN,
        }
    }
}

/// Persistent allocator for vsock control ports in `[9000, 9999]`.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    path: PathBuf,
}

impl PortAllocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Allocate a free port, scanning forward from `next` modulo the range.
    pub fn acquire(&self) -> Result<u16> {
        let _lock = FileLock::exclusive(&lock_path(&self.path))?;
        let mut state: PortState = load_state(&self.path)?;

        let span = (PORT_MAX - PORT_MIN) as usize + 1;
        let mut candidate = state.next.clamp(PORT_MIN, PORT_MAX);

        for _ in 0..span {
            if !state.used.contains(&candidate) {
                state.used.insert(candidate);
                state.next = wrap_next(candidate);
                write_json_atomic(&self.path, &state)?;
                return Ok(candidate);
            }
            candidate = wrap_next(candidate);
        }

        Err(Error::AllocatorExhausted("vsock ports"))
    }

    /// Remove a port from the used set. No-op if not currently allocated.
    pub fn release(&self, port: u16) -> Result<()> {
        let _lock = FileLock::exclusive(&lock_path(&self.path))?;
        let mut state: PortState = load_state(&self.path)?;

        if state.used.remove(&port) {
            write_json_atomic(&self.path, &state)?;
        }
        Ok(())
    }

}

fn wrap_next(port: u16) -> u16 {
    if port >= PORT_MAX {
        PORT_MIN
    } else {
        port + 1
    }
}
