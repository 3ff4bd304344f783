//! bandsox - Firecracker microVM sandbox manager.
//!
//! bandsox creates strongly isolated, fast-booting Linux sandboxes from
//! container images. Each sandbox is a Firecracker microVM; command
//! execution and file transfer are brokered between the host and an
//! in-guest agent over vsock, with a line-framed serial fallback.

pub mod agent;
pub mod alloc;
pub mod config;
pub mod error;
pub mod image;
pub mod manager;
pub mod network;
pub mod process;
pub mod serial;
pub mod snapshot;
pub mod store;
pub mod util;
pub mod vm;
pub mod vmm;
pub mod vsock;

pub use error::{Error, Result};
pub use manager::Manager;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
