//! Container image to ext4 rootfs conversion.
//!
//! The core invokes an [`ImageBuilder`] with an image reference and a size
//! hint and gets back an ext4 file honoring the guest init contract: PID 1
//! invokes `/usr/local/bin/agent.py` with `/proc`, `/sys` and `/dev/pts`
//! mounted, reads the vsock port from the kernel command line, and exports
//! it as `BANDSOX_VSOCK_PORT`.
//!
//! The default builder shells out to docker for the filesystem contents
//! and caches one base ext4 per image reference; VMs get copies of the
//! base.

use crate::error::{Error, Result};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Default rootfs size when the caller gives no hint.
pub const DEFAULT_ROOTFS_SIZE_MIB: u64 = 1024;

/// Init script installed at `/init` in every rootfs.
const INIT_SCRIPT: &str = r#"#!/bin/sh
mount -t proc proc /proc
mount -t sysfs sysfs /sys
mkdir -p /dev/pts
mount -t devpts devpts /dev/pts

for arg in $(cat /proc/cmdline); do
    case "$arg" in
        bandsox.vsock_port=*) export BANDSOX_VSOCK_PORT="${arg#bandsox.vsock_port=}" ;;
    esac
done

exec /usr/local/bin/agent.py
"#;

/// Builds ext4 rootfs images from container image references.
pub trait ImageBuilder: Send + Sync {
    /// Return the path to a base ext4 for `image`, building it if needed.
    fn build(&self, image: &str, size_hint_mib: u64) -> Result<PathBuf>;
}

/// Docker-backed builder caching one base ext4 per image reference.
pub struct DockerImageBuilder {
    images_dir: PathBuf,
}

impl DockerImageBuilder {
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
        }
    }

    fn base_path(&self, image: &str) -> PathBuf {
        self.images_dir
            .join(format!("{}.ext4", sanitize_image_ref(image)))
    }

    fn build_rootfs(&self, image: &str, dest: &Path, size_mib: u64) -> Result<()> {
        tracing::info!(image = %image, dest = %dest.display(), size_mib, "building rootfs");

        create_sparse_file(dest, size_mib * 1024 * 1024)?;
        run(
            "mkfs.ext4",
            &["-F", "-q", "-m", "0", "-L", "bandsox", &path_str(dest)?],
        )?;

        let mount_dir = dest.with_extension("mnt");
        std::fs::create_dir_all(&mount_dir)?;

        let result = self.populate(image, dest, &mount_dir);

        // Unmount and clean up regardless of how population went.
        let _ = Command::new("umount").arg(&mount_dir).output();
        let _ = std::fs::remove_dir(&mount_dir);

        if let Err(e) = &result {
            tracing::warn!(image = %image, error = %e, "rootfs build failed, removing image");
            let _ = std::fs::remove_file(dest);
        }
        result
    }

    fn populate(&self, image: &str, dest: &Path, mount_dir: &Path) -> Result<()> {
        run(
            "mount",
            &["-o", "loop", &path_str(dest)?, &path_str(mount_dir)?],
        )?;

        // docker create + export gives the flattened filesystem without
        // running the container.
        let container = {
            let output = Command::new("docker")
                .args(["create", image])
                .output()
                .map_err(|e| Error::Internal(format!("docker not runnable: {}", e)))?;
            if !output.status.success() {
                return Err(Error::InvalidArgument(format!(
                    "docker create {} failed: {}",
                    image,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        };

        let export = (|| -> Result<()> {
            let mut export_child = Command::new("docker")
                .args(["export", &container])
                .stdout(std::process::Stdio::piped())
                .spawn()
                .map_err(|e| Error::Internal(format!("docker export failed: {}", e)))?;
            let export_stdout = export_child.stdout.take().ok_or_else(|| {
                Error::Internal("docker export produced no stdout".into())
            })?;
            let status = Command::new("tar")
                .args(["-x", "-C", &path_str(mount_dir)?])
                .stdin(export_stdout)
                .status()?;
            let _ = export_child.wait();
            if !status.success() {
                return Err(Error::Internal("tar extraction failed".into()));
            }
            Ok(())
        })();

        run_tolerant("docker", &["rm", &container]);
        export?;

        // Install the init contract.
        let init_path = mount_dir.join("init");
        std::fs::write(&init_path, INIT_SCRIPT)?;
        set_executable(&init_path)?;

        for dir in ["proc", "sys", "dev", "bsx"] {
            std::fs::create_dir_all(mount_dir.join(dir))?;
        }

        Ok(())
    }
}

impl ImageBuilder for DockerImageBuilder {
    fn build(&self, image: &str, size_hint_mib: u64) -> Result<PathBuf> {
        let base = self.base_path(image);
        if base.exists() {
            tracing::debug!(image = %image, base = %base.display(), "rootfs cache hit");
            return Ok(base);
        }

        std::fs::create_dir_all(&self.images_dir)?;
        let size = if size_hint_mib == 0 {
            DEFAULT_ROOTFS_SIZE_MIB
        } else {
            size_hint_mib
        };
        self.build_rootfs(image, &base, size)?;
        Ok(base)
    }
}

/// Sanitize an image reference into a filename.
pub fn sanitize_image_ref(image: &str) -> String {
    image.replace([':', '/'], "_")
}

/// Create a sparse file of the given size.
fn create_sparse_file(path: &Path, size_bytes: u64) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.seek(SeekFrom::Start(size_bytes - 1))?;
    file.write_all(&[0])?;
    file.sync_all()?;
    Ok(())
}

fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(String::from)
        .ok_or_else(|| Error::InvalidArgument(format!("non-UTF-8 path: {}", path.display())))
}

fn run(program: &str, args: &[&str]) -> Result<()> {
    tracing::debug!(cmd = %format!("{} {}", program, args.join(" ")), "running");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Internal(format!("{} not runnable: {}", program, e)))?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "{} failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn run_tolerant(program: &str, args: &[&str]) {
    if let Ok(output) = Command::new(program).args(args).output() {
        if !output.status.success() {
            tracing::debug!(
                cmd = %format!("{} {}", program, args.join(" ")),
                "cleanup command failed (continuing)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_image_ref() {
        assert_eq!(sanitize_image_ref("alpine:latest"), "alpine_latest");
        assert_eq!(
            sanitize_image_ref("ghcr.io/org/app:1.2"),
            "ghcr.io_org_app_1.2"
        );
    }

    #[test]
    fn test_base_path_per_image() {
        let builder = DockerImageBuilder::new("/var/lib/bandsox/images");
        assert_eq!(
            builder.base_path("alpine:3.19"),
            PathBuf::from("/var/lib/bandsox/images/alpine_3.19.ext4")
        );
    }

    #[test]
    fn test_create_sparse_file_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.ext4");
        create_sparse_file(&path, 4 * 1024 * 1024).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 1024 * 1024);
        // Refuses to clobber an existing image.
        assert!(create_sparse_file(&path, 1024).is_err());
    }

    #[test]
    fn test_init_script_contract() {
        // The init contract: proc/sys/devpts mounts, vsock port export,
        // agent exec.
        assert!(INIT_SCRIPT.contains("mount -t proc"));
        assert!(INIT_SCRIPT.contains("mount -t devpts"));
        assert!(INIT_SCRIPT.contains("BANDSOX_VSOCK_PORT"));
        assert!(INIT_SCRIPT.contains("exec /usr/local/bin/agent.py"));
    }
}
