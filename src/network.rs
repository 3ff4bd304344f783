//! TAP/NAT provisioning for VM networking.
//!
//! Each networked VM gets a TAP device and a /24 inside 172.16.0.0/16
//! derived from its id: the host takes .1 (gateway), the guest .2. NAT out
//! of the default interface is set up with iptables MASQUERADE. The core
//! assumes it may exec privileged networking helpers; commands run through
//! `ip`/`sysctl`/`iptables` directly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::process::Command;

/// Network shape persisted in the VM descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Host TAP device name.
    pub tap_name: String,
    /// Guest MAC address.
    pub mac: String,
    /// Guest IP address.
    pub guest_ip: String,
    /// Host (gateway) IP address.
    pub host_ip: String,
    /// Netmask CIDR bits.
    pub mask_cidr: u8,
}

impl NetworkConfig {
    /// Kernel `ip=` boot argument configuring the guest statically.
    ///
    /// Format: `ip=<client>::<gateway>:<netmask>::<device>:off`.
    pub fn boot_arg(&self) -> String {
        format!(
            "ip={}::{}:255.255.255.0::eth0:off",
            self.guest_ip, self.host_ip
        )
    }
}

/// Sets up networking before boot and tears it down on delete.
pub trait NetworkProvisioner: Send + Sync {
    fn provision(&self, vm_id: &str) -> Result<NetworkConfig>;
    fn teardown(&self, config: &NetworkConfig) -> Result<()>;
}

/// Derive a VM's network shape from its id.
///
/// The subnet index comes from the trailing hex of the id, so restarts of
/// the same VM land on the same subnet.
pub fn derive_config(vm_id: &str) -> NetworkConfig {
    let hex: Vec<char> = vm_id.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    let tail: String = hex[hex.len().saturating_sub(2)..].iter().collect();
    let index = u8::from_str_radix(&tail, 16).unwrap_or_else(|_| {
        // Non-hex id: hash the bytes instead.
        vm_id.bytes().fold(0u8, |acc, b| acc.wrapping_add(b))
    });

    let short: String = vm_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();

    NetworkConfig {
        tap_name: format!("tap{}", short),
        mac: format!("AA:FC:00:00:{:02x}:02", index),
        guest_ip: format!("172.16.{}.2", index),
        host_ip: format!("172.16.{}.1", index),
        mask_cidr: 24,
    }
}

/// Default provisioner: TAP device + IP forwarding + MASQUERADE.
pub struct TapNetwork;

impl TapNetwork {
    /// The interface holding the default route (NAT egress).
    fn default_interface() -> String {
        let output = Command::new("ip")
            .args(["route", "show", "default"])
            .output();
        if let Ok(output) = output {
            let text = String::from_utf8_lossy(&output.stdout);
            let parts: Vec<&str> = text.split_whitespace().collect();
            if let Some(pos) = parts.iter().position(|&p| p == "dev") {
                if let Some(dev) = parts.get(pos + 1) {
                    return dev.to_string();
                }
            }
        }
        "eth0".to_string()
    }
}

impl NetworkProvisioner for TapNetwork {
    fn provision(&self, vm_id: &str) -> Result<NetworkConfig> {
        let config = derive_config(vm_id);
        tracing::info!(
            vm = %vm_id,
            tap = %config.tap_name,
            host_ip = %config.host_ip,
            "setting up TAP device"
        );

        // The TAP may survive from a previous run; setting the address and
        // link state below recovers it either way.
        run_unchecked(
            "ip",
            &["tuntap", "add", "dev", &config.tap_name, "mode", "tap"],
        );

        run_checked(
            "ip",
            &[
                "addr",
                "replace",
                &format!("{}/{}", config.host_ip, config.mask_cidr),
                "dev",
                &config.tap_name,
            ],
        )?;
        run_checked("ip", &["link", "set", &config.tap_name, "up"])?;
        run_checked("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;

        let egress = Self::default_interface();
        tracing::debug!(egress = %egress, "enabling NAT");
        run_unchecked(
            "iptables",
            &["-t", "nat", "-A", "POSTROUTING", "-o", &egress, "-j", "MASQUERADE"],
        );
        run_unchecked(
            "iptables",
            &[
                "-A", "FORWARD", "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED",
                "-j", "ACCEPT",
            ],
        );
        run_unchecked(
            "iptables",
            &["-A", "FORWARD", "-i", &config.tap_name, "-o", &egress, "-j", "ACCEPT"],
        );

        Ok(config)
    }

    fn teardown(&self, config: &NetworkConfig) -> Result<()> {
        tracing::info!(tap = %config.tap_name, "tearing down TAP device");
        run_unchecked(
            "ip",
            &["tuntap", "del", "dev", &config.tap_name, "mode", "tap"],
        );
        let egress = Self::default_interface();
        run_unchecked(
            "iptables",
            &["-D", "FORWARD", "-i", &config.tap_name, "-o", &egress, "-j", "ACCEPT"],
        );
        Ok(())
    }
}

/// A provisioner that refuses to run; used when networking is disabled.
pub struct NoNetwork;

impl NetworkProvisioner for NoNetwork {
    fn provision(&self, vm_id: &str) -> Result<NetworkConfig> {
        Err(Error::InvalidArgument(format!(
            "networking disabled for VM {}",
            vm_id
        )))
    }

    fn teardown(&self, _config: &NetworkConfig) -> Result<()> {
        Ok(())
    }
}

fn run_checked(program: &str, args: &[&str]) -> Result<()> {
    tracing::debug!(cmd = %format!("{} {}", program, args.join(" ")), "running");
    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Run a command whose failure is tolerable (rule already present, device
/// already gone). Failures are logged, not raised.
fn run_unchecked(program: &str, args: &[&str]) {
    match Command::new(program).args(args).output() {
        Ok(output) if !output.status.success() => {
            tracing::debug!(
                cmd = %format!("{} {}", program, args.join(" ")),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "command failed (continuing)"
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(cmd = %program, error = %e, "command not runnable (continuing)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_config_is_deterministic() {
        let a = derive_config("3c9f2d44-aaaa-bbbb-cccc-0123456789ab");
        let b = derive_config("3c9f2d44-aaaa-bbbb-cccc-0123456789ab");
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_config_uses_trailing_hex() {
        let config = derive_config("9e107d9d-aaaa-bbbb-cccc-0123456789ab");
        assert_eq!(config.guest_ip, "172.16.171.2");
        assert_eq!(config.host_ip, "172.16.171.1");
        assert_eq!(config.mac, "AA:FC:00:00:ab:02");
        assert_eq!(config.mask_cidr, 24);
        assert!(config.tap_name.starts_with("tap"));
        // Linux interface names cap at 15 chars.
        assert!(config.tap_name.len() <= 15);
    }

    #[test]
    fn test_boot_arg_shape() {
        let config = derive_config("0000000000000000000000000000007f");
        assert_eq!(
            config.boot_arg(),
            "ip=172.16.127.2::172.16.127.1:255.255.255.0::eth0:off"
        );
    }

    #[test]
    fn test_non_hex_id_still_derives() {
        let config = derive_config("zzzz");
        assert!(config.guest_ip.starts_with("172.16."));
    }
}
