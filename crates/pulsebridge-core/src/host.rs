//! Identity of the bridge host, reported in the initialization event.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;

use tracing::debug;

use crate::types::is_valid_mac_address;

/// Public address used only to select the outbound route; nothing is sent.
const ROUTE_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

const SYS_CLASS_NET: &str = "/sys/class/net";

/// LAN address and hardware identifier of the machine running the bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    /// Non-loopback IPv4 address of the outbound interface.
    pub lan_address: Option<IpAddr>,
    /// MAC address of the first non-loopback network interface, as the
    /// 48-bit integer the endpoint stores.
    pub hardware_id: Option<u64>,
}

impl HostIdentity {
    /// Inspect the running system. Missing values are left as `None`.
    #[must_use]
    pub fn detect() -> Self {
        let identity = Self {
            lan_address: lan_address(),
            hardware_id: hardware_address(Path::new(SYS_CLASS_NET)),
        };
        debug!(?identity, "host identity detected");
        identity
    }
}

fn lan_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(ROUTE_TARGET).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

fn hardware_address(sys_class_net: &Path) -> Option<u64> {
    let entries = std::fs::read_dir(sys_class_net).ok()?;
    let interfaces = entries.filter_map(|entry| {
        let entry = entry.ok()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let address = std::fs::read_to_string(entry.path().join("address")).ok()?;
        Some((name, address))
    });
    pick_hardware_address(interfaces)
}

/// Choose the interface MAC to report: skip loopback, unparsable and all-zero
/// addresses, prefer the alphabetically first interface so the choice is
/// stable.
fn pick_hardware_address(interfaces: impl IntoIterator<Item = (String, String)>) -> Option<u64> {
    let mut candidates: Vec<(String, u64)> = interfaces
        .into_iter()
        .filter(|(name, _)| name != "lo")
        .filter_map(|(name, address)| Some((name, mac_to_u64(&address)?)))
        .filter(|&(_, address)| address != 0)
        .collect();
    candidates.sort();
    candidates.into_iter().next().map(|(_, address)| address)
}

/// `b8:27:eb:11:22:33` -> `0xb827eb112233`.
fn mac_to_u64(address: &str) -> Option<u64> {
    let address = address.trim();
    if !is_valid_mac_address(address) {
        return None;
    }
    u64::from_str_radix(&address.replace(':', ""), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, address: &str) -> (String, String) {
        (name.to_string(), address.to_string())
    }

    #[test]
    fn test_pick_skips_loopback_and_zero() {
        let picked = pick_hardware_address([
            iface("lo", "00:00:00:00:00:00\n"),
            iface("wlan0", "B8:27:EB:11:22:33\n"),
            iface("docker0", "00:00:00:00:00:00\n"),
        ]);
        assert_eq!(picked, Some(0xb827_eb11_2233));
    }

    #[test]
    fn test_pick_is_stable() {
        let picked = pick_hardware_address([
            iface("wlan0", "b8:27:eb:11:22:33"),
            iface("eth0", "b8:27:eb:44:55:66"),
        ]);
        assert_eq!(picked, Some(0xb827_eb44_5566));
    }

    #[test]
    fn test_pick_nothing() {
        assert_eq!(pick_hardware_address([iface("lo", "00:00:00:00:00:00")]), None);
    }

    #[test]
    fn test_hardware_address_reads_sysfs_layout() {
        let dir = tempfile::tempdir().unwrap();
        for (name, address) in [("lo", "00:00:00:00:00:00"), ("eth0", "dc:a6:32:00:00:01")] {
            let iface = dir.path().join(name);
            std::fs::create_dir(&iface).unwrap();
            std::fs::write(iface.join("address"), format!("{address}\n")).unwrap();
        }
        assert_eq!(hardware_address(dir.path()), Some(0xdca6_3200_0001));
    }

    #[test]
    fn test_mac_to_u64() {
        assert_eq!(mac_to_u64("B8:27:EB:11:22:33\n"), Some(202_481_587_003_955));
        assert_eq!(mac_to_u64("ff:ff:ff:ff:ff:ff"), Some(0xffff_ffff_ffff));
        assert_eq!(mac_to_u64("not-a-mac"), None);
        assert_eq!(mac_to_u64(""), None);
    }

    #[test]
    fn test_missing_sysfs() {
        assert_eq!(hardware_address(Path::new("/nonexistent/net")), None);
    }
}
