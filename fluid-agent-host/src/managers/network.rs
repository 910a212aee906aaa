//! Tap devices, bridge resolution and sandbox IP discovery
//!
//! Bridge priority: requested network (bridge map, then `br*`/`virbr*` names)
//! > source VM's interface (`virsh domiflist`) > default bridge.
//! IP discovery polls every 2s according to `dhcp_mode`:
//! - `libvirt`: libvirt dnsmasq lease files
//! - `dnsmasq`: fluid-managed lease file
//! - `arp` (default): `ip neigh`, then `arp -an`

use super::{ManagerError, ManagerResult, NetworkManager};
use crate::config::NetworkConfig;
use crate::execution::run_tool;
use async_trait::async_trait;
use fluid_protocol::BridgeInfo;
use if_addrs::{get_if_addrs, IfAddr};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct LinuxNetworkManager {
    default_bridge: String,
    bridge_map: HashMap<String, String>,
    dhcp_mode: String,
    libvirt_uri: String,
}

impl LinuxNetworkManager {
    pub fn new(config: &NetworkConfig, libvirt_uri: &str) -> Self {
        Self {
            default_bridge: config.default_bridge.clone(),
            bridge_map: config.bridge_map.clone(),
            dhcp_mode: config.dhcp_mode.clone(),
            libvirt_uri: libvirt_uri.to_string(),
        }
    }

    /// Explicit network -> bridge. `None` when nothing was requested.
    fn resolve_requested(&self, requested: &str) -> Option<ManagerResult<String>> {
        if requested.is_empty() {
            return None;
        }
        if let Some(bridge) = self.bridge_map.get(requested) {
            info!("resolved bridge {} from network {}", bridge, requested);
            return Some(Ok(bridge.clone()));
        }
        if requested.starts_with("br") || requested.starts_with("virbr") {
            return Some(Ok(requested.to_string()));
        }
        Some(Err(ManagerError::Invalid(format!(
            "unknown network {requested:?}: not found in bridge_map"
        ))))
    }

    async fn resolve_from_source_vm(&self, source_vm: &str) -> ManagerResult<String> {
        let output = run_tool("virsh", &["-c", &self.libvirt_uri, "domiflist", source_vm]).await?;
        match parse_domiflist(&output) {
            Some((kind, source)) if kind == "bridge" => Ok(source),
            Some((kind, source)) if kind == "network" => {
                if let Some(bridge) = self.bridge_map.get(&source) {
                    return Ok(bridge.clone());
                }
                let info = run_tool("virsh", &["-c", &self.libvirt_uri, "net-info", &source]).await?;
                parse_net_info_bridge(&info)
                    .ok_or_else(|| ManagerError::NotFound(format!("bridge for network {source}")))
            }
            _ => Err(ManagerError::NotFound(format!("network interface of VM {source_vm}"))),
        }
    }

    async fn lookup_once(&self, mac: &str, bridge: &str) -> Option<String> {
        match self.dhcp_mode.as_str() {
            "libvirt" => {
                let files = [
                    "/var/lib/libvirt/dnsmasq/default.leases".to_string(),
                    "/var/lib/libvirt/dnsmasq/virbr0.leases".to_string(),
                    format!("/var/lib/libvirt/dnsmasq/{bridge}.leases"),
                ];
                for file in files {
                    if let Ok(data) = tokio::fs::read_to_string(&file).await {
                        if let Some(ip) = parse_lease(&data, mac) {
                            return Some(ip);
                        }
                    }
                }
                None
            }
            "dnsmasq" => {
                let file = format!("/var/lib/fluid/dnsmasq/{bridge}.leases");
                let data = tokio::fs::read_to_string(&file).await.ok()?;
                parse_lease(&data, mac)
            }
            _ => {
                if let Ok(out) = run_tool("ip", &["neigh", "show", "dev", bridge]).await {
                    if let Some(ip) = parse_ip_neigh(&out, mac) {
                        return Some(ip);
                    }
                }
                let out = run_tool("arp", &["-an"]).await.ok()?;
                parse_arp(&out, mac)
            }
        }
    }
}

#[async_trait]
impl NetworkManager for LinuxNetworkManager {
    async fn create_tap(&self, tap: &str, bridge: &str) -> ManagerResult<()> {
        run_tool("ip", &["tuntap", "add", "dev", tap, "mode", "tap"]).await?;
        let attach = async {
            run_tool("ip", &["link", "set", tap, "master", bridge]).await?;
            run_tool("ip", &["link", "set", tap, "up"]).await
        };
        if let Err(e) = attach.await {
            // created but not attached
            let _ = run_tool("ip", &["link", "delete", tap]).await;
            return Err(e);
        }
        info!("tap {} attached to {}", tap, bridge);
        Ok(())
    }

    async fn destroy_tap(&self, tap: &str) -> ManagerResult<()> {
        run_tool("ip", &["link", "delete", tap]).await.map(|_| ())
    }

    async fn resolve_bridge(&self, source_vm: &str, requested_network: &str) -> ManagerResult<String> {
        if let Some(resolved) = self.resolve_requested(requested_network) {
            return resolved;
        }
        if !source_vm.is_empty() {
            match self.resolve_from_source_vm(source_vm).await {
                Ok(bridge) => {
                    info!("resolved bridge {} from source VM {}", bridge, source_vm);
                    return Ok(bridge);
                }
                Err(e) => warn!("bridge of source VM {} unknown, using default: {}", source_vm, e),
            }
        }
        Ok(self.default_bridge.clone())
    }

    async fn discover_ip(&self, mac: &str, bridge: &str, timeout: Duration) -> ManagerResult<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ip) = self.lookup_once(mac, bridge).await {
                info!("discovered IP {} for {} ({})", ip, mac, self.dhcp_mode);
                return Ok(ip);
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(ManagerError::Timeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn list_bridges(&self) -> Vec<BridgeInfo> {
        let interfaces = match get_if_addrs() {
            Ok(i) => i,
            Err(e) => {
                warn!("cannot enumerate interfaces: {}", e);
                return Vec::new();
            }
        };
        let mut bridges: Vec<BridgeInfo> = interfaces
            .into_iter()
            .filter(|iface| iface.name.starts_with("br") || iface.name.starts_with("virbr"))
            .filter_map(|iface| match iface.addr {
                IfAddr::V4(v4) => Some(BridgeInfo { name: iface.name, subnet: subnet_of(v4.ip, v4.netmask) }),
                IfAddr::V6(_) => None,
            })
            .collect();
        bridges.sort_by(|a, b| a.name.cmp(&b.name));
        bridges.dedup_by(|a, b| a.name == b.name);
        bridges
    }
}

pub fn subnet_of(ip: Ipv4Addr, netmask: Ipv4Addr) -> String {
    let mask = u32::from(netmask);
    let network = Ipv4Addr::from(u32::from(ip) & mask);
    format!("{}/{}", network, mask.count_ones())
}

/// First usable `(type, source)` row of `virsh domiflist`.
pub fn parse_domiflist(output: &str) -> Option<(String, String)> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("---") && !l.starts_with("Interface"))
        .find_map(|l| {
            let fields: Vec<&str> = l.split_whitespace().collect();
            (fields.len() >= 3).then(|| (fields[1].to_string(), fields[2].to_string()))
        })
}

pub fn parse_net_info_bridge(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("Bridge:"))
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
}

/// dnsmasq lease line: `timestamp MAC IP hostname client-id`
pub fn parse_lease(data: &str, mac: &str) -> Option<String> {
    data.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        (fields.len() >= 3 && fields[1].eq_ignore_ascii_case(mac)).then(|| fields[2].to_string())
    })
}

/// `ip neigh` line: `IP lladdr MAC STATE`
pub fn parse_ip_neigh(output: &str, mac: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        fields
            .iter()
            .skip(1)
            .any(|f| f.eq_ignore_ascii_case(mac))
            .then(|| fields[0].to_string())
    })
}

/// `arp -an` line: `? (IP) at MAC [ether] on iface`
pub fn parse_arp(output: &str, mac: &str) -> Option<String> {
    let mac = mac.to_lowercase();
    output.lines().find_map(|line| {
        if !line.to_lowercase().contains(&mac) {
            return None;
        }
        let start = line.find('(')?;
        let end = line.find(')')?;
        (end > start).then(|| line[start + 1..end].to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(map: &[(&str, &str)]) -> LinuxNetworkManager {
        let config = NetworkConfig {
            default_bridge: "virbr0".into(),
            bridge_map: map.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            dhcp_mode: "arp".into(),
        };
        LinuxNetworkManager::new(&config, "qemu:///system")
    }

    #[tokio::test]
    async fn test_resolve_bridge_requested_network() {
        let net = manager(&[("lab", "br-lab")]);
        assert_eq!(net.resolve_bridge("", "lab").await.unwrap(), "br-lab");
        assert_eq!(net.resolve_bridge("", "br-direct").await.unwrap(), "br-direct");
        assert_eq!(net.resolve_bridge("", "virbr9").await.unwrap(), "virbr9");
        assert!(matches!(net.resolve_bridge("", "nope").await, Err(ManagerError::Invalid(_))));
        assert_eq!(net.resolve_bridge("", "").await.unwrap(), "virbr0");
    }

    #[test]
    fn test_parse_domiflist() {
        let out = " Interface   Type      Source    Model    MAC\n\
                   -------------------------------------------------------\n\
                   vnet0       network   default   virtio   52:54:00:aa:bb:cc\n";
        assert_eq!(parse_domiflist(out), Some(("network".into(), "default".into())));
        let bridged = "vnet1 bridge br0 virtio 52:54:00:11:22:33";
        assert_eq!(parse_domiflist(bridged), Some(("bridge".into(), "br0".into())));
        assert_eq!(parse_domiflist(""), None);
    }

    #[test]
    fn test_parse_net_info() {
        let out = "Name:           default\nUUID:           1234\nActive:         yes\nBridge:         virbr0\n";
        assert_eq!(parse_net_info_bridge(out).as_deref(), Some("virbr0"));
        assert_eq!(parse_net_info_bridge("Name: x"), None);
    }

    #[test]
    fn test_parse_ip_sources() {
        let lease = "1700000000 52:54:00:aa:bb:cc 192.168.122.50 sbx *\n";
        assert_eq!(parse_lease(lease, "52:54:00:AA:BB:CC").as_deref(), Some("192.168.122.50"));
        assert_eq!(parse_lease(lease, "52:54:00:00:00:00"), None);

        let neigh = "192.168.122.51 lladdr 52:54:00:aa:bb:cd REACHABLE\n";
        assert_eq!(parse_ip_neigh(neigh, "52:54:00:aa:bb:cd").as_deref(), Some("192.168.122.51"));

        let arp = "? (192.168.122.52) at 52:54:00:aa:bb:ce [ether] on virbr0\n";
        assert_eq!(parse_arp(arp, "52:54:00:AA:BB:CE").as_deref(), Some("192.168.122.52"));
    }

    #[test]
    fn test_subnet_of() {
        assert_eq!(
            subnet_of(Ipv4Addr::new(192, 168, 122, 1), Ipv4Addr::new(255, 255, 255, 0)),
            "192.168.122.0/24"
        );
    }
}
