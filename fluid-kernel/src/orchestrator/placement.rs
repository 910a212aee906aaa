/**
 * PLACEMENT - Choix de l'hôte qui recevra une sandbox
 *
 * Candidats : hôtes de l'org avec données d'enregistrement, heartbeat récent,
 * cpus et mémoire suffisants, image de base présente.
 * Score = mémoire dispo (MB) + cpus dispo * 1024, le plus haut gagne.
 * Repli : hôtes qui exposent la VM source demandée.
 */

use crate::registry::ConnectedHost;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlacementError {
    #[error("no connected hosts")]
    NoHosts,
    #[error("no healthy host with image {0:?} and sufficient resources")]
    NoCapacity(String),
    #[error("no connected host has source VM {0:?}")]
    NoSourceVm(String),
}

pub fn host_score(host: &ConnectedHost) -> u64 {
    host.registration
        .as_ref()
        .map(|r| r.available_memory_mb + u64::from(r.available_cpus) * 1024)
        .unwrap_or(0)
}

fn is_fresh(host: &ConnectedHost, now: OffsetDateTime, heartbeat_timeout: Duration) -> bool {
    let age_ms = (now - host.last_heartbeat).whole_milliseconds();
    age_ms <= heartbeat_timeout.as_millis() as i128
}

fn has_capacity(host: &ConnectedHost, vcpus: u32, memory_mb: u64) -> bool {
    host.registration
        .as_ref()
        .is_some_and(|r| r.available_cpus >= vcpus && r.available_memory_mb >= memory_mb)
}

fn best<'a>(candidates: impl Iterator<Item = &'a ConnectedHost>) -> Option<ConnectedHost> {
    candidates
        .fold(None::<&ConnectedHost>, |best, h| match best {
            Some(b) if host_score(b) >= host_score(h) => Some(b),
            _ => Some(h),
        })
        .cloned()
}

/// Meilleur hôte pour une image de base donnée
pub fn select_host(
    hosts: &[ConnectedHost],
    base_image: &str,
    heartbeat_timeout: Duration,
    vcpus: u32,
    memory_mb: u64,
) -> Result<ConnectedHost, PlacementError> {
    if hosts.is_empty() {
        return Err(PlacementError::NoHosts);
    }
    let now = OffsetDateTime::now_utc();
    best(hosts.iter().filter(|h| {
        h.registration.as_ref().is_some_and(|r| r.base_images.iter().any(|i| i == base_image))
            && has_capacity(h, vcpus, memory_mb)
            && is_fresh(h, now, heartbeat_timeout)
    }))
    .ok_or_else(|| PlacementError::NoCapacity(base_image.to_string()))
}

/// Meilleur hôte exposant la VM source. vcpus/memory_mb à 0 => pas de contrainte.
pub fn select_host_for_source_vm(
    hosts: &[ConnectedHost],
    source_vm: &str,
    heartbeat_timeout: Duration,
    vcpus: u32,
    memory_mb: u64,
) -> Result<ConnectedHost, PlacementError> {
    if hosts.is_empty() {
        return Err(PlacementError::NoHosts);
    }
    let now = OffsetDateTime::now_utc();
    best(hosts.iter().filter(|h| {
        let Some(reg) = h.registration.as_ref() else { return false };
        is_fresh(h, now, heartbeat_timeout)
            && (vcpus == 0 || reg.available_cpus >= vcpus)
            && (memory_mb == 0 || reg.available_memory_mb >= memory_mb)
            && reg.source_vms.iter().any(|vm| vm.name == source_vm)
    }))
    .ok_or_else(|| PlacementError::NoSourceVm(source_vm.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HostLink;
    use fluid_protocol::{Registration, SourceVmInfo};

    fn host(id: &str, cpus: u32, mem: u64, images: &[&str], vms: &[&str]) -> ConnectedHost {
        let (link, _rx) = HostLink::channel(1);
        ConnectedHost::new(id, "org", "box", link).with_registration(Registration {
            host_id: id.into(),
            available_cpus: cpus,
            available_memory_mb: mem,
            base_images: images.iter().map(|s| s.to_string()).collect(),
            source_vms: vms
                .iter()
                .map(|n| SourceVmInfo { name: n.to_string(), ..Default::default() })
                .collect(),
            ..Default::default()
        })
    }

    const HB: Duration = Duration::from_secs(90);

    #[test]
    fn test_highest_score_wins() {
        let hosts = vec![
            host("small", 2, 4096, &["ubuntu"], &[]),
            host("big", 16, 65536, &["ubuntu"], &[]),
            host("other-image", 64, 262144, &["debian"], &[]),
        ];
        assert_eq!(select_host(&hosts, "ubuntu", HB, 2, 2048).unwrap().host_id, "big");
        assert_eq!(host_score(&hosts[0]), 4096 + 2 * 1024);
    }

    #[test]
    fn test_filters_resources_and_stale_hosts() {
        let mut stale = host("stale", 32, 65536, &["ubuntu"], &[]);
        stale.last_heartbeat = OffsetDateTime::now_utc() - time::Duration::seconds(300);
        let hosts = vec![stale, host("tiny", 1, 512, &["ubuntu"], &[])];

        assert_eq!(
            select_host(&hosts, "ubuntu", HB, 2, 2048).unwrap_err(),
            PlacementError::NoCapacity("ubuntu".into())
        );
        assert_eq!(select_host(&[], "ubuntu", HB, 2, 2048).unwrap_err(), PlacementError::NoHosts);
    }

    #[test]
    fn test_hosts_without_registration_skipped() {
        let (link, _rx) = HostLink::channel(1);
        let bare = ConnectedHost::new("bare", "org", "box", link);
        assert!(select_host(&[bare.clone()], "ubuntu", HB, 0, 0).is_err());
        assert!(select_host_for_source_vm(&[bare], "golden", HB, 0, 0).is_err());
    }

    #[test]
    fn test_source_vm_fallback() {
        let hosts = vec![
            host("a", 4, 8192, &[], &["golden"]),
            host("b", 8, 16384, &[], &["other"]),
        ];
        assert_eq!(select_host_for_source_vm(&hosts, "golden", HB, 0, 0).unwrap().host_id, "a");
        assert!(select_host_for_source_vm(&hosts, "golden", HB, 8, 0).is_err());
        assert_eq!(
            select_host_for_source_vm(&hosts, "missing", HB, 0, 0).unwrap_err(),
            PlacementError::NoSourceVm("missing".into())
        );
    }
}
