//! Process wide host status cache for multi-host selection.
//!
//! Statuses come from the connect-time `SHOW transaction_read_only` probe
//! and age out after `hostRecheckSeconds`; every connection shares the map.
use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

use super::TargetServerType;
use crate::common::ByteStr;

/// What the last probe learned about a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// `transaction_read_only` was off.
    Primary,
    /// `transaction_read_only` was on.
    Secondary,
    /// The last connect attempt failed.
    Unreachable,
}

fn cache() -> &'static Mutex<HashMap<(String, u16), (HostStatus, Instant)>> {
    static CACHE: OnceLock<Mutex<HashMap<(String, u16), (HostStatus, Instant)>>> = OnceLock::new();
    CACHE.get_or_init(Default::default)
}

/// Record a probe result.
pub fn report(host: &str, port: u16, status: HostStatus) {
    let mut cache = cache().lock().expect("host cache lock");
    cache.insert((host.to_string(), port), (status, Instant::now()));
}

/// Look up a host status younger than `ttl`.
pub fn get(host: &str, port: u16, ttl: Duration) -> Option<HostStatus> {
    let cache = cache().lock().expect("host cache lock");
    let (status, at) = cache.get(&(host.to_string(), port))?;
    (at.elapsed() < ttl).then_some(*status)
}

/// Whether a known status satisfies the requested target type outright.
fn matches(status: HostStatus, target: TargetServerType) -> bool {
    match target {
        TargetServerType::Any => status != HostStatus::Unreachable,
        TargetServerType::Primary | TargetServerType::PreferPrimary => {
            status == HostStatus::Primary
        }
        TargetServerType::Secondary | TargetServerType::PreferSecondary => {
            status == HostStatus::Secondary
        }
    }
}

/// Order the configured candidates for one connect attempt: hosts whose
/// cached status satisfies the target first, unknown and stale hosts next,
/// known mismatches last (only relevant to the `prefer*` targets, which
/// fall back).
pub fn order_candidates(
    hosts: &[(ByteStr, u16)],
    target: TargetServerType,
    ttl: Duration,
) -> Vec<(ByteStr, u16)> {
    let mut matching = Vec::new();
    let mut unknown = Vec::new();
    let mut fallback = Vec::new();

    for (host, port) in hosts {
        match get(host, *port, ttl) {
            Some(status) if matches(status, target) => matching.push((host.clone(), *port)),
            Some(HostStatus::Unreachable) => fallback.push((host.clone(), *port)),
            Some(_) => match target {
                // hard requirements skip known mismatches until they expire
                TargetServerType::Primary | TargetServerType::Secondary => {}
                _ => fallback.push((host.clone(), *port)),
            },
            None => unknown.push((host.clone(), *port)),
        }
    }

    matching.extend(unknown);
    matching.extend(fallback);
    matching
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ordering_prefers_known_matches() {
        let ttl = Duration::from_secs(60);
        report("order-a", 5432, HostStatus::Secondary);
        report("order-b", 5432, HostStatus::Primary);

        let hosts: Vec<(ByteStr, u16)> = vec![
            ("order-a".into(), 5432),
            ("order-b".into(), 5432),
            ("order-c".into(), 5432),
        ];

        let ordered = order_candidates(&hosts, TargetServerType::Primary, ttl);
        assert_eq!(ordered[0].0, "order-b");
        // the known secondary is skipped entirely for a hard primary target
        assert_eq!(ordered.len(), 2);

        let ordered = order_candidates(&hosts, TargetServerType::PreferSecondary, ttl);
        assert_eq!(ordered[0].0, "order-a");
        assert_eq!(ordered.len(), 3);
    }

    #[test]
    fn stale_entries_are_unknown() {
        report("stale-a", 5432, HostStatus::Primary);
        assert_eq!(get("stale-a", 5432, Duration::ZERO), None);
        assert!(get("stale-a", 5432, Duration::from_secs(60)).is_some());
    }
}
