//! Network availability check run before any remote call.
//!
//! The check is synchronous and best-effort. Anything that prevents it from
//! answering, including a target it cannot parse, counts as unreachable.

use log::debug;
use std::net::ToSocketAddrs;
use url::Url;

/// Answers whether `target` can currently be reached
pub trait ReachabilityCheck: Send + Sync {
    fn is_reachable(&self, target: &str) -> bool;
}

/// Resolves the target's host name; reachable if it yields any address
#[derive(Debug, Default, Clone)]
pub struct HostReachability;

impl ReachabilityCheck for HostReachability {
    fn is_reachable(&self, target: &str) -> bool {
        let url = match Url::parse(target) {
            Ok(url) => url,
            Err(e) => {
                debug!("Cannot check {target}: {e}");
                return false;
            }
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        let port = url.port_or_known_default().unwrap_or(443);

        match (host, port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!("Host {host} did not resolve: {e}");
                false
            }
        }
    }
}

/// Fixed answer, for offline runs and tests
#[derive(Debug, Clone, Copy)]
pub struct StaticReachability(pub bool);

impl ReachabilityCheck for StaticReachability {
    fn is_reachable(&self, _target: &str) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unparseable_target_is_unreachable() {
        assert!(!HostReachability.is_reachable("fakeURLforAccessTest"));
        assert!(!HostReachability.is_reachable(""));
    }

    #[test]
    fn test_loopback_is_reachable() {
        assert!(HostReachability.is_reachable("http://127.0.0.1:8080/services/rest"));
    }

    #[test]
    fn test_static_reachability() {
        assert!(StaticReachability(true).is_reachable("anything"));
        assert!(!StaticReachability(false).is_reachable("anything"));
    }
}
