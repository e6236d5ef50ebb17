//! Authenticated-client registry: live long-lived connections keyed by
//! resolved client IP, backed by a concurrent map so reads never block
//! behind a connection's own insert/remove.

use std::net::IpAddr;

use dashmap::DashMap;

/// Tracks how many live connections are currently open per IP. Multiple
/// siblings from the same address are common (several browser tabs against
/// the same viewer), so this is a reference count rather than a boolean.
#[derive(Default)]
pub struct ClientRegistry {
    counts: DashMap<IpAddr, usize>,
}

/// RAII handle returned by `register`. Dropping it (or calling `release`
/// explicitly, which the upgrade handler's close callback should do) removes
/// the connection's contribution to the registry.
pub struct RegistryEntry {
    registry: std::sync::Arc<ClientRegistry>,
    ip: IpAddr,
    released: bool,
}

impl ClientRegistry {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Insert on upgrade: record one more live connection from `ip`.
    pub fn register(self: &std::sync::Arc<Self>, ip: IpAddr) -> RegistryEntry {
        *self.counts.entry(ip).or_insert(0) += 1;
        RegistryEntry {
            registry: self.clone(),
            ip,
            released: false,
        }
    }

    /// Is there currently any live connection from this IP?
    pub fn has_live_connection(&self, ip: &IpAddr) -> bool {
        self.counts.get(ip).is_some_and(|c| *c > 0)
    }

    fn release(&self, ip: &IpAddr) {
        if let Some(mut count) = self.counts.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                drop(count);
                self.counts.remove(ip);
            }
        }
    }
}

impl RegistryEntry {
    /// Remove on close. Idempotent — calling it twice, or dropping after
    /// calling it, never double-decrements.
    pub fn release(mut self) {
        self.registry.release(&self.ip);
        self.released = true;
    }
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        if !self.released {
            self.registry.release(&self.ip);
            self.released = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_release_clears_liveness() {
        let registry = ClientRegistry::new();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(!registry.has_live_connection(&ip));
        let entry = registry.register(ip);
        assert!(registry.has_live_connection(&ip));
        entry.release();
        assert!(!registry.has_live_connection(&ip));
    }

    #[test]
    fn dropping_the_entry_releases_it() {
        let registry = ClientRegistry::new();
        let ip: IpAddr = "10.0.0.6".parse().unwrap();
        {
            let _entry = registry.register(ip);
            assert!(registry.has_live_connection(&ip));
        }
        assert!(!registry.has_live_connection(&ip));
    }

    #[test]
    fn multiple_siblings_from_same_ip_require_all_to_release() {
        let registry = ClientRegistry::new();
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let a = registry.register(ip);
        let b = registry.register(ip);
        assert!(registry.has_live_connection(&ip));
        a.release();
        assert!(registry.has_live_connection(&ip));
        b.release();
        assert!(!registry.has_live_connection(&ip));
    }

    #[test]
    fn explicit_release_then_drop_does_not_double_decrement() {
        let registry = ClientRegistry::new();
        let ip: IpAddr = "10.0.0.8".parse().unwrap();
        let a = registry.register(ip);
        let b = registry.register(ip);
        a.release();
        // b still held; if release double-counted we'd now see 0 live.
        assert!(registry.has_live_connection(&ip));
        drop(b);
        assert!(!registry.has_live_connection(&ip));
    }
}
