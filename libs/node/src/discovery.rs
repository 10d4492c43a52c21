//! Presence announcements and the address a server advertises.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use polymesh_core::descriptor::{InstanceDescriptor, Presence};
use polymesh_core::Config;
use polymesh_fabric::Broker;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Address peers should dial to reach a server bound with `config`.
///
/// A specific bind host is advertised as-is. A wildcard bind advertises the
/// address of `config.iface`, falling back to loopback when the interface
/// has none.
pub fn advertised_host(config: &Config) -> IpAddr {
    if let Ok(ip) = config.host.parse::<IpAddr>() {
        if !ip.is_unspecified() {
            return ip;
        }
    }

    match interface_address(&config.iface) {
        Some(ip) => ip,
        None => {
            warn!(iface = %config.iface, "No address found for interface, advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// First address of a network interface, IPv4 preferred.
///
/// An IP literal is returned unchanged.
pub fn interface_address(iface: &str) -> Option<IpAddr> {
    if let Ok(ip) = iface.parse::<IpAddr>() {
        return Some(ip);
    }
    lookup_interface(iface)
}

#[cfg(unix)]
fn lookup_interface(iface: &str) -> Option<IpAddr> {
    use std::net::{SocketAddrV4, SocketAddrV6};

    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!(error = %e, "Failed to list network interfaces");
            return None;
        }
    };

    let mut v6 = None;
    for ifaddr in addrs.filter(|a| a.interface_name == iface) {
        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            return Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
        }
        if let Some(sin6) = address.as_sockaddr_in6() {
            v6.get_or_insert(IpAddr::V6(*SocketAddrV6::from(*sin6).ip()));
        }
    }
    v6
}

#[cfg(not(unix))]
fn lookup_interface(iface: &str) -> Option<IpAddr> {
    debug!(iface, "Interface lookup unsupported on this platform");
    None
}

/// Shortest period between two announcements.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Publishes one instance's descriptor on the discovery channels of its groups.
pub struct Announcer {
    broker: Arc<dyn Broker>,
    descriptor: InstanceDescriptor,
    groups: Vec<String>,
}

impl Announcer {
    pub fn new(broker: Arc<dyn Broker>, descriptor: InstanceDescriptor, groups: Vec<String>) -> Self {
        Self {
            broker,
            descriptor,
            groups,
        }
    }

    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.descriptor
    }

    /// Publish the descriptor once per group. Failures are logged.
    pub async fn announce(&self, presence: Presence) {
        let payload = match self.descriptor.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode instance descriptor");
                return;
            }
        };

        for group in &self.groups {
            let channel = presence.channel(group);
            match self.broker.publish(&channel, payload.clone()).await {
                Ok(()) => trace!(%channel, instance = %self.descriptor.id, "Announced"),
                Err(e) => warn!(%channel, error = %e, "Failed to publish presence"),
            }
        }
    }

    /// Announce `Up` now and then every `interval` until the task is aborted.
    ///
    /// A zero `interval` is raised to [`MIN_INTERVAL`].
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = interval.max(MIN_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.announce(Presence::Up).await;
            }
        })
    }
}
