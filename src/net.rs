//! Listen address resolution

use std::net::IpAddr;

use tracing::debug;

use crate::config::NetworkSettings;
use crate::error::{Error, Result};

/// Host used when neither a host nor an interface is configured
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Pick the host this process listens on and advertises
///
/// An explicit host wins, then the address of the configured interface,
/// then loopback.
pub fn resolve_host(settings: &NetworkSettings) -> Result<String> {
    if let Some(host) = &settings.host {
        return Ok(host.clone());
    }
    if let Some(interface) = &settings.interface {
        let ip = interface_address(interface)?;
        debug!(interface = %interface, ip = %ip, "Resolved interface address");
        return Ok(ip.to_string());
    }
    Ok(DEFAULT_HOST.to_string())
}

/// First address of `interface_name`, IPv4 preferred
pub fn interface_address(interface_name: &str) -> Result<IpAddr> {
    use nix::ifaddrs::getifaddrs;

    let addrs = getifaddrs().map_err(|e| Error::Io(std::io::Error::from(e)))?;

    let mut fallback = None;
    for ifaddr in addrs {
        if ifaddr.interface_name != interface_name {
            continue;
        }
        let Some(addr) = ifaddr.address else {
            continue;
        };
        if let Some(sockaddr) = addr.as_sockaddr_in() {
            return Ok(IpAddr::V4(sockaddr.ip()));
        }
        if let Some(sockaddr) = addr.as_sockaddr_in6() {
            fallback.get_or_insert(IpAddr::V6(sockaddr.ip()));
        }
    }

    fallback.ok_or_else(|| {
        Error::config_field_invalid(
            "network.interface",
            format!("no IP address found for interface '{}'", interface_name),
        )
    })
}

/// Name of this machine, for log context
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_host_wins() {
        let settings = NetworkSettings {
            host: Some("10.1.2.3".into()),
            interface: Some("does-not-exist0".into()),
            listen_port: 0,
        };
        assert_eq!(resolve_host(&settings).unwrap(), "10.1.2.3");
    }

    #[test]
    fn test_default_is_loopback() {
        assert_eq!(resolve_host(&NetworkSettings::default()).unwrap(), DEFAULT_HOST);
    }

    #[test]
    fn test_loopback_interface() {
        assert_eq!(interface_address("lo").unwrap().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_unknown_interface() {
        assert!(interface_address("does-not-exist0").is_err());
    }
}
