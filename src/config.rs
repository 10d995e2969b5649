//! Link configuration value types.
//!
//! A [`LinkConfig`] is consumed read-only by the protocol: it names the
//! link, selects local binding, targets the remote peer, and carries the
//! bundling/filter settings a site advertises when joining. The advertised
//! subset travels on the wire as a [`LinkAdvert`] inside `Join` and
//! `Configure` messages.
//!
//! A relay never trusts client-supplied addressing: the configuration for a
//! reverse link is *derived* via [`LinkConfig::reverse_for`], which copies
//! only the advertised fields and targets the literal observed sender
//! address.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;

/// Sentinel site name requesting a relay-generated name.
pub const AUTO_ASSIGN: &str = "auto-assign";

/// Transport carrying the link. The relay protocol is datagram-shaped;
/// UDP is the only transport it runs over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain UDP datagrams.
    #[default]
    Udp,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportKind::Udp),
            other => Err(format!("unsupported transport: {}", other)),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// Selects the local interface a link binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceSelector {
    /// Bind to all interfaces (0.0.0.0).
    Any,
    /// Bind to loopback only.
    Loopback,
    /// Bind to a specific local address.
    Address(IpAddr),
}

impl IfaceSelector {
    /// The concrete local IP this selector binds to.
    pub fn bind_ip(&self) -> IpAddr {
        match self {
            IfaceSelector::Any => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IfaceSelector::Loopback => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IfaceSelector::Address(ip) => *ip,
        }
    }
}

impl FromStr for IfaceSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(IfaceSelector::Any),
            "loopback" => Ok(IfaceSelector::Loopback),
            other => other
                .parse::<IpAddr>()
                .map(IfaceSelector::Address)
                .map_err(|_| format!("invalid interface selector: {}", s)),
        }
    }
}

impl std::fmt::Display for IfaceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IfaceSelector::Any => write!(f, "any"),
            IfaceSelector::Loopback => write!(f, "loopback"),
            IfaceSelector::Address(ip) => write!(f, "{}", ip),
        }
    }
}

/// Payload bundling settings, advertised to the peer on join.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bundling {
    /// Whether outgoing payloads may be coalesced.
    pub enabled: bool,
    /// Flush threshold in bytes.
    pub max_bytes: u32,
    /// Flush deadline in milliseconds.
    pub max_wait_ms: u32,
}

impl Default for Bundling {
    fn default() -> Self {
        Self { enabled: false, max_bytes: 1400, max_wait_ms: 30 }
    }
}

/// The configuration subset a site advertises in `Join`/`Configure`.
///
/// Deliberately excludes all addressing: the relay derives addressing from
/// the transport layer, never from message contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkAdvert {
    /// Bundling settings.
    pub bundling: Bundling,
    /// Outbound traffic filter expressions (opaque to this layer).
    pub send_filter: Vec<String>,
    /// Inbound traffic filter expressions (opaque to this layer).
    pub receive_filter: Vec<String>,
}

/// Full configuration for one link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Local handle for the link (log context, registry key).
    pub name: String,
    /// Desired site name, or [`AUTO_ASSIGN`].
    pub site_name: String,
    /// Remote host (name or literal address).
    pub address: String,
    /// Remote port.
    pub port: u16,
    /// Local send port; 0 requests an ephemeral port.
    pub send_port: u16,
    /// Local interface selection.
    pub interface: IfaceSelector,
    /// Bundling settings, advertised on join.
    pub bundling: Bundling,
    /// Outbound filter expressions, advertised on join.
    pub send_filter: Vec<String>,
    /// Inbound filter expressions, advertised on join.
    pub receive_filter: Vec<String>,
    /// Transport carrying the link.
    pub transport: TransportKind,
    /// Whether the link is re-established after a failure.
    pub auto_reconnect: bool,
}

impl LinkConfig {
    /// A configuration with the given identity and target, defaults
    /// elsewhere.
    pub fn new(
        name: impl Into<String>,
        site_name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            site_name: site_name.into(),
            address: address.into(),
            port,
            send_port: 0,
            interface: IfaceSelector::Any,
            bundling: Bundling::default(),
            send_filter: Vec::new(),
            receive_filter: Vec::new(),
            transport: TransportKind::Udp,
            auto_reconnect: false,
        }
    }

    /// The subset of this configuration advertised to the peer.
    pub fn advert(&self) -> LinkAdvert {
        LinkAdvert {
            bundling: self.bundling,
            send_filter: self.send_filter.clone(),
            receive_filter: self.receive_filter.clone(),
        }
    }

    /// Derive the configuration for a relay-side reverse link.
    ///
    /// Only the peer's advertised fields are copied. The target is the
    /// literal observed sender address, auto-reconnect is forced off, and
    /// the send port is ephemeral.
    pub fn reverse_for(advert: &LinkAdvert, site_name: &str, observed: SocketAddr) -> Self {
        Self {
            name: site_name.to_string(),
            site_name: site_name.to_string(),
            address: observed.ip().to_string(),
            port: observed.port(),
            send_port: 0,
            interface: IfaceSelector::Any,
            bundling: advert.bundling,
            send_filter: advert.send_filter.clone(),
            receive_filter: advert.receive_filter.clone(),
            transport: TransportKind::Udp,
            auto_reconnect: false,
        }
    }

    /// The local address this link binds.
    pub fn local_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface.bind_ip(), self.send_port)
    }

    /// Resolve the remote target to a concrete socket address.
    pub async fn resolve_target(&self) -> io::Result<SocketAddr> {
        let authority = format!("{}:{}", self.address, self.port);
        let resolved = lookup_host(&authority)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address found for {}", authority),
                )
            });
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_config_targets_observed_address_only() {
        let advert = LinkAdvert {
            bundling: Bundling { enabled: true, max_bytes: 8000, max_wait_ms: 50 },
            send_filter: vec!["f1".to_string()],
            receive_filter: vec!["f2".to_string()],
        };
        let observed: SocketAddr = "203.0.113.9:52100".parse().unwrap();

        let reverse = LinkConfig::reverse_for(&advert, "alpha", observed);

        assert_eq!(reverse.address, "203.0.113.9");
        assert_eq!(reverse.port, 52100);
        assert_eq!(reverse.site_name, "alpha");
        assert_eq!(reverse.bundling, advert.bundling);
        assert_eq!(reverse.send_filter, advert.send_filter);
        assert_eq!(reverse.receive_filter, advert.receive_filter);
        assert!(!reverse.auto_reconnect);
        assert_eq!(reverse.send_port, 0);
    }

    #[test]
    fn advert_excludes_addressing() {
        let mut config = LinkConfig::new("wan", "alpha", "relay.example", 4000);
        config.send_filter = vec!["espdu".to_string()];

        let advert = config.advert();
        assert_eq!(advert.send_filter, config.send_filter);
        assert_eq!(advert.bundling, config.bundling);
    }

    #[test]
    fn interface_selector_parsing() {
        assert_eq!("any".parse::<IfaceSelector>().unwrap(), IfaceSelector::Any);
        assert_eq!("loopback".parse::<IfaceSelector>().unwrap(), IfaceSelector::Loopback);
        assert_eq!(
            "192.168.1.20".parse::<IfaceSelector>().unwrap(),
            IfaceSelector::Address("192.168.1.20".parse().unwrap())
        );
        assert!("bogus".parse::<IfaceSelector>().is_err());
    }

    #[test]
    fn transport_parsing() {
        assert_eq!("udp".parse::<TransportKind>().unwrap(), TransportKind::Udp);
        assert!("tcp".parse::<TransportKind>().is_err());
    }

    #[tokio::test]
    async fn resolve_target_literal_address() {
        let config = LinkConfig::new("wan", "alpha", "127.0.0.1", 4000);
        let addr = config.resolve_target().await.unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
    }
}
