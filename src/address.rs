//! BACnet addresses as seen by the application layer.
//!
//! The transaction layer only needs addresses as opaque, hashable keys: a
//! transaction is identified by its invoke ID together with the peer address.
//! Encoding an address into an NPDU is the job of the network layer.

use std::fmt;
use std::net::SocketAddr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A BACnet device address.
///
/// # Examples
///
/// ```
/// use bacnet_tsm::Address;
///
/// let local = Address::LocalStation(vec![0x0A]);
/// assert!(local.is_station());
/// assert_eq!(local.to_string(), "0a");
///
/// let remote = Address::RemoteStation { network: 2001, mac: vec![0x05] };
/// assert_eq!(remote.to_string(), "2001:05");
///
/// assert!(!Address::GlobalBroadcast.is_station());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Address {
    /// A station on the local network, identified by its MAC address.
    LocalStation(Vec<u8>),
    /// A station on a remote network reached through a router.
    RemoteStation {
        /// Destination network number.
        network: u16,
        /// MAC address on the destination network.
        mac: Vec<u8>,
    },
    /// Every station on the local network.
    LocalBroadcast,
    /// Every station on the given remote network.
    RemoteBroadcast(u16),
    /// Every station on every network.
    GlobalBroadcast,
}

impl Address {
    /// Returns true for addresses that name exactly one device.
    ///
    /// Only station addresses can be the peer of a confirmed service.
    pub fn is_station(&self) -> bool {
        matches!(self, Address::LocalStation(_) | Address::RemoteStation { .. })
    }

    /// Network number, if the address is routed.
    pub fn network(&self) -> Option<u16> {
        match self {
            Address::RemoteStation { network, .. } | Address::RemoteBroadcast(network) => {
                Some(*network)
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for Address {
    /// BACnet/IP B/IP address: the IP octets followed by the UDP port.
    fn from(addr: SocketAddr) -> Self {
        let mut mac = match addr {
            SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
            SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
        };
        mac.extend_from_slice(&addr.port().to_be_bytes());
        Address::LocalStation(mac)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::LocalStation(mac) => write!(f, "{}", hex::encode(mac)),
            Address::RemoteStation { network, mac } => {
                write!(f, "{}:{}", network, hex::encode(mac))
            }
            Address::LocalBroadcast => write!(f, "*"),
            Address::RemoteBroadcast(network) => write!(f, "{}:*", network),
            Address::GlobalBroadcast => write!(f, "*:*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_address_conversion() {
        let addr: SocketAddr = "192.168.1.100:47808".parse().unwrap();
        let address = Address::from(addr);
        assert_eq!(
            address,
            Address::LocalStation(vec![192, 168, 1, 100, 0xBA, 0xC0])
        );
        assert_eq!(address.to_string(), "c0a80164bac0");
    }

    #[test]
    fn test_station_classification() {
        assert!(Address::LocalStation(vec![1]).is_station());
        assert!(Address::RemoteStation { network: 5, mac: vec![1] }.is_station());
        assert!(!Address::LocalBroadcast.is_station());
        assert!(!Address::RemoteBroadcast(5).is_station());
        assert!(!Address::GlobalBroadcast.is_station());
    }

    #[test]
    fn test_network_number() {
        assert_eq!(Address::RemoteBroadcast(7).network(), Some(7));
        assert_eq!(Address::RemoteStation { network: 9, mac: vec![] }.network(), Some(9));
        assert_eq!(Address::LocalStation(vec![1]).network(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::LocalBroadcast.to_string(), "*");
        assert_eq!(Address::RemoteBroadcast(12).to_string(), "12:*");
        assert_eq!(Address::GlobalBroadcast.to_string(), "*:*");
    }
}
