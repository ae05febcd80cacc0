use std::{
	fmt,
	net::{Ipv4Addr, Ipv6Addr},
	time::SystemTime,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A destination address: a resolved IP or a domain name awaiting resolution
/// by whichever component dials it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
	Domain(String),
	V4(Ipv4Addr),
	V6(Ipv6Addr),
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Address::Domain(d) => f.write_str(d),
			Address::V4(a) => write!(f, "{a}"),
			Address::V6(a) => write!(f, "{a}"),
		}
	}
}

impl Address {
	/// Domain names are carried as raw bytes on the wire and are capped at
	/// 255 bytes there; this is the in-memory equivalent bound.
	pub const MAX_DOMAIN_LEN: usize = 256;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port(pub u16);

impl fmt::Display for Port {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<u16> for Port {
	fn from(v: u16) -> Self {
		Port(v)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
	Tcp,
	Udp,
}

impl fmt::Display for Network {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Network::Tcp => "tcp",
			Network::Udp => "udp",
		})
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
	pub network: Network,
	pub address: Address,
	pub port: Port,
}

impl fmt::Display for Destination {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}:{}", self.network, self.address, self.port)
	}
}

impl Destination {
	pub fn new(network: Network, address: Address, port: Port) -> Self {
		Self { network, address, port }
	}
}

/// An authenticated VMess peer entry, valid over a bounded window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
	pub id: Uuid,
	pub alter_ids: u16,
	pub level: u8,
}

/// A server-side record of one accepted peer, with the validity window the
/// inbound uses to reject stale or not-yet-active credentials.
#[derive(Clone, Debug)]
pub struct ServerSpec {
	pub destination: Destination,
	pub users: Vec<User>,
	pub valid_from: Option<SystemTime>,
	pub valid_until: Option<SystemTime>,
}

impl ServerSpec {
	pub fn is_valid_at(&self, now: SystemTime) -> bool {
		if let Some(from) = self.valid_from {
			if now < from {
				return false;
			}
		}
		if let Some(until) = self.valid_until {
			if now > until {
				return false;
			}
		}
		true
	}
}

/// Everything a dispatcher needs to route one flow: where it came from,
/// where it's going, which user (if any) authenticated it, and which
/// inbound accepted it. Immutable once built.
#[derive(Clone, Debug)]
pub struct SessionInfo {
	pub source: Destination,
	pub destination: Destination,
	pub user: Option<User>,
	pub inbound_tag: Box<str>,
}

impl SessionInfo {
	pub fn new(source: Destination, destination: Destination, inbound_tag: impl Into<Box<str>>) -> Self {
		Self { source, destination, user: None, inbound_tag: inbound_tag.into() }
	}

	pub fn with_user(mut self, user: User) -> Self {
		self.user = Some(user);
		self
	}

	/// Flow key used by the UDP server's per-flow session map:
	/// `"<network>:<source>-<network>:<destination>"`.
	pub fn flow_key(&self) -> Box<str> {
		format!("{}-{}", self.source, self.destination).into_boxed_str()
	}
}

/// Retained for the SOCKS5 inbound adapter, which still speaks this shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TargetAddr {
	Domain(String, u16),
	IPv4(Ipv4Addr, u16),
	IPv6(Ipv6Addr, u16),
}

impl From<&TargetAddr> for Destination {
	fn from(addr: &TargetAddr) -> Self {
		match addr {
			TargetAddr::Domain(d, p) => {
				Destination::new(Network::Tcp, Address::Domain(d.clone()), Port(*p))
			}
			TargetAddr::IPv4(ip, p) => Destination::new(Network::Tcp, Address::V4(*ip), Port(*p)),
			TargetAddr::IPv6(ip, p) => Destination::new(Network::Tcp, Address::V6(*ip), Port(*p)),
		}
	}
}
