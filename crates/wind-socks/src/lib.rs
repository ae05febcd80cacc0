use std::{backtrace::Backtrace, net::SocketAddr};

use fast_socks5::{ReplyError, server::SocksServerError};
use snafu::{IntoError, Snafu};
use wind_core::{
	dispatch::DispatchError,
	types::{Address, Destination, Network, Port},
};

pub mod ext;
pub mod inbound;
pub mod udp;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
	BindSocket {
		socket_addr: SocketAddr,
		source:      std::io::Error,
		backtrace:   Backtrace,
	},
	#[snafu(display("socks5 inbound is already listening on {socket_addr}"))]
	AlreadyListening {
		socket_addr: SocketAddr,
		backtrace:   Backtrace,
	},
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	Socks {
		#[snafu(provide)]
		source:    SocksServerError,
		backtrace: Backtrace,
	},
	SocksReply {
		#[snafu(provide)]
		source:    ReplyError,
		backtrace: Backtrace,
	},
	Dispatch {
		#[snafu(provide)]
		source:    DispatchError,
		backtrace: Backtrace,
	},
}

impl From<SocksServerError> for Error {
	#[inline(always)]
	fn from(value: SocksServerError) -> Self {
		SocksSnafu.into_error(value)
	}
}

impl From<ReplyError> for Error {
	#[inline(always)]
	fn from(value: ReplyError) -> Self {
		SocksReplySnafu.into_error(value)
	}
}

impl From<std::io::Error> for Error {
	#[inline(always)]
	fn from(value: std::io::Error) -> Self {
		IoSnafu.into_error(value)
	}
}

/// Converts a `fast_socks5` target address, read off the wire by the
/// handshake, into core's routing key. `network` is supplied by the
/// caller since the wire representation carries no transport tag of its
/// own (the same address shape is used for CONNECT and UDP ASSOCIATE).
pub fn convert_addr(addr: &fast_socks5::util::target_addr::TargetAddr, network: Network) -> Destination {
	match addr {
		fast_socks5::util::target_addr::TargetAddr::Domain(domain, port) => {
			Destination::new(network, Address::Domain(domain.clone()), Port(*port))
		}
		fast_socks5::util::target_addr::TargetAddr::Ip(socket_addr) => match socket_addr {
			SocketAddr::V4(a) => Destination::new(network, Address::V4(*a.ip()), Port(a.port())),
			SocketAddr::V6(a) => Destination::new(network, Address::V6(*a.ip()), Port(a.port())),
		},
	}
}
