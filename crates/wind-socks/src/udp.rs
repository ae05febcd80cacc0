//! SOCKS5 UDP ASSOCIATE relay.
//!
//! Each association gets its own ephemeral datagram socket (bound by
//! [`crate::ext::run_udp_proxy`]); this module strips the SOCKS5 UDP
//! request header off each inbound datagram and feeds the payload into
//! the shared [`UdpServer`], the same entry point the transparent-proxy
//! UDP hub uses — the two inbounds differ only in how they recover a
//! `SessionInfo` from a raw datagram, not in how they dispatch one.

use std::{net::SocketAddr, sync::Arc};

use arc_swap::ArcSwapOption;
use socket2::Socket;
use tokio::net::UdpSocket;
use wind_core::{
	buf::{Buffer, LARGE_BUFFER_SIZE},
	context::AppContext,
	types::{Address, Destination, Network, Port, SessionInfo},
	udp::server::UdpServer,
	warn,
};

use crate::Error;

/// Parses an RFC 1928 UDP request header in place, returning
/// `(fragment, destination, payload)`. Reimplemented rather than routed
/// through a library helper since `fast_socks5`'s UDP parsing is written
/// against an `AsyncRead`, not an already-received datagram buffer.
fn parse_udp_header(data: &[u8]) -> Result<(u8, Destination, &[u8]), String> {
	if data.len() < 4 {
		return Err("packet too short for a SOCKS5 UDP header".to_string());
	}
	if data[0] != 0x00 || data[1] != 0x00 {
		return Err("non-zero reserved bytes in SOCKS5 UDP header".to_string());
	}
	let frag = data[2];
	let atyp = data[3];
	let mut offset = 4;

	let destination = match atyp {
		0x01 => {
			if data.len() < offset + 6 {
				return Err("truncated IPv4 address in SOCKS5 UDP header".to_string());
			}
			let ip = std::net::Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3]);
			let port = u16::from_be_bytes([data[offset + 4], data[offset + 5]]);
			offset += 6;
			Destination::new(Network::Udp, Address::V4(ip), Port(port))
		}
		0x03 => {
			if data.len() < offset + 1 {
				return Err("missing domain length in SOCKS5 UDP header".to_string());
			}
			let len = data[offset] as usize;
			offset += 1;
			if data.len() < offset + len + 2 {
				return Err("truncated domain name in SOCKS5 UDP header".to_string());
			}
			let domain = String::from_utf8_lossy(&data[offset..offset + len]).into_owned();
			offset += len;
			let port = u16::from_be_bytes([data[offset], data[offset + 1]]);
			offset += 2;
			Destination::new(Network::Udp, Address::Domain(domain), Port(port))
		}
		0x04 => {
			if data.len() < offset + 18 {
				return Err("truncated IPv6 address in SOCKS5 UDP header".to_string());
			}
			let mut octets = [0u8; 16];
			octets.copy_from_slice(&data[offset..offset + 16]);
			let port = u16::from_be_bytes([data[offset + 16], data[offset + 17]]);
			offset += 18;
			Destination::new(Network::Udp, Address::V6(std::net::Ipv6Addr::from(octets)), Port(port))
		}
		other => return Err(format!("unsupported SOCKS5 address type {other}")),
	};

	Ok((frag, destination, &data[offset..]))
}

/// Builds the reply header `fast_socks5::new_udp_header` would, addressed
/// back to whichever destination the client originally asked for.
fn build_reply_header(destination: &Destination) -> Vec<u8> {
	let mut out = vec![0x00, 0x00, 0x00];
	match &destination.address {
		Address::V4(ip) => {
			out.push(0x01);
			out.extend_from_slice(&ip.octets());
		}
		Address::V6(ip) => {
			out.push(0x04);
			out.extend_from_slice(&ip.octets());
		}
		Address::Domain(domain) => {
			out.push(0x03);
			out.push(domain.len() as u8);
			out.extend_from_slice(domain.as_bytes());
		}
	}
	out.extend_from_slice(&destination.port.0.to_be_bytes());
	out
}

fn source_from_peer(peer: SocketAddr) -> Destination {
	match peer {
		SocketAddr::V4(a) => Destination::new(Network::Udp, Address::V4(*a.ip()), Port(a.port())),
		SocketAddr::V6(a) => Destination::new(Network::Udp, Address::V6(*a.ip()), Port(a.port())),
	}
}

/// Drives one client's UDP association until its relay socket errors or
/// the controlling TCP connection (tracked by `ext::run_udp_proxy`) ends.
/// Datagrams from the client are unwrapped and handed to `udp_server`;
/// replies are re-wrapped with a SOCKS5 UDP header and sent back to
/// whichever client address most recently sent a datagram.
pub async fn relay(ctx: Arc<AppContext>, udp_server: Arc<UdpServer>, tag: Box<str>, peer_socket: Socket) -> Result<(), Error> {
	peer_socket.set_nonblocking(true)?;
	let socket = Arc::new(UdpSocket::from_std(peer_socket.into())?);
	let client_addr: Arc<ArcSwapOption<SocketAddr>> = Arc::new(ArcSwapOption::from(None));

	let response_callback: Arc<dyn Fn(SessionInfo, Buffer) + Send + Sync> = {
		let socket = socket.clone();
		let client_addr = client_addr.clone();
		let ctx = ctx.clone();
		Arc::new(move |session, buf| {
			let Some(client) = client_addr.load_full() else {
				buf.release(&ctx.pool);
				return;
			};
			let socket = socket.clone();
			let ctx = ctx.clone();
			tokio::spawn(async move {
				let mut packet = build_reply_header(&session.destination);
				packet.extend_from_slice(buf.as_slice());
				buf.release(&ctx.pool);
				if let Err(e) = socket.send_to(&packet, *client).await {
					warn!("socks5 udp relay failed to send reply to {client}: {e}");
				}
			});
		})
	};

	let mut scratch = vec![0u8; LARGE_BUFFER_SIZE];
	loop {
		let (n, from) = socket.recv_from(&mut scratch).await?;
		client_addr.store(Some(Arc::new(from)));

		let (_frag, destination, payload) = match parse_udp_header(&scratch[..n]) {
			Ok(v) => v,
			Err(reason) => {
				warn!("socks5 udp relay dropped a malformed datagram from {from}: {reason}");
				continue;
			}
		};

		let session = SessionInfo::new(source_from_peer(from), destination, tag.clone());
		let mut buf = ctx.pool.alloc(payload.len());
		buf.append(payload);
		udp_server.dispatch(session, buf, response_callback.clone()).await;
	}
}
