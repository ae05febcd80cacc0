//! The VMess server: accepts TCP connections, identifies the caller from
//! the 16-byte auth prefix against a rolling [`AuthTable`], decodes the
//! request header, and dispatches the session into the core [`Dispatcher`]
//! before pumping the resulting [`Ray`] through the chunk codec — the
//! server-side mirror of [`crate::outbound::VmessOutbound`].

use std::{
	net::SocketAddr,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{
	io::AsyncReadExt,
	net::{TcpListener, TcpStream},
	sync::RwLock,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;
use wind_core::{
	context::{AbstractInbound, AppContext},
	dispatch::Dispatcher,
	error, info,
	types::{Address, Destination, Network, Port, SessionInfo, User},
	warn,
};

use crate::{
	auth::{AuthTable, unix_now},
	chunk::ChunkCodec,
	crypto::{header_key_iv, response_key_iv},
	header::{RequestHeaderDecoder, ResponseHeader, ResponseHeaderCodec},
	state::{SessionState, SessionStateTracker},
};

pub struct VmessInboundConfig {
	pub listen_addr: SocketAddr,
	pub users: Vec<User>,
	pub tag: Box<str>,
}

/// Shared, clonable handle to everything a spawned session task needs —
/// split out from `VmessInbound` itself so each accepted connection can own
/// its working set without borrowing `&self` across an `await`.
struct Shared {
	users: Vec<User>,
	tag: Box<str>,
	dispatcher: Arc<Dispatcher>,
	ctx: Arc<AppContext>,
	auth_table: RwLock<AuthTable>,
	accepting: AtomicBool,
}

impl Shared {
	fn user_ids(&self) -> Vec<Uuid> {
		self.users.iter().map(|u| u.id).collect()
	}

	async fn identify(&self, auth: &[u8; 16]) -> Option<(User, i64)> {
		let now = unix_now();
		{
			let table = self.auth_table.read().await;
			if !table.is_stale(now)
				&& let Some((id, ts)) = table.identify(auth)
			{
				return self.users.iter().find(|u| u.id == id).cloned().map(|u| (u, ts));
			}
		}
		let mut table = self.auth_table.write().await;
		if table.is_stale(now) {
			table.rebuild(&self.user_ids(), now);
		}
		let (id, ts) = table.identify(auth)?;
		self.users.iter().find(|u| u.id == id).cloned().map(|u| (u, ts))
	}
}

pub struct VmessInbound {
	shared: Arc<Shared>,
	listen_addr: SocketAddr,
}

impl VmessInbound {
	pub fn new(ctx: Arc<AppContext>, config: VmessInboundConfig, dispatcher: Arc<Dispatcher>) -> Self {
		Self {
			listen_addr: config.listen_addr,
			shared: Arc::new(Shared {
				users: config.users,
				tag: config.tag,
				dispatcher,
				ctx,
				auth_table: RwLock::new(AuthTable::new()),
				accepting: AtomicBool::new(true),
			}),
		}
	}
}

impl AbstractInbound for VmessInbound {
	async fn listen(&self, ctx: &AppContext) -> eyre::Result<()> {
		let listener = match TcpListener::bind(self.listen_addr).await {
			Ok(l) => l,
			Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
				return Err(crate::error::AlreadyListeningSnafu { socket_addr: self.listen_addr }.build().into());
			}
			Err(e) => return Err(e.into()),
		};
		info!("vmess inbound {} listening on {}", self.shared.tag, self.listen_addr);

		let token = ctx.child_token();
		loop {
			if !self.shared.accepting.load(Ordering::Acquire) {
				info!("vmess inbound {} closed", self.shared.tag);
				return Ok(());
			}
			tokio::select! {
				_ = token.cancelled() => {
					info!("vmess inbound {} shutting down", self.shared.tag);
					return Ok(());
				}
				accepted = listener.accept() => {
					if !self.shared.accepting.load(Ordering::Acquire) {
						info!("vmess inbound {} closed", self.shared.tag);
						return Ok(());
					}
					let (stream, peer) = match accepted {
						Ok(pair) => pair,
						Err(e) => {
							warn!("vmess inbound accept failed: {e}");
							continue;
						}
					};
					let shared = self.shared.clone();
					self.shared.ctx.tasks.spawn(async move {
						if let Err(e) = handle_connection(shared.clone(), stream, peer).await {
							error!("vmess session from {peer} failed: {e}");
						}
					});
				}
			}
		}
	}

	fn port(&self) -> u16 {
		self.listen_addr.port()
	}

	/// Mirrors `UdpHub::close`: flips the accepting flag; the loop observes
	/// it either immediately (the top-of-loop check) or on the next
	/// accepted connection, whichever comes first.
	fn close(&self) {
		self.shared.accepting.store(false, Ordering::Release);
	}
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> eyre::Result<()> {
	let ctx = &shared.ctx;
	let mut state = SessionStateTracker::default();

	let mut auth = [0u8; 16];
	let (mut read_half, write_half) = stream.into_split();
	read_half.read_exact(&mut auth).await?;

	let Some((user, timestamp)) = shared.identify(&auth).await else {
		warn!("vmess connection from {peer} did not authenticate");
		state.transition(SessionState::Closed);
		return Ok(());
	};
	state.transition(SessionState::AuthenticatedHeader);

	let (key, iv) = header_key_iv(user.id, timestamp);
	let mut header_reader = FramedRead::new(read_half, RequestHeaderDecoder::new(key, iv));
	let header = match header_reader.next().await {
		Some(Ok(h)) => h,
		Some(Err(e)) => {
			warn!("vmess request header from {peer} failed to decode: {e}");
			state.transition(SessionState::Closed);
			return Ok(());
		}
		None => {
			state.transition(SessionState::Closed);
			return Ok(());
		}
	};

	let source_address = match peer.ip() {
		std::net::IpAddr::V4(ip) => Address::V4(ip),
		std::net::IpAddr::V6(ip) => Address::V6(ip),
	};
	let session = SessionInfo::new(
		Destination::new(Network::Tcp, source_address, Port(peer.port())),
		header.destination.clone(),
		shared.tag.clone(),
	)
	.with_user(user);

	let ray = match shared.dispatcher.dispatch_to_outbound(ctx, session, 2) {
		Ok(ray) => ray,
		Err(e) => {
			warn!("vmess dispatch failed for {peer}: {e}");
			state.transition(SessionState::Closed);
			return Ok(());
		}
	};

	let mut header_writer = FramedWrite::new(write_half, ResponseHeaderCodec::new(&header.data_key, &header.data_iv));
	let response = ResponseHeader { response_verify: header.response_verify, options: header.options, command: None };
	if let Err(e) = header_writer.send(response).await {
		warn!("vmess failed to send response header to {peer}: {e}");
		ray.release(&ctx.pool);
		state.transition(SessionState::Closed);
		return Ok(());
	}
	// `send` fully flushes before returning, so the write half carries no
	// buffered-but-unsent bytes across this swap.
	let write_half = header_writer.into_inner();

	state.transition(SessionState::StreamingPayload);

	// Buffer-preserving swap, symmetric with the client side: anything
	// `header_reader` already pulled past the request header (a pipelined
	// first chunk) survives into the chunk decoder.
	let mut chunk_reader = header_reader.map_decoder(|_| ChunkCodec::new(header.security, header.data_key, header.data_iv));
	let (resp_key, resp_iv) = response_key_iv(&header.data_key, &header.data_iv);
	let mut chunk_writer = FramedWrite::new(write_half, ChunkCodec::new(header.security, resp_key, resp_iv));

	let upstream_pump = async {
		loop {
			match chunk_reader.next().await {
				Some(Ok(chunk)) if chunk.is_empty() => break,
				Some(Ok(chunk)) => {
					let mut buf = ctx.pool.alloc(chunk.len());
					buf.append(&chunk);
					if let Err((_, buf)) = ray.upstream.write(buf).await {
						buf.release(&ctx.pool);
						break;
					}
				}
				Some(Err(e)) => {
					warn!("vmess inbound chunk decode failed for {peer}: {e}");
					break;
				}
				None => break,
			}
		}
	};

	let downstream_pump = async {
		loop {
			match ray.upstream.read().await {
				Ok(buf) => {
					let payload = Bytes::copy_from_slice(buf.as_slice());
					buf.release(&ctx.pool);
					if chunk_writer.send(payload).await.is_err() {
						break;
					}
				}
				Err(_) => {
					let _ = chunk_writer.send(ChunkCodec::eof()).await;
					break;
				}
			}
		}
	};

	tokio::join!(upstream_pump, downstream_pump);
	info!("vmess session from {peer} to {} finished", header.destination);
	ray.release(&ctx.pool);
	state.transition(SessionState::Closed);
	Ok(())
}
