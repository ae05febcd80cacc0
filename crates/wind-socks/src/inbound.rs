//! The SOCKS5 inbound handler: negotiates the RFC 1928 handshake with
//! `fast_socks5`, then either pumps a CONNECT session through the core
//! [`Ray`] fabric or bridges a UDP ASSOCIATE session into the shared
//! [`UdpServer`].
//!
//! Grounded on the teacher's `ext.rs`/`udp.rs` split (handshake helpers
//! stay put, the per-session forwarding loop is rebuilt around
//! `wind_core::ray::Ray` instead of a raw `AbstractTcpStream`).

use std::{
	net::SocketAddr,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
};

use fast_socks5::{
	ReplyError, Socks5Command,
	server::Socks5ServerProtocol,
	util::target_addr::TargetAddr,
};
use snafu::IntoError as _;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
};
use wind_core::{
	buf::LARGE_BUFFER_SIZE,
	context::{AbstractInbound, AppContext},
	dispatch::Dispatcher,
	error, info,
	ray::Ray,
	types::{Address, Destination, Network, Port, SessionInfo},
	udp::server::UdpServer,
	warn,
};

use crate::{Error, convert_addr, ext, udp};

#[derive(Clone, Debug)]
pub enum AuthMode {
	NoAuth,
	Password { username: String, password: String },
}

#[derive(Clone, Debug)]
pub struct SocksInboundOpt {
	pub listen_addr: SocketAddr,
	/// External IP to report in UDP ASSOCIATE replies. Required if
	/// `allow_udp` is set and `listen_addr` is unspecified.
	pub public_addr: Option<std::net::IpAddr>,
	pub auth: AuthMode,
	/// Skip the auth-method negotiation entirely. `fast_socks5`'s no-auth
	/// path already covers this repo's needs, so this is treated as an
	/// alias for [`AuthMode::NoAuth`] rather than a distinct wire mode.
	pub skip_auth: bool,
	pub allow_udp: bool,
}

struct Shared {
	opt: SocksInboundOpt,
	tag: Box<str>,
	dispatcher: Arc<Dispatcher>,
	udp_server: Arc<UdpServer>,
	ctx: Arc<AppContext>,
	accepting: AtomicBool,
}

pub struct SocksInbound {
	shared: Arc<Shared>,
}

impl SocksInbound {
	pub fn new(
		ctx: Arc<AppContext>,
		opt: SocksInboundOpt,
		tag: impl Into<Box<str>>,
		dispatcher: Arc<Dispatcher>,
	) -> Self {
		let udp_server = UdpServer::new(ctx.clone(), dispatcher.clone());
		Self {
			shared: Arc::new(Shared {
				opt,
				tag: tag.into(),
				dispatcher,
				udp_server,
				ctx,
				accepting: AtomicBool::new(true),
			}),
		}
	}
}

impl AbstractInbound for SocksInbound {
	async fn listen(&self, ctx: &AppContext) -> eyre::Result<()> {
		let listener = match TcpListener::bind(self.shared.opt.listen_addr).await {
			Ok(l) => l,
			Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
				return Err(crate::AlreadyListeningSnafu { socket_addr: self.shared.opt.listen_addr }.build().into());
			}
			Err(e) => return Err(e.into()),
		};
		info!("socks5 inbound {} listening on {}", self.shared.tag, self.shared.opt.listen_addr);

		let token = ctx.child_token();
		loop {
			if !self.shared.accepting.load(Ordering::Acquire) {
				info!("socks5 inbound {} closed", self.shared.tag);
				return Ok(());
			}
			tokio::select! {
				_ = token.cancelled() => {
					info!("socks5 inbound {} shutting down", self.shared.tag);
					return Ok(());
				}
				accepted = listener.accept() => {
					if !self.shared.accepting.load(Ordering::Acquire) {
						info!("socks5 inbound {} closed", self.shared.tag);
						return Ok(());
					}
					let (stream, peer) = match accepted {
						Ok(pair) => pair,
						Err(e) => {
							warn!("socks5 inbound accept failed: {e}");
							continue;
						}
					};
					let shared = self.shared.clone();
					self.shared.ctx.tasks.spawn(async move {
						if let Err(e) = handle_connection(shared, stream, peer).await {
							error!("socks5 session from {peer} failed: {e}");
						}
					});
				}
			}
		}
	}

	fn port(&self) -> u16 {
		self.shared.opt.listen_addr.port()
	}

	/// Mirrors `UdpHub::close`: flips the accepting flag; the loop observes
	/// it either immediately (the top-of-loop check) or on the next
	/// accepted connection, whichever comes first.
	fn close(&self) {
		self.shared.accepting.store(false, Ordering::Release);
	}
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<(), Error> {
	let (proto, cmd, target_addr) = match &shared.opt.auth {
		AuthMode::Password { username, password } => {
			let (username, password) = (username.clone(), password.clone());
			let (proto, ok) =
				Socks5ServerProtocol::accept_password_auth(stream, move |u, p| u == username && p == password).await?;
			if !ok {
				warn!("socks5 password auth rejected for {peer}");
				return Ok(());
			}
			proto.read_command().await?
		}
		AuthMode::NoAuth => Socks5ServerProtocol::accept_no_auth(stream).await?.read_command().await?,
	};

	match cmd {
		Socks5Command::TCPConnect => handle_tcp_connect(shared, proto, target_addr, peer).await,
		Socks5Command::UDPAssociate => handle_udp_associate(shared, proto, target_addr).await.map(|_| ()),
		Socks5Command::TCPBind => {
			let mut proto = proto;
			proto.reply_error(&ReplyError::CommandNotSupported).await?;
			Ok(())
		}
	}
}

async fn handle_tcp_connect(
	shared: Arc<Shared>,
	proto: fast_socks5::server::Socks5ServerProtocol<TcpStream, fast_socks5::server::states::CommandRead>,
	target_addr: TargetAddr,
	peer: SocketAddr,
) -> Result<(), Error> {
	let destination = convert_addr(&target_addr, Network::Tcp);
	let source_address = match peer.ip() {
		std::net::IpAddr::V4(ip) => Address::V4(ip),
		std::net::IpAddr::V6(ip) => Address::V6(ip),
	};
	let session = SessionInfo::new(
		Destination::new(Network::Tcp, source_address, Port(peer.port())),
		destination,
		shared.tag.clone(),
	);

	let ray = match shared.dispatcher.dispatch_to_outbound(&shared.ctx, session, 2) {
		Ok(ray) => ray,
		Err(e) => {
			let mut proto = proto;
			let _ = proto.reply_error(&ReplyError::GeneralFailure).await;
			return Err(crate::DispatchSnafu.into_error(e));
		}
	};

	let bind_addr = shared.opt.listen_addr;
	let stream = proto.reply_success(bind_addr).await?;
	pump_tcp(&shared.ctx, ray, stream).await;
	Ok(())
}

async fn handle_udp_associate(
	shared: Arc<Shared>,
	proto: fast_socks5::server::Socks5ServerProtocol<TcpStream, fast_socks5::server::states::CommandRead>,
	target_addr: TargetAddr,
) -> Result<TcpStream, Error> {
	let mut proto = proto;
	if !shared.opt.allow_udp {
		proto.reply_error(&ReplyError::CommandNotSupported).await?;
		return Err(ReplyError::CommandNotSupported.into());
	}
	let Some(reply_ip) = shared.opt.public_addr.or_else(|| {
		let ip = shared.opt.listen_addr.ip();
		if ip.is_unspecified() { None } else { Some(ip) }
	}) else {
		proto.reply_error(&ReplyError::GeneralFailure).await?;
		return Err(ReplyError::GeneralFailure.into());
	};

	let ctx = shared.ctx.clone();
	let udp_server = shared.udp_server.clone();
	let tag = shared.tag.clone();
	ext::run_udp_proxy(proto, &target_addr, None, reply_ip, move |socket| {
		udp::relay(ctx, udp_server, tag, socket)
	})
	.await
}

/// Raw byte pump between a SOCKS5 CONNECT stream and its [`Ray`] — the
/// unencrypted counterpart of the VMess inbound/outbound chunk pumps,
/// since a plain TCP CONNECT carries no framing of its own.
async fn pump_tcp(ctx: &Arc<AppContext>, ray: Arc<Ray>, stream: TcpStream) {
	let (mut read_half, mut write_half) = stream.into_split();

	let upstream_pump = async {
		let mut scratch = vec![0u8; LARGE_BUFFER_SIZE];
		loop {
			match read_half.read(&mut scratch).await {
				Ok(0) | Err(_) => break,
				Ok(n) => {
					let mut buf = ctx.pool.alloc(n);
					buf.append(&scratch[..n]);
					if let Err((_, buf)) = ray.upstream.write(buf).await {
						buf.release(&ctx.pool);
						break;
					}
				}
			}
		}
		ray.upstream.close();
	};

	let downstream_pump = async {
		loop {
			match ray.upstream.read().await {
				Ok(buf) => {
					let res = write_half.write_all(buf.as_slice()).await;
					buf.release(&ctx.pool);
					if res.is_err() {
						break;
					}
				}
				Err(_) => break,
			}
		}
	};

	tokio::join!(upstream_pump, downstream_pump);
	ray.release(&ctx.pool);
}
