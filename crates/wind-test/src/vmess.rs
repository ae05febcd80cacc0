//! Loopback VMess test harness: a `VmessInbound` listener and a
//! `VmessOutbound` dialing straight into it, with a `DirectOutbound`-style
//! echo sink standing in for the real upstream behind the inbound. Exercises
//! the full header handshake plus chunk codec round trip without touching
//! the network beyond localhost.

use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use uuid::Uuid;
use wind_core::{
	context::{AbstractInbound, AbstractOutbound, AppContext},
	dispatch::{Dispatcher, FixedRoutingPolicy},
	ray::Ray,
	types::{Destination, SessionInfo, User},
};
use wind_vmess::{
	inbound::{VmessInbound, VmessInboundConfig},
	outbound::{VmessOutbound, VmessOutboundConfig},
	security::Security,
};

/// Echoes whatever the client sends back to the client, standing in for a
/// real upstream so the harness only needs one hop to exercise the wire
/// protocol end to end.
struct EchoOutbound;

impl AbstractOutbound for EchoOutbound {
	fn dispatch<'a>(
		&'a self,
		ctx: &'a AppContext,
		_session: SessionInfo,
		ray: &'a Arc<Ray>,
	) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
		Box::pin(async move {
			loop {
				match ray.downstream.read().await {
					Ok(buf) => {
						if let Err((_, buf)) = ray.downstream.write(buf).await {
							buf.release(&ctx.pool);
							break;
						}
					}
					Err(_) => break,
				}
			}
			ray.downstream.close();
		})
	}
}

/// Starts a `VmessInbound` on an ephemeral loopback port, routing every
/// session into [`EchoOutbound`], and returns the context plus the address
/// and user id a client should dial with.
#[allow(dead_code)]
async fn start_vmess_echo_server() -> eyre::Result<(Arc<AppContext>, SocketAddr, Uuid)> {
	let ctx = Arc::new(AppContext::new());
	let user_id = Uuid::new_v4();

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
	let listen_addr = listener.local_addr()?;
	drop(listener);

	let dispatcher = Arc::new(Dispatcher::new(Arc::new(FixedRoutingPolicy::new("echo"))));
	dispatcher.register_outbound("echo", Arc::new(EchoOutbound));

	let config = VmessInboundConfig {
		listen_addr,
		users: vec![User { id: user_id, alter_ids: 0, level: 0 }],
		tag: "vmess-in".into(),
	};
	let inbound = Arc::new(VmessInbound::new(ctx.clone(), config, dispatcher));

	let ctx_clone = ctx.clone();
	ctx.tasks.spawn(async move {
		if let Err(e) = inbound.listen(&ctx_clone).await {
			eprintln!("vmess test server error: {e}");
		}
	});

	tokio::time::sleep(Duration::from_millis(100)).await;
	Ok((ctx, listen_addr, user_id))
}

#[allow(dead_code)]
fn outbound_config(server: SocketAddr, user_id: Uuid, security: Security) -> VmessOutboundConfig {
	VmessOutboundConfig {
		server: Destination::new(
			wind_core::types::Network::Tcp,
			match server.ip() {
				std::net::IpAddr::V4(ip) => wind_core::types::Address::V4(ip),
				std::net::IpAddr::V6(ip) => wind_core::types::Address::V6(ip),
			},
			wind_core::types::Port(server.port()),
		),
		user_id,
		alter_ids: 0,
		level: 0,
		security,
	}
}

#[cfg(test)]
mod unit_tests {
	use wind_core::{buf::BufferPool, types::Network};

	use super::*;

	async fn round_trip(security: Security) {
		let (ctx, listen_addr, user_id) = start_vmess_echo_server().await.expect("server failed to start");

		let outbound = Arc::new(VmessOutbound::new(outbound_config(listen_addr, user_id, security)));
		let ray = Arc::new(Ray::new(2));
		let session = SessionInfo::new(
			Destination::new(Network::Tcp, wind_core::types::Address::V4([127, 0, 0, 1].into()), wind_core::types::Port(0)),
			Destination::new(Network::Tcp, wind_core::types::Address::Domain("example.com".into()), wind_core::types::Port(80)),
			"vmess-out",
		);

		let ctx2 = ctx.clone();
		let ray2 = ray.clone();
		ctx.tasks.spawn(async move {
			outbound.dispatch(&ctx2, session, &ray2).await;
		});

		let pool = BufferPool::new();
		let mut buf = ctx.pool.alloc(5);
		buf.append(b"hello");
		ray.upstream.write(buf).await.expect("client write should succeed");

		let echoed = tokio::time::timeout(Duration::from_secs(5), ray.upstream.read())
			.await
			.expect("echo timed out")
			.expect("ray closed before echoing");
		assert_eq!(echoed.as_slice(), b"hello");
		echoed.release(&pool);

		ray.upstream.close();
		ctx.token.cancel();
		let _ = tokio::time::timeout(Duration::from_secs(2), ctx.tasks.wait()).await;
	}

	#[tokio::test]
	async fn round_trips_a_chunk_over_aes_128_gcm() {
		round_trip(Security::Aes128Gcm).await;
	}

	#[tokio::test]
	async fn round_trips_a_chunk_over_chacha20_poly1305() {
		round_trip(Security::Chacha20Poly1305).await;
	}
}
