//! A direct-dial outbound used only by this crate's test harnesses: it
//! connects straight to a session's destination over plain TCP and pumps
//! the ray, the same raw-byte loop `wind_socks::inbound::pump_tcp` runs on
//! the inbound side. Standing in for a real upstream (VMess, etc.) in
//! tests that only care whether the SOCKS5 handshake and ray plumbing work.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
};
use wind_core::{
	buf::LARGE_BUFFER_SIZE,
	context::{AbstractOutbound, AppContext},
	ray::Ray,
	types::{Address, SessionInfo},
	warn,
};

pub struct DirectOutbound;

fn dial_target(session: &SessionInfo) -> (String, u16) {
	let host = match &session.destination.address {
		Address::Domain(d) => d.clone(),
		other => other.to_string(),
	};
	(host, session.destination.port.0)
}

impl AbstractOutbound for DirectOutbound {
	fn dispatch<'a>(
		&'a self,
		ctx: &'a AppContext,
		session: SessionInfo,
		ray: &'a Arc<Ray>,
	) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
		Box::pin(async move {
			let (host, port) = dial_target(&session);
			let stream = match TcpStream::connect((host.as_str(), port)).await {
				Ok(s) => s,
				Err(e) => {
					warn!("direct outbound failed to dial {host}:{port}: {e}");
					ray.release(&ctx.pool);
					return;
				}
			};

			let (mut read_half, mut write_half) = stream.into_split();

			// remote -> ray.downstream -> client
			let inbound_pump = async {
				let mut scratch = vec![0u8; LARGE_BUFFER_SIZE];
				loop {
					match read_half.read(&mut scratch).await {
						Ok(0) | Err(_) => break,
						Ok(n) => {
							let mut buf = ctx.pool.alloc(n);
							buf.append(&scratch[..n]);
							if let Err((_, buf)) = ray.downstream.write(buf).await {
								buf.release(&ctx.pool);
								break;
							}
						}
					}
				}
				ray.downstream.close();
			};

			// client -> ray.upstream -> remote
			let outbound_pump = async {
				loop {
					match ray.downstream.read().await {
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

			tokio::join!(inbound_pump, outbound_pump);
			ray.release(&ctx.pool);
		})
	}
}
