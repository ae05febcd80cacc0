//! The VMess client: dials a configured server, performs the request/
//! response header handshake, and pumps a [`Ray`] through the chunk
//! codec until either side is done.

use std::{future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;
use wind_core::{
	context::{AbstractOutbound, AppContext},
	info,
	ray::Ray,
	types::{Address, Destination, SessionInfo},
	warn,
};

use crate::{
	auth::unix_now,
	chunk::ChunkCodec,
	crypto::response_key_iv,
	header::{RequestCommand, RequestHeader, ResponseHeaderCodec, VERSION, marshal_request},
	security::{OPT_CHUNK_STREAM, Security},
};

/// Everything a [`VmessOutbound`] needs to reach one server: where to
/// dial, which credential to authenticate as, and the negotiated chunk
/// cipher.
#[derive(Clone, Debug)]
pub struct VmessOutboundConfig {
	pub server: Destination,
	pub user_id: Uuid,
	pub alter_ids: u16,
	pub level: u8,
	pub security: Security,
}

pub struct VmessOutbound {
	config: VmessOutboundConfig,
}

impl VmessOutbound {
	pub fn new(config: VmessOutboundConfig) -> Self {
		Self { config }
	}
}

fn dial_target(dest: &Destination) -> (String, u16) {
	let host = match &dest.address {
		Address::Domain(d) => d.clone(),
		other => other.to_string(),
	};
	(host, dest.port.0)
}

impl AbstractOutbound for VmessOutbound {
	fn dispatch<'a>(
		&'a self,
		ctx: &'a AppContext,
		session: SessionInfo,
		ray: &'a Arc<Ray>,
	) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
		Box::pin(async move {
			let (host, port) = dial_target(&self.config.server);
			let stream = match TcpStream::connect((host.as_str(), port)).await {
				Ok(s) => s,
				Err(e) => {
					warn!("vmess outbound failed to dial {host}:{port}: {e}");
					ray.release(&ctx.pool);
					return;
				}
			};

			let mut data_iv = [0u8; 16];
			let mut data_key = [0u8; 16];
			rand::rng().fill_bytes(&mut data_iv);
			rand::rng().fill_bytes(&mut data_key);
			let response_verify = rand::rng().next_u32() as u8;

			let header = RequestHeader {
				version: VERSION,
				data_iv,
				data_key,
				response_verify,
				options: OPT_CHUNK_STREAM,
				security: self.config.security,
				command: RequestCommand::from(session.destination.network),
				destination: session.destination.clone(),
			};

			let now = unix_now();
			let wire = match marshal_request(&header, self.config.user_id, now) {
				Ok(w) => w,
				Err(e) => {
					warn!("vmess outbound failed to build request header: {e}");
					ray.release(&ctx.pool);
					return;
				}
			};

			let (read_half, mut write_half) = stream.into_split();
			use tokio::io::AsyncWriteExt as _;
			if let Err(e) = write_half.write_all(&wire).await {
				warn!("vmess outbound failed to send request header: {e}");
				ray.release(&ctx.pool);
				return;
			}

			let mut response_reader = FramedRead::new(read_half, ResponseHeaderCodec::new(&data_key, &data_iv));
			let response = match response_reader.next().await {
				Some(Ok(r)) => r,
				Some(Err(e)) => {
					warn!("vmess outbound failed to decode response header: {e}");
					ray.release(&ctx.pool);
					return;
				}
				None => {
					warn!("vmess server closed before sending a response header");
					ray.release(&ctx.pool);
					return;
				}
			};
			if response.response_verify != response_verify {
				warn!("vmess response verification byte mismatch; treating as an authentication failure");
				ray.release(&ctx.pool);
				return;
			}

			let (resp_key, resp_iv) = response_key_iv(&data_key, &data_iv);
			// `map_decoder` (rather than `into_inner` + a fresh `FramedRead`)
			// carries over any bytes the response header's decode already
			// buffered past the header itself — e.g. the first chunk,
			// pipelined onto the same TCP segment.
			let mut chunk_reader =
				response_reader.map_decoder(|_| ChunkCodec::new(self.config.security, resp_key, resp_iv));
			let mut chunk_writer = FramedWrite::new(write_half, ChunkCodec::new(self.config.security, data_key, data_iv));

			let upstream_pump = async {
				loop {
					match ray.downstream.read().await {
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

			let downstream_pump = async {
				loop {
					match chunk_reader.next().await {
						Some(Ok(chunk)) if chunk.is_empty() => break,
						Some(Ok(chunk)) => {
							let mut buf = ctx.pool.alloc(chunk.len());
							buf.append(&chunk);
							if let Err((_, buf)) = ray.downstream.write(buf).await {
								buf.release(&ctx.pool);
								break;
							}
						}
						Some(Err(e)) => {
							warn!("vmess outbound chunk decode failed: {e}");
							break;
						}
						None => break,
					}
				}
			};

			tokio::join!(upstream_pump, downstream_pump);
			info!("vmess session to {} finished", self.config.server);
			ray.release(&ctx.pool);
		})
	}
}
