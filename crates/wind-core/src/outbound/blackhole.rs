//! The blackhole outbound: terminates a session instead of forwarding it.
//!
//! Grounded on `proxy/blackhole/config.go`'s two response kinds. The HTTP
//! response body is pinned byte-for-byte so a client sees a real (if
//! terse) HTTP/1.0 403 instead of a silently dropped connection.

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
	context::{AbstractOutbound, AppContext},
	ray::Ray,
	types::SessionInfo,
};

/// Exact literal required by the blackhole wire format: HTTP/1.0 403 with
/// CRLF line endings throughout, including the terminating blank line.
pub const HTTP_403_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\nCache-Control: max-age=3600, public\r\nContent-Length: 0\r\n\r\n";

#[derive(Clone, Copy, Debug, Default)]
pub enum BlackholeResponse {
	#[default]
	None,
	Http403,
}

#[derive(Default)]
pub struct BlackholeOutbound {
	pub response: BlackholeResponse,
}

impl BlackholeOutbound {
	pub fn new(response: BlackholeResponse) -> Self {
		Self { response }
	}
}

impl AbstractOutbound for BlackholeOutbound {
	fn dispatch<'a>(
		&'a self,
		ctx: &'a AppContext,
		_session: SessionInfo,
		ray: &'a Arc<Ray>,
	) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
		Box::pin(async move {
			if let BlackholeResponse::Http403 = self.response {
				let mut buf = ctx.pool.alloc(HTTP_403_RESPONSE.len());
				buf.append(HTTP_403_RESPONSE);
				if let Err((_, buf)) = ray.downstream.write(buf).await {
					buf.release(&ctx.pool);
				}
			}
			ray.downstream.close();
			ray.release(&ctx.pool);
		})
	}
}
