//! The process-wide context every long-lived task is spawned against:
//! a task supervisor and a cancellation token both inbound and outbound
//! handlers share.
//!
//! This fills the role the teacher's `wind-core::interface` module played —
//! reconstructed from its call sites (`ctx.tasks.spawn(...)`,
//! `ctx.token.child_token()`) since that module's source was not available
//! to copy from directly.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{buf::BufferPool, ray::Ray, types::SessionInfo};

/// Supervises every task spawned by an inbound or outbound handler so the
/// process can wait for a clean shutdown instead of detaching tasks.
#[derive(Default)]
pub struct TaskSupervisor {
	set: tokio::sync::Mutex<JoinSet<()>>,
}

impl TaskSupervisor {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
		// try_lock: spawn is called from many concurrent accept loops and
		// must never block waiting for the set itself.
		if let Ok(mut set) = self.set.try_lock() {
			set.spawn(fut);
		} else {
			tokio::spawn(fut);
		}
	}

	/// Waits for every tracked task to finish. Used at shutdown.
	pub async fn wait(&self) {
		let mut set = self.set.lock().await;
		while set.join_next().await.is_some() {}
	}
}

pub struct AppContext {
	pub tasks: TaskSupervisor,
	pub token: CancellationToken,
	pub pool: BufferPool,
}

impl AppContext {
	pub fn new() -> Self {
		Self { tasks: TaskSupervisor::new(), token: CancellationToken::new(), pool: BufferPool::new() }
	}

	pub fn child_token(&self) -> CancellationToken {
		self.token.child_token()
	}
}

impl Default for AppContext {
	fn default() -> Self {
		Self::new()
	}
}

/// Implemented by whatever accepts connections on an inbound's listen
/// socket: a VMess server, a SOCKS5 server, a UDP hub. `listen` runs the
/// accept loop until `ctx.token` is cancelled, `close()` is called, or an
/// unrecoverable error occurs.
pub trait AbstractInbound: Send + Sync {
	fn listen(&self, ctx: &AppContext) -> impl Future<Output = eyre::Result<()>> + Send;

	fn port(&self) -> u16;

	/// Stops accepting new connections independent of the process-wide
	/// `ctx.token`, the way [`UdpHub::close`](crate::udp::hub::UdpHub::close)
	/// stops its own accept loop. Idempotent.
	fn close(&self);
}

/// Implemented by whatever drives one accepted session to a remote peer.
/// `dispatch` is handed the already-allocated [`Ray`] for the session
/// (shared with the inbound side via `Arc`) and drives it — dialing the
/// remote peer, pumping buffers — until the session ends, then releases it.
///
/// Object-safe (boxed future) rather than `impl Future`, since the
/// dispatcher keeps a registry of outbounds behind `Arc<dyn AbstractOutbound>`
/// keyed by tag.
pub trait AbstractOutbound: Send + Sync {
	fn dispatch<'a>(
		&'a self,
		ctx: &'a AppContext,
		session: SessionInfo,
		ray: &'a Arc<Ray>,
	) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}
