//! Routes an accepted session to its outbound handler.
//!
//! Grounded on `transport/internet/udp/udp_server.go`'s `Dispatch`: resolve
//! a routing decision, hand off to the matching outbound, return the
//! inbound-facing [`Ray`] immediately without waiting on the outbound to
//! finish anything.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;

use crate::{
	context::{AbstractOutbound, AppContext},
	ray::Ray,
	types::SessionInfo,
};

/// Decides which outbound tag handles a session. Must not block: routing
/// policies are consulted on every dispatch.
pub trait RoutingPolicy: Send + Sync {
	fn resolve(&self, session: &SessionInfo) -> Option<Box<str>>;
}

/// A routing policy that always picks the same outbound, useful for
/// single-upstream deployments and tests.
pub struct FixedRoutingPolicy {
	tag: Box<str>,
}

impl FixedRoutingPolicy {
	pub fn new(tag: impl Into<Box<str>>) -> Self {
		Self { tag: tag.into() }
	}
}

impl RoutingPolicy for FixedRoutingPolicy {
	fn resolve(&self, _session: &SessionInfo) -> Option<Box<str>> {
		Some(self.tag.clone())
	}
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
	#[error("routing policy returned no outbound tag for this session")]
	NoRoute,
	#[error("outbound tag {0:?} is not registered")]
	NoOutbound(Box<str>),
}

type OutboundRegistry = HashMap<Box<str>, Arc<dyn AbstractOutbound>>;

pub struct Dispatcher {
	policy: Arc<dyn RoutingPolicy>,
	outbounds: ArcSwap<OutboundRegistry>,
}

impl Dispatcher {
	pub fn new(policy: Arc<dyn RoutingPolicy>) -> Self {
		Self { policy, outbounds: ArcSwap::from_pointee(HashMap::new()) }
	}

	/// Registers (or replaces) the outbound for `tag`. Readers never block on
	/// a registration in progress — they see the old map until the swap
	/// completes.
	pub fn register_outbound(&self, tag: impl Into<Box<str>>, outbound: Arc<dyn AbstractOutbound>) {
		let tag = tag.into();
		let mut next = (**self.outbounds.load()).clone();
		next.insert(tag, outbound);
		self.outbounds.store(Arc::new(next));
	}

	/// Resolves the outbound for `session`, builds a fresh [`Ray`], spawns
	/// the outbound's drive loop (which takes its own `Arc` clone) on
	/// `ctx.tasks`, and returns the same `Ray` for the inbound side to use —
	/// non-blocking: the outbound's own connect/dial work happens on the
	/// spawned task, never on this call.
	pub fn dispatch_to_outbound(
		&self,
		ctx: &Arc<AppContext>,
		session: SessionInfo,
		ray_capacity: usize,
	) -> Result<Arc<Ray>, DispatchError> {
		let tag = self.policy.resolve(&session).ok_or(DispatchError::NoRoute)?;
		let outbound = self
			.outbounds
			.load()
			.get(&tag)
			.cloned()
			.ok_or_else(|| DispatchError::NoOutbound(tag.clone()))?;

		let ray = Arc::new(Ray::new(ray_capacity));
		let ctx2 = ctx.clone();
		let session2 = session.clone();
		let ray2 = ray.clone();
		ctx.tasks.spawn(async move {
			outbound.dispatch(&ctx2, session2, &ray2).await;
		});

		Ok(ray)
	}
}
