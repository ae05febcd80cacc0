//! The bidirectional forwarding fabric between an inbound and an outbound.
//!
//! A [`Ray`] is two bounded, single-producer single-consumer channels of
//! [`Buffer`] — one per direction — plus the shared lifecycle state both
//! sides observe. Capacity is small (1-4 buffers) by design: it is the
//! mechanism that turns a slow peer into backpressure on the other side
//! instead of unbounded memory growth.
//!
//! A single [`Ray`] is shared (behind `Arc`) by the inbound task, which
//! drives client data and the response through `upstream` alone (writing
//! client bytes in, reading response bytes out), and the outbound task,
//! which drives the same exchange through `downstream` alone (reading
//! client bytes, writing response bytes). Each `RayHalf` bundles one
//! party's full-duplex view of the other two channels so neither side ever
//! touches the field the other side owns.

use std::sync::{
	Arc,
	atomic::{AtomicU8, Ordering},
};

use arc_swap::ArcSwapOption;
use crossfire::spsc::{AsyncRx, AsyncTx};

use crate::buf::Buffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RayState {
	Open = 0,
	HalfClosed = 1,
	Closed = 2,
	Released = 3,
}

impl RayState {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => RayState::Open,
			1 => RayState::HalfClosed,
			2 => RayState::Closed,
			_ => RayState::Released,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum RayError {
	#[error("ray half closed for writes")]
	Closed,
	#[error("ray reached end of stream")]
	Eof,
}

struct Shared {
	state: AtomicU8,
}

impl Shared {
	fn transition_to(&self, next: RayState) {
		// Monotonic: never move backwards (Released is terminal, Closed
		// only follows HalfClosed/Open). A racing writer moving the same
		// direction twice is a harmless no-op.
		loop {
			let cur = self.state.load(Ordering::Acquire);
			if cur >= next as u8 {
				return;
			}
			if self
				.state
				.compare_exchange(cur, next as u8, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				return;
			}
		}
	}

	fn state(&self) -> RayState {
		RayState::from_u8(self.state.load(Ordering::Acquire))
	}
}

/// One party's view of a [`Ray`]: a full-duplex pair of bounded channels
/// plus the producer-side close control. All methods take `&self` so a
/// `Ray` can be shared behind an `Arc` by both the inbound and the outbound
/// side.
///
/// The sender lives behind `ArcSwapOption` rather than a plain field so
/// `close()` can drop it with only `&self` — dropping the last sender is
/// what makes the paired receiver's `recv()` observe end-of-stream, the
/// same signal a channel gives on the sync stdlib.
pub struct RayHalf {
	tx: ArcSwapOption<AsyncTx<Buffer>>,
	rx: AsyncRx<Buffer>,
	shared: Arc<Shared>,
}

impl RayHalf {
	/// Blocks (asynchronously) while the channel is at capacity. On failure
	/// the buffer is handed back so the caller can release it rather than
	/// leaking it into a closed channel.
	pub async fn write(&self, buf: Buffer) -> Result<(), (RayError, Buffer)> {
		let Some(tx) = self.tx.load_full() else {
			return Err((RayError::Closed, buf));
		};
		tx.send(buf).await.map_err(|e| (RayError::Closed, e.0))
	}

	/// Reads the next buffer, or `Err(RayError::Eof)` once the producer has
	/// closed and the channel has drained.
	pub async fn read(&self) -> Result<Buffer, RayError> {
		self.rx.recv().await.map_err(|_| RayError::Eof)
	}

	fn try_drain(&self, pool: &crate::buf::BufferPool) {
		while let Ok(buf) = self.rx.try_recv() {
			buf.release(pool);
		}
	}

	/// Idempotent. Signals the consumer it will receive no more writes once
	/// the channel drains by dropping this half's sender.
	pub fn close(&self) {
		self.tx.store(None);
		self.shared.transition_to(RayState::HalfClosed);
	}

	pub fn state(&self) -> RayState {
		self.shared.state()
	}
}

/// A pair of full-duplex handles, one per party, sharing one lifecycle.
/// Shared via `Arc<Ray>` between the inbound task (uses `upstream` only:
/// write client data, read the response) and the outbound task (uses
/// `downstream` only: read client data, write the response).
pub struct Ray {
	shared: Arc<Shared>,
	pub upstream: RayHalf,
	pub downstream: RayHalf,
}

impl Ray {
	/// `capacity` must be in 1..=4 per the forwarding fabric's backpressure
	/// contract.
	pub fn new(capacity: usize) -> Self {
		debug_assert!((1..=4).contains(&capacity));
		let shared = Arc::new(Shared { state: AtomicU8::new(RayState::Open as u8) });
		let (up_tx, up_rx) = crossfire::spsc::bounded_async(capacity);
		let (down_tx, down_rx) = crossfire::spsc::bounded_async(capacity);
		Ray {
			shared: shared.clone(),
			upstream: RayHalf {
				tx: ArcSwapOption::from_pointee(up_tx),
				rx: down_rx,
				shared: shared.clone(),
			},
			downstream: RayHalf { tx: ArcSwapOption::from_pointee(down_tx), rx: up_rx, shared },
		}
	}

	pub fn state(&self) -> RayState {
		self.shared.state()
	}

	/// Closes both directions and releases any buffers still queued inside
	/// them back to their originating pool. Idempotent and terminal; safe to
	/// call from either side once both are done with the Ray.
	pub fn release(&self, pool: &crate::buf::BufferPool) {
		if self.state() == RayState::Released {
			return;
		}
		self.upstream.close();
		self.downstream.close();
		self.shared.transition_to(RayState::Closed);
		self.upstream.try_drain(pool);
		self.downstream.try_drain(pool);
		self.shared.transition_to(RayState::Released);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::buf::BufferPool;

	#[tokio::test]
	async fn write_then_read_round_trips() {
		let ray = Ray::new(2);
		let pool = BufferPool::new();
		let mut buf = pool.alloc(4);
		buf.append(b"ping");
		ray.upstream.write(buf).await.unwrap();
		let got = ray.downstream.read().await.unwrap();
		assert_eq!(got.as_slice(), b"ping");
		got.release(&pool);
		ray.release(&pool);
	}

	#[tokio::test]
	async fn close_then_read_yields_eof_after_drain() {
		let ray = Ray::new(2);
		let pool = BufferPool::new();
		let mut buf = pool.alloc(4);
		buf.append(b"abcd");
		ray.upstream.write(buf).await.unwrap();
		ray.upstream.close();
		let got = ray.downstream.read().await.unwrap();
		got.release(&pool);
		let err = ray.downstream.read().await.unwrap_err();
		assert!(matches!(err, RayError::Eof));
		ray.release(&pool);
	}

	#[tokio::test]
	async fn state_transitions_are_monotonic_and_release_is_idempotent() {
		let ray = Ray::new(1);
		assert_eq!(ray.state(), RayState::Open);
		let pool = BufferPool::new();
		ray.release(&pool);
		assert_eq!(ray.state(), RayState::Released);
		ray.release(&pool);
		assert_eq!(ray.state(), RayState::Released);
	}

	#[tokio::test]
	async fn write_blocks_at_capacity_and_unblocks_on_read() {
		let ray = Ray::new(1);
		let pool = BufferPool::new();
		let mut b1 = pool.alloc(1);
		b1.append(b"a");
		ray.upstream.write(b1).await.unwrap();

		let mut b2 = pool.alloc(1);
		b2.append(b"b");
		let ray2 = &ray;
		let write2 = tokio::time::timeout(std::time::Duration::from_millis(50), ray2.upstream.write(b2));
		// Capacity 1 is already full; the second write should not complete
		// until the first is drained.
		assert!(write2.await.is_err());
		let got = ray.downstream.read().await.unwrap();
		got.release(&pool);
		ray.release(&pool);
	}
}
