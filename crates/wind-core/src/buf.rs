//! Fixed-size buffer pooling for the ray fabric.
//!
//! Two pools back every allocation: `small` (2 KiB) for protocol headers and
//! control frames, `large` (64 KiB) for payload chunks. Both are LIFO free
//! lists so recently-released buffers (warm in cache) are handed out first.

use std::cell::Cell;

use crossbeam_queue::ArrayQueue;

pub const SMALL_BUFFER_SIZE: usize = 2 * 1024;
pub const LARGE_BUFFER_SIZE: usize = 64 * 1024;

const SMALL_POOL_CAPACITY: usize = 2048;
const LARGE_POOL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PoolTag {
	Small,
	Large,
	/// Allocated straight from the heap because the request exceeded
	/// `LARGE_BUFFER_SIZE`, or because the owning pool was full on release.
	Heap,
}

/// A pooled byte buffer. Must be explicitly `release()`d back to its pool;
/// dropping without releasing is allowed but forfeits reuse and is flagged
/// in debug builds.
pub struct Buffer {
	data: Vec<u8>,
	len: usize,
	tag: PoolTag,
	released: Cell<bool>,
}

impl Buffer {
	fn new(capacity: usize, tag: PoolTag) -> Self {
		Self { data: vec![0u8; capacity], len: 0, tag, released: Cell::new(false) }
	}

	pub fn capacity(&self) -> usize {
		self.data.len()
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.data[..self.len]
	}

	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		&mut self.data[..self.len]
	}

	pub fn clear(&mut self) {
		self.len = 0;
	}

	/// Appends bytes, growing onto the heap past this buffer's pooled
	/// capacity if needed (the buffer then no longer returns to its pool).
	pub fn append(&mut self, bytes: &[u8]) {
		let needed = self.len + bytes.len();
		if needed > self.data.len() {
			self.data.resize(needed, 0);
			self.tag = PoolTag::Heap;
		}
		self.data[self.len..needed].copy_from_slice(bytes);
		self.len = needed;
	}

	pub fn slice(&self, range: std::ops::Range<usize>) -> &[u8] {
		&self.data[..self.len][range]
	}

	/// Returns this buffer's storage to the pool it came from. A no-op (but
	/// debug-asserted) if called twice.
	pub fn release(mut self, pool: &BufferPool) {
		debug_assert!(!self.released.get(), "double release of pooled buffer");
		if self.released.get() {
			return;
		}
		self.released.set(true);
		self.len = 0;
		let data = std::mem::take(&mut self.data);
		match self.tag {
			PoolTag::Small => {
				let _ = pool.small.push(data);
			}
			PoolTag::Large => {
				let _ = pool.large.push(data);
			}
			PoolTag::Heap => {}
		}
	}
}

impl Drop for Buffer {
	fn drop(&mut self) {
		debug_assert!(
			self.released.get(),
			"Buffer dropped without release(); its storage will not be reused"
		);
	}
}

/// Holds the two fixed pools. Cheap to clone (wrap in `Arc` at the call
/// site) — the queues themselves are the shared state.
pub struct BufferPool {
	small: ArrayQueue<Vec<u8>>,
	large: ArrayQueue<Vec<u8>>,
}

impl Default for BufferPool {
	fn default() -> Self {
		Self::new()
	}
}

impl BufferPool {
	pub fn new() -> Self {
		Self {
			small: ArrayQueue::new(SMALL_POOL_CAPACITY),
			large: ArrayQueue::new(LARGE_POOL_CAPACITY),
		}
	}

	/// Allocates a buffer of at least `size` bytes from the appropriate pool,
	/// falling back to the heap for oversized requests.
	pub fn alloc(&self, size: usize) -> Buffer {
		if size <= SMALL_BUFFER_SIZE {
			if let Some(mut data) = self.small.pop() {
				data.resize(SMALL_BUFFER_SIZE, 0);
				return Buffer { data, len: 0, tag: PoolTag::Small, released: Cell::new(false) };
			}
			return Buffer::new(SMALL_BUFFER_SIZE, PoolTag::Small);
		}
		if size <= LARGE_BUFFER_SIZE {
			if let Some(mut data) = self.large.pop() {
				data.resize(LARGE_BUFFER_SIZE, 0);
				return Buffer { data, len: 0, tag: PoolTag::Large, released: Cell::new(false) };
			}
			return Buffer::new(LARGE_BUFFER_SIZE, PoolTag::Large);
		}
		Buffer::new(size, PoolTag::Heap)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reuses_released_small_buffers() {
		let pool = BufferPool::new();
		let buf = pool.alloc(16);
		assert_eq!(buf.capacity(), SMALL_BUFFER_SIZE);
		buf.release(&pool);
		assert_eq!(pool.small.len(), 1);
		let buf2 = pool.alloc(16);
		assert_eq!(pool.small.len(), 0);
		buf2.release(&pool);
	}

	#[test]
	fn oversized_alloc_goes_to_heap_and_does_not_pool() {
		let pool = BufferPool::new();
		let buf = pool.alloc(LARGE_BUFFER_SIZE + 1);
		assert_eq!(buf.capacity(), LARGE_BUFFER_SIZE + 1);
		buf.release(&pool);
		assert_eq!(pool.large.len(), 0);
		assert_eq!(pool.small.len(), 0);
	}

	#[test]
	fn append_past_capacity_falls_back_to_heap() {
		let pool = BufferPool::new();
		let mut buf = pool.alloc(16);
		buf.append(&vec![1u8; SMALL_BUFFER_SIZE + 10]);
		assert_eq!(buf.len(), SMALL_BUFFER_SIZE + 10);
		buf.release(&pool);
		assert_eq!(pool.small.len(), 0);
	}
}
