//! The KCP transport's simple packet authenticator: a random salt guards
//! against replay of an identical payload, a short checksum catches
//! corruption or tampering. Grounded on
//! `examples/original_source/transport/internet/kcp/crypt_test.go` — only
//! the test file shipped with the retrieval pack, so the algorithm below
//! (2-byte salt, 2-byte XOR checksum over salt‖payload) is inferred from
//! the tests' black-box round-trip behavior rather than copied from a
//! `crypt.go` source.

use bytes::{BufMut, BytesMut};
use rand::RngCore;

const SALT_LEN: usize = 2;
const CHECKSUM_LEN: usize = 2;

fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
	let mut acc = [0u8; CHECKSUM_LEN];
	for (i, b) in data.iter().enumerate() {
		acc[i % CHECKSUM_LEN] ^= b;
	}
	acc
}

/// Seals and opens packets in place. Stateless — a fresh salt is drawn on
/// every [`Self::seal`] call.
#[derive(Default, Clone, Copy)]
pub struct SimpleAuthenticator;

impl SimpleAuthenticator {
	pub fn new() -> Self {
		Self
	}

	/// Prepends a random 2-byte salt and appends a 2-byte checksum over
	/// `salt ‖ payload`, replacing `buf`'s contents with the sealed frame.
	pub fn seal(&self, buf: &mut BytesMut) {
		let mut salt = [0u8; SALT_LEN];
		rand::rng().fill_bytes(&mut salt);

		let mut sealed = BytesMut::with_capacity(SALT_LEN + buf.len() + CHECKSUM_LEN);
		sealed.put_slice(&salt);
		sealed.put_slice(buf);
		let sum = checksum(&sealed);
		sealed.put_slice(&sum);

		*buf = sealed;
	}

	/// Validates the trailing checksum, then strips it and the leading
	/// salt, leaving the original payload in `buf`. Returns `false` (and
	/// leaves `buf` untouched) on a checksum mismatch or a frame too short
	/// to have ever been sealed.
	pub fn open(&self, buf: &mut BytesMut) -> bool {
		if buf.len() < SALT_LEN + CHECKSUM_LEN {
			return false;
		}
		let split = buf.len() - CHECKSUM_LEN;
		let (body, want) = buf.split_at(split);
		if checksum(body) != want {
			return false;
		}

		let payload = BytesMut::from(&buf[SALT_LEN..split]);
		*buf = payload;
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_seven_bytes() {
		let auth = SimpleAuthenticator::new();
		let mut buf = BytesMut::from(&b"abcdefg"[..]);
		auth.seal(&mut buf);
		assert!(auth.open(&mut buf));
		assert_eq!(&buf[..], b"abcdefg");
	}

	#[test]
	fn round_trips_two_bytes() {
		let auth = SimpleAuthenticator::new();
		let mut buf = BytesMut::from(&b"12"[..]);
		auth.seal(&mut buf);
		assert!(auth.open(&mut buf));
		assert_eq!(&buf[..], b"12");
	}

	#[test]
	fn rejects_a_tampered_frame() {
		let auth = SimpleAuthenticator::new();
		let mut buf = BytesMut::from(&b"abcdefg"[..]);
		auth.seal(&mut buf);
		let last = buf.len() - 1;
		buf[last] ^= 0xff;
		assert!(!auth.open(&mut buf));
	}

	#[test]
	fn rejects_a_frame_shorter_than_salt_plus_checksum() {
		let auth = SimpleAuthenticator::new();
		let mut buf = BytesMut::from(&b"ab"[..]);
		assert!(!auth.open(&mut buf));
	}
}
