//! Server-side user identification: a rolling table of
//! `HMAC-MD5(user_id, timestamp)` covering the ±30s jitter window around
//! "now," so a connection's leading 16 bytes can be matched to a user
//! (and the timestamp it was generated at, which the header decryption
//! key also depends on) without decrypting anything first.

use std::{
	collections::HashMap,
	time::{SystemTime, UNIX_EPOCH},
};

use uuid::Uuid;

use crate::crypto::{AUTH_WINDOW_SECS, auth_bytes};

/// How often the table is rebuilt. Smaller than the jitter window so a
/// request timestamped at the very edge of the window is never missed
/// between rebuilds.
pub const REFRESH_INTERVAL_SECS: i64 = 10;

#[derive(Default)]
pub struct AuthTable {
	entries: HashMap<[u8; 16], (Uuid, i64)>,
	built_at: i64,
}

pub fn unix_now() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before 1970").as_secs() as i64
}

impl AuthTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Rebuilds the table for every user across `now ± AUTH_WINDOW_SECS`,
	/// unconditionally — callers gate this on [`Self::is_stale`].
	pub fn rebuild(&mut self, users: &[Uuid], now: i64) {
		self.entries.clear();
		for &id in users {
			for offset in -AUTH_WINDOW_SECS..=AUTH_WINDOW_SECS {
				let ts = now + offset;
				self.entries.insert(auth_bytes(id, ts), (id, ts));
			}
		}
		self.built_at = now;
	}

	pub fn is_stale(&self, now: i64) -> bool {
		(now - self.built_at).abs() >= REFRESH_INTERVAL_SECS
	}

	/// Looks up the 16-byte prefix a connection opened with. Returns the
	/// user and the exact timestamp the client used, which the caller
	/// needs to derive the same header decryption key.
	pub fn identify(&self, auth: &[u8; 16]) -> Option<(Uuid, i64)> {
		self.entries.get(auth).copied()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identifies_a_user_within_the_jitter_window() {
		let user = Uuid::new_v4();
		let now = 1_700_000_000i64;
		let mut table = AuthTable::new();
		table.rebuild(&[user], now);

		let client_ts = now - 25;
		let auth = auth_bytes(user, client_ts);
		let (identified, ts) = table.identify(&auth).unwrap();
		assert_eq!(identified, user);
		assert_eq!(ts, client_ts);
	}

	#[test]
	fn rejects_a_user_outside_the_configured_set() {
		let configured = Uuid::new_v4();
		let intruder = Uuid::new_v4();
		let now = 1_700_000_000i64;
		let mut table = AuthTable::new();
		table.rebuild(&[configured], now);

		let auth = auth_bytes(intruder, now);
		assert!(table.identify(&auth).is_none());
	}

	#[test]
	fn stale_after_the_refresh_interval() {
		let mut table = AuthTable::new();
		table.rebuild(&[], 1000);
		assert!(!table.is_stale(1005));
		assert!(table.is_stale(1011));
	}
}
