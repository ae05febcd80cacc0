//! The VMess command channel: a single defined command, `SwitchAccount`,
//! carried inside the response header. Grounded field-for-field in
//! `examples/original_source/proxy/vmess/encoding/commands.go`.

use bytes::{Buf, BufMut, BytesMut};
use fnv::FnvHasher;
use snafu::ensure;
use uuid::Uuid;

use crate::error::{
	CommandTooLargeSnafu, CorruptedPacketSnafu, InvalidAuthenticationSnafu, UnknownCommandSnafu, VmessError,
};

/// Command id for `SwitchAccount`; the only command the protocol defines.
pub const CMD_SWITCH_ACCOUNT: u8 = 1;

/// The number of authenticator bytes prefixed onto a command body
/// (`total_len` counts these in addition to the body itself).
const AUTH_LEN: usize = 4;

/// Instructs the client to migrate to a new server address and credential.
/// `host` is a domain only — unlike the general [`wind_core::types::Address`]
/// model, the wire format for this one command never carries a raw IP, only
/// the length-prefixed string `commands.go` writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSwitchAccount {
	pub host: Option<String>,
	pub port: u16,
	pub id: Uuid,
	pub alter_ids: u16,
	pub level: u8,
	pub valid_min: u8,
}

fn fnv_auth(body: &[u8]) -> [u8; AUTH_LEN] {
	use std::hash::Hasher as _;
	let mut hasher = FnvHasher::default();
	hasher.write(body);
	(hasher.finish() as u32).to_be_bytes()
}

impl CommandSwitchAccount {
	fn marshal_body(&self) -> BytesMut {
		let host_bytes = self.host.as_deref().unwrap_or("").as_bytes();
		let mut body = BytesMut::with_capacity(1 + host_bytes.len() + 2 + 16 + 2 + 1 + 1);
		body.put_u8(host_bytes.len() as u8);
		body.put_slice(host_bytes);
		body.put_u16(self.port);
		body.put_slice(self.id.as_bytes());
		body.put_u16(self.alter_ids);
		body.put_u8(self.level);
		body.put_u8(self.valid_min);
		body
	}

	fn unmarshal_body(mut data: &[u8]) -> Result<Self, VmessError> {
		ensure!(!data.is_empty(), CorruptedPacketSnafu { reason: "empty switch-account body" });
		let host_len = data[0] as usize;
		data.advance(1);
		ensure!(
			data.len() >= host_len,
			CorruptedPacketSnafu { reason: "switch-account host truncated" }
		);
		let host = if host_len == 0 {
			None
		} else {
			let raw = &data[..host_len];
			let s = std::str::from_utf8(raw)
				.map_err(|_| CorruptedPacketSnafu { reason: "switch-account host not utf8" }.build())?;
			Some(s.to_owned())
		};
		data.advance(host_len);

		ensure!(data.len() >= 2, CorruptedPacketSnafu { reason: "switch-account port truncated" });
		let port = data.get_u16();

		ensure!(data.len() >= 16, CorruptedPacketSnafu { reason: "switch-account uuid truncated" });
		let mut uuid_bytes = [0u8; 16];
		uuid_bytes.copy_from_slice(&data[..16]);
		data.advance(16);
		let id = Uuid::from_bytes(uuid_bytes);

		ensure!(data.len() >= 2, CorruptedPacketSnafu { reason: "switch-account alterIds truncated" });
		let alter_ids = data.get_u16();

		ensure!(data.len() >= 1, CorruptedPacketSnafu { reason: "switch-account level truncated" });
		let level = data.get_u8();

		ensure!(data.len() >= 1, CorruptedPacketSnafu { reason: "switch-account validMin truncated" });
		let valid_min = data.get_u8();

		Ok(CommandSwitchAccount { host, port, id, alter_ids, level, valid_min })
	}
}

/// Writes `{cmd_id, total_len, 4-byte FNV auth, body}`. `total_len` is the
/// body length plus the 4 authenticator bytes and must fit in one byte.
pub fn marshal_command(cmd: &CommandSwitchAccount) -> Result<BytesMut, VmessError> {
	let body = cmd.marshal_body();
	let total_len = body.len() + AUTH_LEN;
	ensure!(total_len <= u8::MAX as usize, CommandTooLargeSnafu { len: total_len });

	let mut out = BytesMut::with_capacity(2 + total_len);
	out.put_u8(CMD_SWITCH_ACCOUNT);
	out.put_u8(total_len as u8);
	out.put_slice(&fnv_auth(&body));
	out.put_slice(&body);
	Ok(out)
}

/// Validates the frame length and authenticator first — matching
/// `commands.go`'s `UnmarshalCommand`, which rejects a short or
/// unauthenticated frame before ever looking at `cmdId` — then switches on
/// `cmd_id` and parses the body strictly in declared order. `data` is the
/// frame sans `cmd_id` and `total_len`, i.e. `{4-byte auth, body}`.
pub fn unmarshal_command(cmd_id: u8, data: &[u8]) -> Result<CommandSwitchAccount, VmessError> {
	ensure!(data.len() >= AUTH_LEN, CorruptedPacketSnafu { reason: "command frame shorter than its auth" });
	let (auth, body) = data.split_at(AUTH_LEN);
	ensure!(auth == fnv_auth(body), InvalidAuthenticationSnafu);
	ensure!(cmd_id == CMD_SWITCH_ACCOUNT, UnknownCommandSnafu { value: cmd_id });
	CommandSwitchAccount::unmarshal_body(body)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn switch_account_round_trips_through_marshal_unmarshal() {
		let cmd = CommandSwitchAccount {
			host: Some("example.com".to_owned()),
			port: 443,
			id: Uuid::parse_str("e641f5ad-9397-41e3-bf1a-e8740dfed019").unwrap(),
			alter_ids: 16,
			level: 0,
			valid_min: 1,
		};
		let framed = marshal_command(&cmd).unwrap();
		assert_eq!(framed[0], CMD_SWITCH_ACCOUNT);
		let total_len = framed[1] as usize;
		assert_eq!(total_len, framed.len() - 2);

		let body_with_auth = &framed[2..];
		let got = unmarshal_command(framed[0], body_with_auth).unwrap();
		assert_eq!(got, cmd);
	}

	#[test]
	fn switch_account_with_no_host_round_trips() {
		let cmd = CommandSwitchAccount {
			host: None,
			port: 1080,
			id: Uuid::nil(),
			alter_ids: 0,
			level: 0,
			valid_min: 5,
		};
		let framed = marshal_command(&cmd).unwrap();
		let got = unmarshal_command(framed[0], &framed[2..]).unwrap();
		assert_eq!(got, cmd);
	}

	#[test]
	fn tampered_auth_is_rejected() {
		let cmd = CommandSwitchAccount {
			host: Some("x".to_owned()),
			port: 1,
			id: Uuid::nil(),
			alter_ids: 0,
			level: 0,
			valid_min: 0,
		};
		let mut framed = marshal_command(&cmd).unwrap();
		framed[2] ^= 0xff;
		let err = unmarshal_command(framed[0], &framed[2..]).unwrap_err();
		assert!(matches!(err, VmessError::InvalidAuthentication { .. }));
	}

	#[test]
	fn unknown_command_id_is_rejected() {
		let auth = fnv_auth(&[]);
		let err = unmarshal_command(2, &auth).unwrap_err();
		assert!(matches!(err, VmessError::UnknownCommand { value: 2, .. }));
	}

	#[test]
	fn short_frame_is_rejected_even_with_unknown_command_id() {
		let err = unmarshal_command(2, &[0, 0, 0]).unwrap_err();
		assert!(matches!(err, VmessError::CorruptedPacket { .. }));
	}

	#[test]
	fn oversized_body_is_rejected_before_framing() {
		let cmd = CommandSwitchAccount {
			host: Some("x".repeat(300)),
			port: 1,
			id: Uuid::nil(),
			alter_ids: 0,
			level: 0,
			valid_min: 0,
		};
		let err = marshal_command(&cmd).unwrap_err();
		assert!(matches!(err, VmessError::CommandTooLarge { .. }));
	}
}
