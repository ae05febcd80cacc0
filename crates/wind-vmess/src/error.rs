use std::{backtrace::Backtrace, net::SocketAddr};

use snafu::prelude::*;

/// Error kinds surfaced by the VMess codec and session state machine, per
/// §7 of the error handling design: protocol/crypto failures are terminal
/// for the affected session and never retried.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum VmessError {
	#[snafu(display("vmess authenticator did not verify"))]
	InvalidAuthentication { backtrace: Backtrace },
	#[snafu(display("unrecognised vmess protocol version {value}"))]
	InvalidProtocolVersion { value: u8, backtrace: Backtrace },
	#[snafu(display("corrupted vmess packet: {reason}"))]
	CorruptedPacket { reason: String, backtrace: Backtrace },
	#[snafu(display("command id {expected} expected, got {actual}"))]
	CommandTypeMismatch { expected: u8, actual: u8, backtrace: Backtrace },
	#[snafu(display("unknown vmess command id {value}"))]
	UnknownCommand { value: u8, backtrace: Backtrace },
	#[snafu(display("vmess command frame of {len} bytes exceeds the 255-byte limit"))]
	CommandTooLarge { len: usize, backtrace: Backtrace },
	#[snafu(display("vmess inbound is already listening on {socket_addr}"))]
	AlreadyListening { socket_addr: SocketAddr, backtrace: Backtrace },
	Io { source: std::io::Error, backtrace: Backtrace },
}

impl From<std::io::Error> for VmessError {
	fn from(source: std::io::Error) -> Self {
		use snafu::IntoError as _;
		IoSnafu.into_error(source)
	}
}
