//! Descriptor-level socket primitives and the `Socket` lifecycle object.

mod listener;
mod raw;
mod stream;
mod datagram;
mod options;
mod builder;
mod pending;
mod connection;
mod core;

pub use self::listener::{accept, Accepted};
pub use self::raw::RawSocket;
pub use self::stream::{receive, send_all, wait_ready, Received, Shutdown};
pub use self::datagram::{receive_filtered, receive_from, send_to};
pub use self::options::{set_reuse_addr, set_reuse_port, set_tcp_nodelay, set_v6only,
						set_keepalive, set_keepalive_count, set_keepalive_idle, set_keepalive_interval,
						join_multicast, set_multicast_ttl, set_multicast_loop};
pub use self::builder::{SocketOptions, ReuseConfig, KeepaliveConfig, LISTEN_BACKLOG};
pub use self::pending::{finish_connect, take_error};
pub use self::connection::{Connection, ConnectionId, State};
pub use self::core::Socket;

/// Transport type of a socket.
///
/// - `Stream`: reliable, ordered byte stream (TCP or UNIX stream)
/// - `Datagram`: unordered packets with boundaries (UDP or UNIX datagram)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
	Stream,
	Datagram,
}

impl Kind {
	/// Returns the libc constant for this socket type.
	#[inline]
	pub fn raw(self) -> libc::c_int {
		match self {
			Kind::Stream => libc::SOCK_STREAM,
			Kind::Datagram => libc::SOCK_DGRAM,
		}
	}
}

/// Which side of a connection a socket plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
	/// Binds and waits (accepting for streams).
	Server,
	/// Connects out, or sends to a fixed peer for datagrams.
	Client,
}
