//! Typed socket variants and the callback interfaces the reactor drives.
//!
//! Each variant narrows a `Socket` to one role and knows its own open
//! sequence. Application code supplies a `Handler` for data, connect,
//! close and accept decisions.

mod policy;
mod tcp;
mod udp;
mod unix;

pub use self::policy::AcceptPolicy;
pub use self::tcp::{Client, Server, TlsClient, TlsServer};
pub use self::udp::{Multicast, Udp};
pub use self::unix::{UnixClient, UnixServer};

use std::io;

use tracing::debug;

use crate::addr::{Family, SockAddr};
use crate::config::{ConfigStore, SocketSection};
use crate::error::SocketError;
use crate::socket::{Connection, ConnectionId, Received, Socket, State};

/// A socket variant the reactor can own.
pub trait Endpoint: Send {
	fn socket(&self) -> &Socket;

	fn socket_mut(&mut self) -> &mut Socket;

	/// Runs this variant's open sequence.
	fn open_at(&mut self, host: &str, service: &str) -> io::Result<()>;

	/// Closes and starts a fresh connect to the last host and service
	/// without waiting for it.
	///
	/// Returns `true` when connected at once; otherwise the socket is left
	/// connecting for the reactor to finish.
	fn restart(&mut self) -> io::Result<bool> {
		let Some((host, service)) = self.socket().target().map(|(h, s)| (h.to_owned(), s.to_owned())) else {
			return Err(SocketError::NotOpen { name: self.socket().name().to_owned() }.into());
		};
		let socket = self.socket_mut();
		socket.close();
		socket.open(&host, &service)?;
		socket.begin_connect()
	}

	/// Opens with settings from the socket's configuration section.
	///
	/// `host` and `service` are the defaults written back when the section
	/// lacks them.
	fn open_configured(&mut self, store: &ConfigStore, host: &str, service: &str) -> io::Result<()> {
		let name = self.socket().name().to_owned();
		let section = store.socket(&name, SocketSection::new(host, service))?;
		section.apply(self.socket_mut());
		let service = section.service();
		self.open_at(&section.host, &service)
	}

	fn close(&mut self) {
		self.socket_mut().close();
	}
}

/// Application callbacks for one registered socket.
///
/// Callbacks run on the reactor thread with the socket registry locked:
/// use the `Link` to talk to the peer, never the `Controller`.
pub trait Handler: Send {
	/// Data is pending on a connection. Returns the bytes processed.
	fn on_data(&mut self, link: &mut Link<'_>) -> io::Result<usize>;

	/// A connection became usable (after the TLS handshake when secure).
	fn on_connect(&mut self, _link: &mut Link<'_>) {}

	/// An established connection went away.
	fn on_close(&mut self, _socket: &str, _conn: ConnectionId) {}

	/// Last word on a non-UNIX peer that passed the allow-list.
	fn on_accept(&mut self, _remote: &str, _allow: &mut bool) {}

	/// The socket failed for good and was closed by the reactor.
	fn on_error(&mut self, _socket: &str, _error: &io::Error) {}
}

impl<F> Handler for F
where
	F: FnMut(&mut Link<'_>) -> io::Result<usize> + Send,
{
	fn on_data(&mut self, link: &mut Link<'_>) -> io::Result<usize> {
		self(link)
	}
}

/// Pins a closure to the data-callback signature.
pub fn data_handler<F>(f: F) -> F
where
	F: FnMut(&mut Link<'_>) -> io::Result<usize> + Send,
{
	f
}

/// A callback's view of one connection.
pub struct Link<'a> {
	socket: &'a str,
	conn: &'a mut Connection,
	debug: bool,
}

impl<'a> Link<'a> {
	pub(crate) fn new(socket: &'a str, conn: &'a mut Connection, debug: bool) -> Self {
		Self { socket, conn, debug }
	}

	/// Logical name of the owning socket.
	pub fn socket_name(&self) -> &str {
		self.socket
	}

	pub fn id(&self) -> ConnectionId {
		self.conn.id()
	}

	pub fn remote(&self) -> &str {
		self.conn.remote()
	}

	pub fn peer(&self) -> Option<&SockAddr> {
		self.conn.peer()
	}

	pub fn is_secure(&self) -> bool {
		self.conn.is_secure()
	}

	pub fn connection(&self) -> &Connection {
		&*self.conn
	}

	pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
		let n = self.conn.send(buf)?;
		if self.debug {
			debug!(socket = self.socket, conn = %self.conn.id(), bytes = n, "sent");
		}
		Ok(n)
	}

	pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<Received> {
		let received = self.conn.receive(buf)?;
		if self.debug {
			debug!(socket = self.socket, conn = %self.conn.id(), ?received, "received");
		}
		Ok(received)
	}

	/// Reads everything available right now into `out`.
	///
	/// Returns the number of bytes appended; a peer close is reported by the
	/// connection state and ends the read.
	pub fn receive_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
		let mut buf = [0u8; 4096];
		let mut total = 0;
		while let Received::Data(n) = self.receive(&mut buf)? {
			if n == 0 {
				break;
			}
			out.extend_from_slice(&buf[..n]);
			total += n;
		}
		Ok(total)
	}

	pub fn receive_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SockAddr)>> {
		self.conn.receive_from(buf)
	}

	pub fn send_to(&mut self, buf: &[u8], addr: &SockAddr) -> io::Result<usize> {
		self.conn.send_to(buf, addr)
	}

	/// Asks the reactor to drop this connection once the callback returns.
	pub fn close(&mut self) {
		self.conn.state_mut().insert(State::CLOSING);
	}
}

/// True if a peer may be registered on `socket`. UNIX peers always pass.
pub(crate) fn admits(socket: &Socket, peer: &SockAddr) -> bool {
	socket.family() == Family::Unix
		|| peer.family() == Family::Unix
		|| socket.options().allow.allows(&peer.host_string())
}
