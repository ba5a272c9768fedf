use std::fmt;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::addr::SockAddr;
use crate::reactor::Token;
use crate::tls::{Handshake, TlsSession};
use crate::error::TlsError;
use super::{datagram, stream, Kind, RawSocket, Received};

/// Identifies a connection within its socket: the client handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) RawFd);

impl ConnectionId {
	/// The descriptor number behind this connection.
	pub fn raw(self) -> RawFd {
		self.0
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Pending-operation mask of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct State(u8);

impl State {
	/// TLS negotiation still running; no data callbacks yet.
	pub const HANDSHAKING: State = State(1 << 0);
	/// Usable for data callbacks.
	pub const ESTABLISHED: State = State(1 << 1);
	/// The peer closed its side.
	pub const PEER_CLOSED: State = State(1 << 2);
	/// Local close requested; torn down after the current callback.
	pub const CLOSING: State = State(1 << 3);

	pub fn contains(self, other: State) -> bool {
		self.0 & other.0 == other.0
	}

	pub fn insert(&mut self, other: State) {
		self.0 |= other.0;
	}

	pub fn remove(&mut self, other: State) {
		self.0 &= !other.0;
	}

	/// True if the connection should be torn down.
	pub fn is_finished(self) -> bool {
		self.0 & (State::PEER_CLOSED.0 | State::CLOSING.0) != 0
	}
}

// Accepted peers own their descriptor; client-mode and datagram
// connections ride on the socket's own.
#[derive(Debug)]
enum Stream {
	Owned(RawSocket),
	Borrowed(RawFd),
}

/// One accepted or established peer of a `Socket`.
#[derive(Debug)]
pub struct Connection {
	id: ConnectionId,
	server: RawFd,
	remote: String,
	peer: Option<SockAddr>,
	stream: Stream,
	tls: Option<TlsSession>,
	state: State,
	kind: Kind,
	unicast: bool,
	io_timeout: Duration,
	opened: Instant,
	pub(crate) token: Option<Token>,
}

impl Connection {
	/// An accepted peer with its own descriptor.
	pub(crate) fn accepted(raw: RawSocket, server: RawFd, peer: SockAddr, io_timeout: Duration) -> Self {
		let fd = raw.as_raw_fd();
		Self {
			id: ConnectionId(fd),
			server,
			remote: peer.host_string(),
			peer: Some(peer),
			stream: Stream::Owned(raw),
			tls: None,
			state: State::default(),
			kind: Kind::Stream,
			unicast: false,
			io_timeout,
			opened: Instant::now(),
			token: None,
		}
	}

	/// The single connection of a client or datagram socket.
	///
	/// Client handle and server handle are the same descriptor.
	pub(crate) fn attached(fd: RawFd, kind: Kind, peer: Option<SockAddr>, unicast: bool, io_timeout: Duration) -> Self {
		Self {
			id: ConnectionId(fd),
			server: fd,
			remote: peer.as_ref().map(SockAddr::host_string).unwrap_or_default(),
			peer,
			stream: Stream::Borrowed(fd),
			tls: None,
			state: State::default(),
			kind,
			unicast,
			io_timeout,
			opened: Instant::now(),
			token: None,
		}
	}

	pub fn id(&self) -> ConnectionId {
		self.id
	}

	/// Descriptor of the socket that owns this connection.
	pub fn server_handle(&self) -> RawFd {
		self.server
	}

	/// True for the connection a client or datagram socket holds on itself.
	pub fn is_attached(&self) -> bool {
		matches!(self.stream, Stream::Borrowed(_))
	}

	/// Remote address string (no port) used for logs and acceptance checks.
	pub fn remote(&self) -> &str {
		&self.remote
	}

	pub fn peer(&self) -> Option<&SockAddr> {
		self.peer.as_ref()
	}

	pub fn kind(&self) -> Kind {
		self.kind
	}

	pub fn state(&self) -> State {
		self.state
	}

	pub(crate) fn state_mut(&mut self) -> &mut State {
		&mut self.state
	}

	pub fn is_established(&self) -> bool {
		self.state.contains(State::ESTABLISHED)
	}

	pub fn is_secure(&self) -> bool {
		self.tls.is_some()
	}

	/// How long ago the connection was created.
	pub fn age(&self) -> Duration {
		self.opened.elapsed()
	}

	pub(crate) fn fd(&self) -> RawFd {
		match &self.stream {
			Stream::Owned(raw) => raw.as_raw_fd(),
			Stream::Borrowed(fd) => *fd,
		}
	}

	pub(crate) fn attach_tls(&mut self, session: TlsSession) {
		self.tls = Some(session);
		self.state.insert(State::HANDSHAKING);
	}

	/// Steps the TLS handshake; plain connections are complete at once.
	pub(crate) fn negotiate(&mut self) -> Result<Handshake, TlsError> {
		let fd = self.fd();
		let timeout = self.io_timeout;
		let Some(session) = self.tls.as_mut() else {
			return Ok(Handshake::Complete);
		};
		let progress = session.negotiate(fd, timeout)?;
		if progress == Handshake::Complete {
			self.state.remove(State::HANDSHAKING);
			self.state.insert(State::ESTABLISHED);
		}
		Ok(progress)
	}

	/// True while the TLS engine holds decrypted bytes.
	pub fn has_buffered(&mut self) -> bool {
		self.tls.as_mut().is_some_and(TlsSession::has_buffered)
	}

	/// Sends the whole buffer.
	///
	/// Datagram connections send one datagram to their peer.
	pub fn send(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		let fd = self.fd();
		if let Some(session) = self.tls.as_mut() {
			return session.send(fd, buf, self.io_timeout);
		}
		match (self.kind, &self.peer) {
			(Kind::Datagram, Some(peer)) => datagram::send_to(fd, buf, peer),
			_ => stream::send_all(fd, buf, self.io_timeout),
		}
	}

	/// Receives what is available without blocking.
	///
	/// A peer close also marks the connection `PEER_CLOSED`.
	pub fn receive(&mut self, buf: &mut [u8]) -> std::io::Result<Received> {
		let fd = self.fd();
		let received = if let Some(session) = self.tls.as_mut() {
			session.receive(fd, buf, self.io_timeout)?
		} else if self.kind == Kind::Datagram {
			let filter = if self.unicast { self.peer.as_ref() } else { None };
			match datagram::receive_filtered(fd, buf, filter)? {
				Some((n, _)) => Received::Data(n),
				None => Received::WouldBlock,
			}
		} else {
			stream::receive(fd, buf)?
		};
		if received.is_closed() {
			self.state.insert(State::PEER_CLOSED);
		}
		Ok(received)
	}

	/// Receives one datagram and its sender.
	pub fn receive_from(&mut self, buf: &mut [u8]) -> std::io::Result<Option<(usize, SockAddr)>> {
		let filter = if self.unicast { self.peer.as_ref() } else { None };
		datagram::receive_filtered(self.fd(), buf, filter)
	}

	/// Sends one datagram to `addr`.
	pub fn send_to(&mut self, buf: &[u8], addr: &SockAddr) -> std::io::Result<usize> {
		datagram::send_to(self.fd(), buf, addr)
	}

	/// Sends `close_notify` when secure. Owned descriptors close on drop.
	pub(crate) fn close(mut self) {
		let fd = self.fd();
		if let Some(session) = self.tls.as_mut() {
			session.close(fd);
		}
	}
}
