use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::addr::{self, Address, Family, SockAddr};
use crate::endpoint::Link;
use crate::error::SocketError;
use crate::tls::TlsContext;
use super::{
	datagram, finish_connect, set_v6only, stream, take_error, Accepted, Connection, ConnectionId,
	Kind, RawSocket, Received, Role, Shutdown, SocketOptions, LISTEN_BACKLOG,
};

/// A named socket with its resolved address, flags and connections.
///
/// Created empty; `open` allocates the descriptor, `close` returns it to the
/// empty state and the same object may be opened again.
#[derive(Debug)]
pub struct Socket {
	name: String,
	kind: Kind,
	family: Family,
	role: Role,
	raw: Option<RawSocket>,
	address: Option<Address>,
	/// Host and service of the last open, kept across close for reconnects.
	target: Option<(String, String)>,
	/// Set once `bind` succeeded; only then is a UNIX path ours to unlink.
	bound: bool,
	listening: bool,
	connecting: bool,
	connected: bool,
	blocking: bool,
	options: SocketOptions,
	tls: Option<Arc<TlsContext>>,
	connections: BTreeMap<ConnectionId, Connection>,
}

impl Socket {
	pub fn new(name: impl Into<String>, kind: Kind, family: Family, role: Role) -> Self {
		Self {
			name: name.into(),
			kind,
			family,
			role,
			raw: None,
			address: None,
			target: None,
			bound: false,
			listening: false,
			connecting: false,
			connected: false,
			blocking: true,
			options: SocketOptions::default(),
			tls: None,
			connections: BTreeMap::new(),
		}
	}

	pub fn with_options(mut self, options: SocketOptions) -> Self {
		self.options = options;
		self
	}

	/// Changes the address family of a closed socket.
	pub(crate) fn set_family(&mut self, family: Family) {
		if !self.is_open() {
			self.family = family;
		}
	}

	pub fn with_tls(mut self, tls: Arc<TlsContext>) -> Self {
		self.tls = Some(tls);
		self
	}

	/// Logical name used in logs and configuration.
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn kind(&self) -> Kind {
		self.kind
	}

	pub fn family(&self) -> Family {
		self.family
	}

	pub fn role(&self) -> Role {
		self.role
	}

	pub fn options(&self) -> &SocketOptions {
		&self.options
	}

	pub fn options_mut(&mut self) -> &mut SocketOptions {
		&mut self.options
	}

	pub fn address(&self) -> Option<&Address> {
		self.address.as_ref()
	}

	pub fn target(&self) -> Option<(&str, &str)> {
		self.target.as_ref().map(|(h, s)| (h.as_str(), s.as_str()))
	}

	pub fn tls(&self) -> Option<&Arc<TlsContext>> {
		self.tls.as_ref()
	}

	pub fn is_secure(&self) -> bool {
		self.tls.is_some()
	}

	pub fn is_open(&self) -> bool {
		self.raw.is_some()
	}

	pub fn is_connected(&self) -> bool {
		self.connected
	}

	pub fn is_listening(&self) -> bool {
		self.listening
	}

	/// A non-blocking connect is in flight.
	pub fn is_connecting(&self) -> bool {
		self.connecting
	}

	pub fn is_blocking(&self) -> bool {
		self.blocking
	}

	pub fn fd(&self) -> Option<RawFd> {
		self.raw.as_ref().map(RawSocket::as_raw_fd)
	}

	fn raw(&self) -> std::io::Result<&RawSocket> {
		self.raw.as_ref().ok_or_else(|| SocketError::NotOpen { name: self.name.clone() }.into())
	}

	fn primary(&self) -> std::io::Result<&SockAddr> {
		self.address
			.as_ref()
			.map(Address::primary)
			.ok_or_else(|| SocketError::NotOpen { name: self.name.clone() }.into())
	}

	/// Resolves the address and allocates the descriptor.
	///
	/// A no-op when already open. On failure the socket stays closed.
	pub fn open(&mut self, host: &str, service: &str) -> std::io::Result<()> {
		if self.is_open() {
			return Ok(());
		}
		self.target = Some((host.to_owned(), service.to_owned()));

		let bare = host.trim_start_matches('[').trim_end_matches(']');
		if self.family == Family::Ipv4 && bare.parse::<std::net::Ipv6Addr>().is_ok() {
			debug!(socket = %self.name, host, "ipv6 literal, switching family");
			self.family = Family::Ipv6;
		}

		let passive = self.role == Role::Server;
		let address = addr::resolve(host, service, self.family, self.kind, passive).map_err(|e| {
			warn!(socket = %self.name, host, service, error = %e, "cannot resolve");
			e
		})?;
		let raw = RawSocket::new(self.family, self.kind)?;

		debug!(socket = %self.name, address = %address.primary(), "opened");
		self.address = Some(address);
		self.raw = Some(raw);
		self.blocking = true;
		Ok(())
	}

	/// Binds to the resolved address in non-blocking mode.
	///
	/// Any failure closes the socket before the error is returned.
	pub fn bind(&mut self) -> std::io::Result<()> {
		let addr = match self.primary() {
			Ok(addr) => addr.clone(),
			Err(e) => {
				self.close();
				return Err(e);
			}
		};
		self.bind_to(&addr)
	}

	/// Binds to an explicit local address instead of the resolved one.
	pub fn bind_to(&mut self, addr: &SockAddr) -> std::io::Result<()> {
		let result = self.bind_inner(addr);
		if let Err(e) = &result {
			warn!(socket = %self.name, error = %e, "bind failed");
			self.close();
		}
		result
	}

	fn bind_inner(&mut self, addr: &SockAddr) -> std::io::Result<()> {
		let raw = self.raw()?;

		if let SockAddr::Unix(path) = addr {
			if let Some(path) = path.to_path() {
				clear_stale_socket(&path, addr)?;
			}
		} else {
			self.options.reuse.apply(raw)?;
		}
		if self.family == Family::Ipv6 {
			set_v6only(raw, !self.options.dual_stack)?;
		}
		raw.set_nonblocking(true)?;
		raw.bind(addr)?;

		self.bound = true;
		self.blocking = false;
		info!(socket = %self.name, %addr, "bound");
		Ok(())
	}

	/// Starts listening; a no-op when already listening.
	pub fn listen(&mut self) -> std::io::Result<()> {
		if self.listening {
			return Ok(());
		}
		let result = self.raw().and_then(|raw| {
			self.options.apply_stream(raw, self.family == Family::Unix)?;
			raw.listen(LISTEN_BACKLOG)
		});
		match result {
			Ok(()) => {
				self.listening = true;
				info!(socket = %self.name, backlog = LISTEN_BACKLOG, "listening");
				Ok(())
			}
			Err(e) => {
				warn!(socket = %self.name, error = %e, "listen failed");
				self.close();
				Err(e)
			}
		}
	}

	/// One connect attempt, waiting at most `connect_timeout` for the peer.
	///
	/// Failure leaves the socket open; the caller decides whether to retry.
	pub fn connect(&mut self) -> std::io::Result<()> {
		if self.begin_connect()? {
			return Ok(());
		}
		let fd = self.raw()?.as_raw_fd();
		if let Err(e) = finish_connect(fd, self.options.connect_timeout) {
			self.connecting = false;
			return Err(e);
		}
		self.established()
	}

	/// Starts a connect without waiting.
	///
	/// Returns `true` when connected at once. Otherwise the socket is
	/// connecting and `complete_connect` finishes the attempt once the
	/// descriptor turns writable.
	pub fn begin_connect(&mut self) -> std::io::Result<bool> {
		if self.connected {
			return Ok(true);
		}
		let addr = self.primary()?.clone();
		let raw = self.raw()?;

		self.options.apply_stream(raw, self.family == Family::Unix)?;
		raw.set_nonblocking(true)?;
		let done = raw.start_connect(&addr)?;
		self.blocking = false;
		if done {
			self.established()?;
			return Ok(true);
		}
		debug!(socket = %self.name, %addr, "connect in progress");
		self.connecting = true;
		Ok(false)
	}

	/// Finishes a connect started by `begin_connect`.
	///
	/// Reads the pending error; without one the peer must be known too.
	pub fn complete_connect(&mut self) -> std::io::Result<()> {
		if self.connected {
			return Ok(());
		}
		let raw = self.raw()?;
		let outcome = match take_error(raw.as_raw_fd()) {
			Ok(None) => raw.peer_addr().map(drop),
			Ok(Some(e)) | Err(e) => Err(e),
		};
		self.connecting = false;
		outcome?;
		self.established()
	}

	fn established(&mut self) -> std::io::Result<()> {
		let addr = self.primary()?.clone();
		let fd = self.raw()?.as_raw_fd();
		self.connecting = false;
		self.connected = true;
		let conn = Connection::attached(fd, self.kind, Some(addr.clone()), false, self.options.io_timeout);
		self.connections.insert(conn.id(), conn);
		info!(socket = %self.name, %addr, "connected");
		Ok(())
	}

	/// Marks a datagram socket usable and gives it its single connection.
	///
	/// `peer` is where `send` goes; with `unicast` set, receives only pass
	/// datagrams from that host.
	pub(crate) fn attach(&mut self, peer: Option<SockAddr>) -> std::io::Result<ConnectionId> {
		let raw = self.raw()?;
		let fd = raw.as_raw_fd();
		if self.blocking {
			raw.set_nonblocking(true)?;
			self.blocking = false;
		}
		let conn = Connection::attached(fd, self.kind, peer, self.options.unicast, self.options.io_timeout);
		let id = conn.id();
		self.connections.insert(id, conn);
		self.connected = true;
		Ok(id)
	}

	/// Accepts one pending peer; "no pending peer" is `Accepted::WouldBlock`.
	pub fn accept(&mut self, flags: libc::c_int) -> std::io::Result<Accepted> {
		if !self.listening {
			return Err(SocketError::Unsupported { what: "accept on a socket that is not listening" }.into());
		}
		let accepted = super::accept(self.raw()?.as_raw_fd(), flags)?;
		if let Accepted::Connection(raw, peer) = &accepted {
			info!(socket = %self.name, peer = %peer, fd = raw.as_raw_fd(), "accepted");
		}
		Ok(accepted)
	}

	/// Takes ownership of an accepted peer.
	pub fn adopt(&mut self, raw: RawSocket, peer: SockAddr) -> std::io::Result<ConnectionId> {
		let server = self.raw()?.as_raw_fd();
		let conn = Connection::accepted(raw, server, peer, self.options.io_timeout);
		let id = conn.id();
		self.connections.insert(id, conn);
		Ok(id)
	}

	pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
		self.connections.get(&id)
	}

	pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
		self.connections.get_mut(&id)
	}

	pub fn connections(&self) -> impl Iterator<Item = &Connection> {
		self.connections.values()
	}

	pub fn connection_ids(&self) -> Vec<ConnectionId> {
		self.connections.keys().copied().collect()
	}

	/// The first connection, which for client and datagram sockets is the only one.
	pub fn primary_connection(&self) -> Option<ConnectionId> {
		self.connections.keys().next().copied()
	}

	/// Detaches a connection; dropping it closes an accepted descriptor.
	pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
		self.connections.remove(&id)
	}

	/// Callback view of one connection.
	pub fn link(&mut self, id: ConnectionId) -> Option<Link<'_>> {
		let debug = self.options.debug;
		let conn = self.connections.get_mut(&id)?;
		Some(Link::new(&self.name, conn, debug))
	}

	fn known(&mut self, id: ConnectionId) -> std::io::Result<&mut Connection> {
		let name = &self.name;
		self.connections
			.get_mut(&id)
			.ok_or_else(|| SocketError::UnknownConnection { name: name.clone(), id: id.raw() }.into())
	}

	/// Sends the whole buffer on one connection.
	pub fn send(&mut self, id: ConnectionId, buf: &[u8]) -> std::io::Result<usize> {
		let debug = self.options.debug;
		let n = self.known(id)?.send(buf)?;
		if debug {
			debug!(socket = %self.name, conn = %id, bytes = n, "sent");
		}
		Ok(n)
	}

	/// Receives from one connection without blocking.
	pub fn receive(&mut self, id: ConnectionId, buf: &mut [u8]) -> std::io::Result<Received> {
		let debug = self.options.debug;
		let received = self.known(id)?.receive(buf)?;
		if debug {
			debug!(socket = %self.name, conn = %id, ?received, "received");
		}
		Ok(received)
	}

	/// Sends one datagram to an explicit address.
	pub fn send_to(&mut self, buf: &[u8], addr: &SockAddr) -> std::io::Result<usize> {
		if self.kind != Kind::Datagram {
			return Err(SocketError::Unsupported { what: "send_to on a stream socket" }.into());
		}
		datagram::send_to(self.raw()?.as_raw_fd(), buf, addr)
	}

	/// Receives one datagram and its sender; `None` when nothing is queued.
	pub fn receive_from(&mut self, buf: &mut [u8]) -> std::io::Result<Option<(usize, SockAddr)>> {
		if self.kind != Kind::Datagram {
			return Err(SocketError::Unsupported { what: "receive_from on a stream socket" }.into());
		}
		datagram::receive_from(self.raw()?.as_raw_fd(), buf)
	}

	pub fn shutdown(&mut self, how: Shutdown) -> std::io::Result<()> {
		stream::shutdown(self.raw()?.as_raw_fd(), how)
	}

	/// Address the descriptor is actually bound to (ephemeral port discovery).
	pub fn local_addr(&self) -> std::io::Result<SockAddr> {
		self.raw()?.local_addr()
	}

	/// Drops every connection but keeps the descriptor.
	pub fn disconnect(&mut self) {
		for (_, conn) in std::mem::take(&mut self.connections) {
			conn.close();
		}
		if self.connected {
			debug!(socket = %self.name, "disconnected");
		}
		self.connected = false;
	}

	/// Closes every connection, then the descriptor.
	///
	/// A listening UNIX socket also removes its path. Safe to call twice.
	pub fn close(&mut self) {
		if self.raw.is_none() && self.connections.is_empty() {
			return;
		}
		self.disconnect();

		if let Some(raw) = self.raw.take() {
			if self.role == Role::Server && self.bound {
				if let Some(SockAddr::Unix(path)) = self.address.as_ref().map(Address::primary) {
					if let Some(path) = path.to_path() {
						let _ = std::fs::remove_file(&path);
					}
				}
			}
			drop(raw);
		}

		self.bound = false;
		self.listening = false;
		self.connecting = false;
		self.connected = false;
		self.blocking = true;
		self.address = None;
		info!(socket = %self.name, "closed");
	}
}

impl Drop for Socket {
	fn drop(&mut self) {
		self.close();
	}
}

/// Unlinks a leftover socket file from an earlier run.
///
/// Only a socket file nobody listens on is removed: a refused connect
/// proves it stale. A live listener makes the bind fail with `AddrInUse`.
/// Other files are left for `bind` to trip over.
fn clear_stale_socket(path: &std::path::Path, addr: &SockAddr) -> std::io::Result<()> {
	use std::os::unix::fs::FileTypeExt;
	let Ok(meta) = std::fs::symlink_metadata(path) else {
		return Ok(());
	};
	if !meta.file_type().is_socket() {
		return Ok(());
	}

	let caller = RawSocket::new(Family::Unix, Kind::Stream)?;
	caller.set_nonblocking(true)?;
	match caller.start_connect(addr) {
		Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
			debug!(path = %path.display(), "removing stale socket file");
			let _ = std::fs::remove_file(path);
			Ok(())
		}
		_ => {
			warn!(path = %path.display(), "socket path is served by a live listener");
			Err(SocketError::Bind { errno: libc::EADDRINUSE, addr: addr.to_string() }.into())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn open_is_idempotent() {
		let mut socket = Socket::new("scratch", Kind::Stream, Family::Ipv4, Role::Server);
		socket.open("127.0.0.1", "0").unwrap();
		let fd = socket.fd();
		socket.open("127.0.0.1", "0").unwrap();
		assert_eq!(socket.fd(), fd);
	}

	#[test]
	fn failed_open_leaves_socket_closed() {
		let mut socket = Socket::new("scratch", Kind::Stream, Family::Unix, Role::Server);
		let long = "/tmp/".to_owned() + &"p".repeat(200);
		assert!(socket.open(&long, "").is_err());
		assert!(!socket.is_open());
		assert_eq!(socket.target(), Some((long.as_str(), "")));
	}

	#[test]
	fn ipv6_literal_upgrades_family() {
		let mut socket = Socket::new("scratch", Kind::Datagram, Family::Ipv4, Role::Client);
		socket.open("::1", "9").unwrap();
		assert_eq!(socket.family(), Family::Ipv6);
	}

	#[test]
	fn listen_requires_open_socket() {
		let mut socket = Socket::new("scratch", Kind::Stream, Family::Ipv4, Role::Server);
		let err = socket.listen().unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
		assert!(!socket.is_listening());
	}

	#[test]
	fn begin_connect_to_unix_listener_completes_at_once() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("quick.sock");
		let path = path.to_str().unwrap();
		let mut server = Socket::new("server", Kind::Stream, Family::Unix, Role::Server);
		server.open(path, "").unwrap();
		server.bind().unwrap();
		server.listen().unwrap();

		let mut client = Socket::new("client", Kind::Stream, Family::Unix, Role::Client);
		client.open(path, "").unwrap();
		assert!(client.begin_connect().unwrap());
		assert!(client.is_connected());
		assert!(!client.is_connecting());
		assert!(client.primary_connection().is_some());
	}

	#[test]
	fn refused_pending_connect_fails_on_completion() {
		let mut reserved = Socket::new("reserved", Kind::Stream, Family::Ipv4, Role::Server);
		reserved.open("127.0.0.1", "0").unwrap();
		reserved.bind().unwrap();
		let port = reserved.local_addr().unwrap().port().unwrap().to_string();

		let mut client = Socket::new("client", Kind::Stream, Family::Ipv4, Role::Client);
		client.open("127.0.0.1", &port).unwrap();
		let refused = match client.begin_connect() {
			Ok(true) => panic!("connected to a port nobody listens on"),
			Ok(false) => {
				assert!(client.is_connecting());
				let fd = client.fd().unwrap();
				stream::wait_ready(fd, libc::POLLOUT, std::time::Duration::from_secs(2)).unwrap();
				client.complete_connect().unwrap_err()
			}
			Err(e) => e,
		};
		assert_eq!(refused.kind(), std::io::ErrorKind::ConnectionRefused);
		assert!(!client.is_connecting());
		assert!(!client.is_connected());
		assert!(client.is_open());
	}

	#[test]
	fn bind_conflict_closes_socket() {
		let mut first = Socket::new("first", Kind::Stream, Family::Ipv4, Role::Server);
		first.open("127.0.0.1", "0").unwrap();
		first.bind().unwrap();
		first.listen().unwrap();
		let port = first.local_addr().unwrap().port().unwrap().to_string();

		let mut second = Socket::new("second", Kind::Stream, Family::Ipv4, Role::Server)
			.with_options(SocketOptions::new().reuse(super::super::ReuseConfig::new().addr(false)));
		second.open("127.0.0.1", &port).unwrap();
		let err = second.bind().unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
		assert!(!second.is_open());
	}
}
