use std::io;
use std::sync::Arc;

use tracing::{info, warn};

use crate::addr::Family;
use crate::socket::{Accepted, ConnectionId, Kind, Received, Role, Socket, SocketOptions, State};
use crate::tls::TlsContext;
use super::{admits, Endpoint};

/// resolve → open → bind → (keep-alive) → listen.
pub(super) fn open_listener(socket: &mut Socket, host: &str, service: &str) -> io::Result<()> {
	socket.open(host, service)?;
	socket.bind()?;
	socket.listen()
}

/// resolve → open → connect. A failed connect is logged and left to the
/// reconnect supervisor; only resolution and descriptor errors fail.
pub(super) fn open_connector(socket: &mut Socket, host: &str, service: &str) -> io::Result<()> {
	socket.open(host, service)?;
	if let Err(e) = socket.connect() {
		warn!(socket = socket.name(), host, service, error = %e, "connect failed, will retry");
	}
	Ok(())
}

/// Accepts the next admitted peer without blocking.
///
/// Peers refused by the allow-list are closed on the spot.
pub(super) fn accept_admitted(socket: &mut Socket) -> io::Result<Option<ConnectionId>> {
	loop {
		match socket.accept(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)? {
			Accepted::WouldBlock => return Ok(None),
			Accepted::Connection(raw, peer) => {
				if !admits(socket, &peer) {
					info!(socket = socket.name(), remote = %peer.host_string(), "peer rejected by allow-list");
					continue;
				}
				let id = socket.adopt(raw, peer)?;
				if let Some(conn) = socket.connection_mut(id) {
					conn.state_mut().insert(State::ESTABLISHED);
				}
				return Ok(Some(id));
			}
		}
	}
}

/// TCP server.
#[derive(Debug)]
pub struct Server {
	socket: Socket,
}

impl Server {
	pub fn new(name: impl Into<String>) -> Self {
		Self::with_family(name, Family::Ipv4)
	}

	pub fn with_family(name: impl Into<String>, family: Family) -> Self {
		Self { socket: Socket::new(name, Kind::Stream, family, Role::Server) }
	}

	pub fn with_options(mut self, options: SocketOptions) -> Self {
		self.socket = self.socket.with_options(options);
		self
	}

	/// Accepts one peer outside the reactor.
	pub fn accept(&mut self) -> io::Result<Option<ConnectionId>> {
		accept_admitted(&mut self.socket)
	}

	pub fn send(&mut self, conn: ConnectionId, buf: &[u8]) -> io::Result<usize> {
		self.socket.send(conn, buf)
	}

	pub fn receive(&mut self, conn: ConnectionId, buf: &mut [u8]) -> io::Result<Received> {
		self.socket.receive(conn, buf)
	}
}

impl Endpoint for Server {
	fn socket(&self) -> &Socket {
		&self.socket
	}

	fn socket_mut(&mut self) -> &mut Socket {
		&mut self.socket
	}

	fn open_at(&mut self, host: &str, service: &str) -> io::Result<()> {
		open_listener(&mut self.socket, host, service)
	}
}

/// TCP client.
#[derive(Debug)]
pub struct Client {
	socket: Socket,
}

impl Client {
	pub fn new(name: impl Into<String>) -> Self {
		Self::with_family(name, Family::Ipv4)
	}

	pub fn with_family(name: impl Into<String>, family: Family) -> Self {
		Self { socket: Socket::new(name, Kind::Stream, family, Role::Client) }
	}

	pub fn with_options(mut self, options: SocketOptions) -> Self {
		self.socket = self.socket.with_options(options);
		self
	}

	/// Sends on the established connection.
	pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
		let conn = client_connection(&self.socket)?;
		self.socket.send(conn, buf)
	}

	pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<Received> {
		let conn = client_connection(&self.socket)?;
		self.socket.receive(conn, buf)
	}
}

pub(super) fn client_connection(socket: &Socket) -> io::Result<ConnectionId> {
	socket
		.primary_connection()
		.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, format!("{} is not connected", socket.name())))
}

impl Endpoint for Client {
	fn socket(&self) -> &Socket {
		&self.socket
	}

	fn socket_mut(&mut self) -> &mut Socket {
		&mut self.socket
	}

	fn open_at(&mut self, host: &str, service: &str) -> io::Result<()> {
		open_connector(&mut self.socket, host, service)
	}
}

/// TCP server whose connections are TLS-wrapped.
///
/// The handshake runs on the reactor after accept; only negotiated
/// connections reach the data callback.
#[derive(Debug)]
pub struct TlsServer {
	socket: Socket,
}

impl TlsServer {
	pub fn new(name: impl Into<String>, tls: Arc<TlsContext>) -> Self {
		Self::with_family(name, Family::Ipv4, tls)
	}

	pub fn with_family(name: impl Into<String>, family: Family, tls: Arc<TlsContext>) -> Self {
		Self { socket: Socket::new(name, Kind::Stream, family, Role::Server).with_tls(tls) }
	}

	pub fn with_options(mut self, options: SocketOptions) -> Self {
		self.socket = self.socket.with_options(options);
		self
	}
}

impl Endpoint for TlsServer {
	fn socket(&self) -> &Socket {
		&self.socket
	}

	fn socket_mut(&mut self) -> &mut Socket {
		&mut self.socket
	}

	fn open_at(&mut self, host: &str, service: &str) -> io::Result<()> {
		open_listener(&mut self.socket, host, service)
	}
}

/// TCP client that negotiates TLS right after connecting.
#[derive(Debug)]
pub struct TlsClient {
	socket: Socket,
}

impl TlsClient {
	pub fn new(name: impl Into<String>, tls: Arc<TlsContext>) -> Self {
		Self::with_family(name, Family::Ipv4, tls)
	}

	pub fn with_family(name: impl Into<String>, family: Family, tls: Arc<TlsContext>) -> Self {
		Self { socket: Socket::new(name, Kind::Stream, family, Role::Client).with_tls(tls) }
	}

	pub fn with_options(mut self, options: SocketOptions) -> Self {
		self.socket = self.socket.with_options(options);
		self
	}
}

impl Endpoint for TlsClient {
	fn socket(&self) -> &Socket {
		&self.socket
	}

	fn socket_mut(&mut self) -> &mut Socket {
		&mut self.socket
	}

	fn open_at(&mut self, host: &str, service: &str) -> io::Result<()> {
		open_connector(&mut self.socket, host, service)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unreachable_client_opens_without_connecting() {
		// Reserve a port that refuses connections.
		let mut reserved = Socket::new("reserved", Kind::Stream, Family::Ipv4, Role::Server);
		reserved.open("127.0.0.1", "0").unwrap();
		reserved.bind().unwrap();
		let port = reserved.local_addr().unwrap().port().unwrap().to_string();

		let mut client = Client::new("scratch");
		client.open_at("127.0.0.1", &port).unwrap();
		assert!(client.socket().is_open());
		assert!(!client.socket().is_connected());
		assert_eq!(client.send(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
	}

	#[test]
	fn unresolvable_client_fails_open() {
		let mut client = Client::new("scratch");
		assert!(client.open_at("no-such-host.invalid", "80").is_err());
		assert!(!client.socket().is_open());
	}

	#[test]
	fn server_accepts_outside_reactor() {
		let mut server = Server::new("srv");
		server.open_at("127.0.0.1", "0").unwrap();
		let port = server.socket().local_addr().unwrap().port().unwrap().to_string();
		assert_eq!(server.accept().unwrap(), None);

		let mut client = Client::new("cli");
		client.open_at("127.0.0.1", &port).unwrap();
		assert!(client.socket().is_connected());

		let mut accepted = None;
		for _ in 0..100 {
			accepted = server.accept().unwrap();
			if accepted.is_some() {
				break;
			}
			std::thread::sleep(std::time::Duration::from_millis(10));
		}
		let conn = accepted.unwrap();
		assert_eq!(server.socket().connection(conn).unwrap().remote(), "127.0.0.1");
	}
}
