use std::io;

use crate::addr::Family;
use crate::socket::{ConnectionId, Kind, Received, Role, Socket, SocketOptions};
use super::tcp::{accept_admitted, client_connection, open_connector, open_listener};
use super::Endpoint;

/// UNIX stream server. The host is a filesystem path, or `@name` for an
/// abstract address; the service is ignored.
#[derive(Debug)]
pub struct UnixServer {
	socket: Socket,
}

impl UnixServer {
	pub fn new(name: impl Into<String>) -> Self {
		Self { socket: Socket::new(name, Kind::Stream, Family::Unix, Role::Server) }
	}

	pub fn with_options(mut self, options: SocketOptions) -> Self {
		self.socket = self.socket.with_options(options);
		self
	}

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

impl Endpoint for UnixServer {
	fn socket(&self) -> &Socket {
		&self.socket
	}

	fn socket_mut(&mut self) -> &mut Socket {
		&mut self.socket
	}

	fn open_at(&mut self, path: &str, _service: &str) -> io::Result<()> {
		open_listener(&mut self.socket, path, "")
	}
}

/// UNIX stream client.
#[derive(Debug)]
pub struct UnixClient {
	socket: Socket,
}

impl UnixClient {
	pub fn new(name: impl Into<String>) -> Self {
		Self { socket: Socket::new(name, Kind::Stream, Family::Unix, Role::Client) }
	}

	pub fn with_options(mut self, options: SocketOptions) -> Self {
		self.socket = self.socket.with_options(options);
		self
	}

	pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
		let conn = client_connection(&self.socket)?;
		self.socket.send(conn, buf)
	}

	pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<Received> {
		let conn = client_connection(&self.socket)?;
		self.socket.receive(conn, buf)
	}
}

impl Endpoint for UnixClient {
	fn socket(&self) -> &Socket {
		&self.socket
	}

	fn socket_mut(&mut self) -> &mut Socket {
		&mut self.socket
	}

	fn open_at(&mut self, path: &str, _service: &str) -> io::Result<()> {
		open_connector(&mut self.socket, path, "")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn stream_over_socket_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("ctl.sock");
		let path = path.to_str().unwrap();

		let mut server = UnixServer::new("ctl");
		server.open_at(path, "").unwrap();
		assert!(server.socket().is_listening());

		let mut client = UnixClient::new("ctl-client");
		client.open_at(path, "").unwrap();
		assert!(client.socket().is_connected());
		client.send(b"status").unwrap();

		let mut conn = None;
		for _ in 0..100 {
			conn = server.accept().unwrap();
			if conn.is_some() {
				break;
			}
			std::thread::sleep(Duration::from_millis(10));
		}
		let conn = conn.unwrap();

		let mut buf = [0u8; 16];
		let mut got = Vec::new();
		for _ in 0..100 {
			if let Received::Data(n) = server.receive(conn, &mut buf).unwrap() {
				got.extend_from_slice(&buf[..n]);
			}
			if got.len() == 6 {
				break;
			}
			std::thread::sleep(Duration::from_millis(10));
		}
		assert_eq!(got, b"status");

		server.close();
		assert!(!std::path::Path::new(path).exists());
	}

	#[test]
	fn missing_path_client_stays_unconnected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("absent.sock");

		let mut client = UnixClient::new("ctl-client");
		client.open_at(path.to_str().unwrap(), "").unwrap();
		assert!(client.socket().is_open());
		assert!(!client.socket().is_connected());
	}
}
