use std::io;

use tracing::{debug, info};

use crate::addr::{Family, SockAddr, SocketAddrV4, SocketAddrV6};
use crate::error::SocketError;
use crate::socket::{
	join_multicast, set_multicast_loop, set_multicast_ttl, Kind, Received, ReuseConfig, Role, Socket, SocketOptions,
};
use super::tcp::client_connection;
use super::Endpoint;

fn resolved_peer(socket: &Socket) -> io::Result<SockAddr> {
	socket
		.address()
		.map(|address| address.primary().clone())
		.ok_or_else(|| SocketError::NotOpen { name: socket.name().to_owned() }.into())
}

/// UDP socket, either bound (server) or aimed at one peer (client).
///
/// Both roles carry a single connection on the socket's own descriptor so
/// the reactor dispatches datagrams the same way it dispatches streams.
#[derive(Debug)]
pub struct Udp {
	socket: Socket,
}

impl Udp {
	/// Bound socket receiving from anyone.
	pub fn server(name: impl Into<String>) -> Self {
		Self::with_family(name, Family::Ipv4, Role::Server)
	}

	/// Socket whose `send` goes to the opened host and service.
	pub fn client(name: impl Into<String>) -> Self {
		Self::with_family(name, Family::Ipv4, Role::Client)
	}

	pub fn with_family(name: impl Into<String>, family: Family, role: Role) -> Self {
		Self { socket: Socket::new(name, Kind::Datagram, family, role) }
	}

	pub fn with_options(mut self, options: SocketOptions) -> Self {
		self.socket = self.socket.with_options(options);
		self
	}

	/// Sends one datagram to the client peer.
	pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
		let conn = client_connection(&self.socket)?;
		self.socket.send(conn, buf)
	}

	pub fn send_to(&mut self, buf: &[u8], addr: &SockAddr) -> io::Result<usize> {
		self.socket.send_to(buf, addr)
	}

	/// Receives on the socket's connection; a `unicast` client drops
	/// datagrams from hosts other than its peer.
	pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<Received> {
		let conn = client_connection(&self.socket)?;
		self.socket.receive(conn, buf)
	}

	pub fn receive_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SockAddr)>> {
		self.socket.receive_from(buf)
	}
}

impl Endpoint for Udp {
	fn socket(&self) -> &Socket {
		&self.socket
	}

	fn socket_mut(&mut self) -> &mut Socket {
		&mut self.socket
	}

	fn open_at(&mut self, host: &str, service: &str) -> io::Result<()> {
		self.socket.open(host, service)?;
		match self.socket.role() {
			Role::Server => {
				self.socket.bind()?;
				self.socket.attach(None)?;
			}
			Role::Client => {
				let peer = resolved_peer(&self.socket)?;
				self.socket.attach(Some(peer))?;
			}
		}
		Ok(())
	}
}

/// UDP socket joined to a multicast group.
///
/// Binds the group's port on the wildcard address with address and port
/// reuse, so several listeners on one host can share the group. `send`
/// goes to the group.
#[derive(Debug)]
pub struct Multicast {
	socket: Socket,
	loopback: bool,
}

impl Multicast {
	pub fn new(name: impl Into<String>) -> Self {
		Self::with_family(name, Family::Ipv4)
	}

	pub fn with_family(name: impl Into<String>, family: Family) -> Self {
		let options = SocketOptions::new().reuse(ReuseConfig::new().both());
		Self {
			socket: Socket::new(name, Kind::Datagram, family, Role::Client).with_options(options),
			loopback: true,
		}
	}

	pub fn with_options(mut self, options: SocketOptions) -> Self {
		self.socket = self.socket.with_options(options);
		self
	}

	/// Whether our own datagrams are looped back to local members.
	pub fn loopback(mut self, enable: bool) -> Self {
		self.loopback = enable;
		self
	}

	pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
		let conn = client_connection(&self.socket)?;
		self.socket.send(conn, buf)
	}

	pub fn receive_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SockAddr)>> {
		self.socket.receive_from(buf)
	}

	fn join(&mut self, group: &SockAddr) -> io::Result<()> {
		let port = group.port().unwrap_or(0);
		// IPv4 groups on an IPv6 socket arrive mapped and use the IPv4 options.
		let (local, v6) = match group {
			SockAddr::V4(addr) if addr.is_multicast() => (SockAddr::V4(SocketAddrV4::any(port)), false),
			SockAddr::V6(addr) if addr.is_multicast() => (SockAddr::V6(SocketAddrV6::any(port)), true),
			SockAddr::V6(addr) if addr.to_ipv4_mapped().is_some_and(|v4| SocketAddrV4::new(v4, 0).is_multicast()) => {
				(SockAddr::V6(SocketAddrV6::any(port)), false)
			}
			SockAddr::V4(_) | SockAddr::V6(_) => {
				return Err(SocketError::InvalidAddress { reason: "not a multicast group" }.into());
			}
			SockAddr::Unix(_) => return Err(SocketError::Unsupported { what: "multicast on a unix socket" }.into()),
		};
		self.socket.bind_to(&local)?;

		let Some(fd) = self.socket.fd() else {
			return Err(SocketError::NotOpen { name: self.socket.name().to_owned() }.into());
		};
		join_multicast(&fd, group)?;
		set_multicast_ttl(&fd, v6, self.socket.options().ttl)?;
		set_multicast_loop(&fd, v6, self.loopback)?;
		debug!(socket = self.socket.name(), %group, ttl = self.socket.options().ttl, "joined group");
		Ok(())
	}
}

impl Endpoint for Multicast {
	fn socket(&self) -> &Socket {
		&self.socket
	}

	fn socket_mut(&mut self) -> &mut Socket {
		&mut self.socket
	}

	fn open_at(&mut self, host: &str, service: &str) -> io::Result<()> {
		self.socket.open(host, service)?;
		let group = resolved_peer(&self.socket)?;
		if let Err(e) = self.join(&group) {
			self.socket.close();
			return Err(e);
		}
		self.socket.attach(Some(group.clone()))?;
		info!(socket = self.socket.name(), %group, "multicast member");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn receive_one(udp: &mut Udp, buf: &mut [u8]) -> (usize, SockAddr) {
		for _ in 0..100 {
			if let Some(got) = udp.receive_from(buf).unwrap() {
				return got;
			}
			std::thread::sleep(Duration::from_millis(10));
		}
		panic!("no datagram arrived");
	}

	#[test]
	fn client_sends_to_bound_server() {
		let mut server = Udp::server("udp-srv");
		server.open_at("127.0.0.1", "0").unwrap();
		assert!(server.socket().is_connected());
		let port = server.socket().local_addr().unwrap().port().unwrap().to_string();

		let mut client = Udp::client("udp-cli");
		client.open_at("127.0.0.1", &port).unwrap();
		assert_eq!(client.send(b"hello").unwrap(), 5);

		let mut buf = [0u8; 64];
		let (n, from) = receive_one(&mut server, &mut buf);
		assert_eq!(&buf[..n], b"hello");
		assert_eq!(from.host_string(), "127.0.0.1");
	}

	#[test]
	fn server_connection_is_attached() {
		let mut server = Udp::server("udp-srv");
		server.open_at("127.0.0.1", "0").unwrap();
		let conn = server.socket().primary_connection().unwrap();
		let conn = server.socket().connection(conn).unwrap();
		assert!(conn.is_attached());
		assert!(conn.peer().is_none());
	}

	#[test]
	fn unicast_client_drops_foreign_hosts() {
		let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		let port = peer.local_addr().unwrap().port().to_string();
		let mut client = Udp::client("udp-cli").with_options(SocketOptions::new().unicast(true));
		client.open_at("127.0.0.1", &port).unwrap();
		// The first send binds the ephemeral port.
		client.send(b"hello").unwrap();
		let local = client.socket().local_addr().unwrap();
		let target = format!("127.0.0.1:{}", local.port().unwrap());

		let Ok(foreign) = std::net::UdpSocket::bind("127.0.0.2:0") else {
			eprintln!("skipping: 127.0.0.2 is not available");
			return;
		};
		foreign.send_to(b"stranger", &target).unwrap();
		peer.send_to(b"friend", &target).unwrap();

		let mut buf = [0u8; 64];
		for _ in 0..100 {
			match client.receive(&mut buf).unwrap() {
				Received::Data(n) => {
					assert_eq!(&buf[..n], b"friend");
					return;
				}
				_ => std::thread::sleep(Duration::from_millis(10)),
			}
		}
		panic!("datagram from the peer never arrived");
	}

	/// Errno behind a failed multicast setup or send, when the host has no route for it.
	fn multicast_unavailable(err: &io::Error) -> bool {
		use crate::error::IoError;

		let errno = match err.get_ref() {
			Some(inner) => match (inner.downcast_ref::<SocketError>(), inner.downcast_ref::<IoError>()) {
				(Some(SocketError::SetOption { errno, .. }), _) => *errno,
				(_, Some(IoError::Write { errno })) => *errno,
				_ => return false,
			},
			None => return false,
		};
		matches!(errno, libc::ENODEV | libc::ENETUNREACH | libc::EADDRNOTAVAIL)
	}

	#[test]
	fn multicast_member_hears_its_own_datagram() {
		let port = std::net::UdpSocket::bind("0.0.0.0:0").unwrap().local_addr().unwrap().port().to_string();
		let mut member = Multicast::new("mcast").loopback(true);
		if let Err(e) = member.open_at("239.255.77.41", &port) {
			assert!(multicast_unavailable(&e), "join failed: {e}");
			eprintln!("skipping: {e}");
			return;
		}
		assert!(member.socket().is_connected());
		if let Err(e) = member.send(b"hello group") {
			assert!(multicast_unavailable(&e), "send failed: {e}");
			eprintln!("skipping: {e}");
			return;
		}

		let mut buf = [0u8; 64];
		for _ in 0..100 {
			if let Some((n, _)) = member.receive_from(&mut buf).unwrap() {
				assert_eq!(&buf[..n], b"hello group");
				return;
			}
			std::thread::sleep(Duration::from_millis(10));
		}
		panic!("looped-back datagram never arrived");
	}

	#[test]
	fn multicast_rejects_unicast_group() {
		let mut member = Multicast::new("mcast");
		assert!(member.open_at("127.0.0.1", "0").is_err());
		assert!(!member.socket().is_open());
	}
}
