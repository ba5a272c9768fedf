use std::fmt;
use crate::addr::ToSockAddr;

/// IPv6 socket address (IP + port + scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddrV6 {
	ip: [u8; 16],
	port: u16,
	/// Scope ID for link-local addresses (identifies network interface).
	/// Usually 0 unless using link-local addresses like fe80::.
	scope_id: u32,
}

impl SocketAddrV6 {
	/// Creates a new IPv6 address.
	pub fn new(ip: [u8; 16], port: u16) -> Self {
		Self { ip, port, scope_id: 0 }
	}

	/// Creates with explicit scope ID.
	///
	/// Use for link-local addresses (fe80::) where you need to specify the interface.
	pub fn with_scope(ip: [u8; 16], port: u16, scope_id: u32) -> Self {
		Self { ip, port, scope_id }
	}

	/// Wildcard address (`::`) for binding on every interface.
	pub fn any(port: u16) -> Self {
		Self::new([0; 16], port)
	}

	/// IPv4-mapped address (`::ffff:a.b.c.d`), used when an IPv4 literal
	/// targets an IPv6 socket.
	pub fn v4_mapped(v4: [u8; 4], port: u16) -> Self {
		let mut ip = [0u8; 16];
		ip[10] = 0xff;
		ip[11] = 0xff;
		ip[12..].copy_from_slice(&v4);
		Self::new(ip, port)
	}

	/// Returns the embedded IPv4 address if this is an IPv4-mapped address.
	pub fn to_ipv4_mapped(&self) -> Option<[u8; 4]> {
		std::net::Ipv6Addr::from(self.ip).to_ipv4_mapped().map(|v4| v4.octets())
	}

	/// Returns the IP bytes.
	pub fn ip(&self) -> [u8; 16] {
		self.ip
	}

	/// Returns the port.
	pub fn port(&self) -> u16 {
		self.port
	}

	/// Returns the scope ID.
	pub fn scope_id(&self) -> u32 {
		self.scope_id
	}

	pub fn is_multicast(&self) -> bool {
		self.ip[0] == 0xff
	}

	/// Converts to the raw sockaddr_in6 for syscalls.
	pub(crate) fn to_raw(&self) -> libc::sockaddr_in6 {
		let mut raw: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
		raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
		raw.sin6_port = self.port.to_be();
		raw.sin6_addr = libc::in6_addr { s6_addr: self.ip };
		raw.sin6_scope_id = self.scope_id;
		raw
	}

	/// Creates from raw sockaddr_in6.
	pub(crate) fn from_raw(raw: &libc::sockaddr_in6) -> Self {
		Self {
			ip: raw.sin6_addr.s6_addr,
			port: u16::from_be(raw.sin6_port),
			scope_id: raw.sin6_scope_id,
		}
	}
}

impl From<std::net::SocketAddrV6> for SocketAddrV6 {
	fn from(addr: std::net::SocketAddrV6) -> Self {
		Self::with_scope(addr.ip().octets(), addr.port(), addr.scope_id())
	}
}

impl fmt::Display for SocketAddrV6 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let ip = std::net::Ipv6Addr::from(self.ip);
		if self.scope_id != 0 {
			write!(f, "[{}%{}]:{}", ip, self.scope_id, self.port)
		} else {
			write!(f, "[{}]:{}", ip, self.port)
		}
	}
}

impl ToSockAddr for SocketAddrV6 {
	fn with_raw<F, R>(&self, f: F) -> Option<R>
	where
		F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
	{
		let raw = self.to_raw();
		let ptr = &raw as *const _ as *const libc::sockaddr;
		let len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
		Some(f(ptr, len))
	}
}
