use std::fmt;
use crate::addr::ToSockAddr;

/// IPv4 socket address (IP + port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddrV4 {
	ip: [u8; 4],
	port: u16,
}

impl SocketAddrV4 {
	/// Creates a new IPv4 address.
	pub fn new(ip: [u8; 4], port: u16) -> Self {
		Self { ip, port }
	}

	/// Wildcard address (`0.0.0.0`) for binding on every interface.
	pub fn any(port: u16) -> Self {
		Self { ip: [0; 4], port }
	}

	/// Creates from raw sockaddr_in.
	pub(crate) fn from_raw(raw: &libc::sockaddr_in) -> Self {
		Self {
			ip: raw.sin_addr.s_addr.to_ne_bytes(),
			port: u16::from_be(raw.sin_port),
		}
	}

	/// Returns the IP bytes.
	pub fn ip(&self) -> [u8; 4] {
		self.ip
	}

	/// Returns the port.
	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn is_multicast(&self) -> bool {
		(224..=239).contains(&self.ip[0])
	}

	/// Converts to the raw sockaddr_in for syscalls.
	pub(crate) fn to_raw(&self) -> libc::sockaddr_in {
		libc::sockaddr_in {
			sin_family: libc::AF_INET as libc::sa_family_t,
			sin_port: self.port.to_be(),
			sin_addr: libc::in_addr {
				s_addr: u32::from_be_bytes(self.ip).to_be(),
			},
			sin_zero: [0; 8],
		}
	}
}

impl From<std::net::SocketAddrV4> for SocketAddrV4 {
	fn from(addr: std::net::SocketAddrV4) -> Self {
		Self::new(addr.ip().octets(), addr.port())
	}
}

impl fmt::Display for SocketAddrV4 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", std::net::Ipv4Addr::from(self.ip), self.port)
	}
}

impl ToSockAddr for SocketAddrV4 {
	fn with_raw<F, R>(&self, f: F) -> Option<R>
	where
		F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
	{
		// sockaddr_in lives on this stack frame until the closure returns.
		let raw = self.to_raw();
		let ptr = &raw as *const _ as *const libc::sockaddr;
		let len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
		Some(f(ptr, len))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn raw_roundtrip_is_network_order() {
		let addr = SocketAddrV4::new([10, 0, 0, 7], 9443);
		let raw = addr.to_raw();
		assert_eq!(u16::from_be(raw.sin_port), 9443);
		assert_eq!(raw.sin_addr.s_addr.to_ne_bytes(), [10, 0, 0, 7]);
		assert_eq!(SocketAddrV4::from_raw(&raw), addr);
	}

	#[test]
	fn display_and_multicast() {
		assert_eq!(SocketAddrV4::new([239, 255, 255, 250], 1900).to_string(), "239.255.255.250:1900");
		assert!(SocketAddrV4::new([239, 255, 255, 250], 1900).is_multicast());
		assert!(!SocketAddrV4::any(80).is_multicast());
	}
}
