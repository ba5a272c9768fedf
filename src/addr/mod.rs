//! Address families, socket addresses and name resolution.
//!
//! Three families are supported:
//! - `Ipv4`: Internet Protocol version 4
//! - `Ipv6`: Internet Protocol version 6 (optionally dual-stack)
//! - `Unix`: Unix domain sockets (local only)

mod ipv4;
mod ipv6;
mod unix;
pub mod resolve;

pub use self::ipv4::SocketAddrV4;
pub use self::ipv6::SocketAddrV6;
pub use self::unix::UnixAddr;
pub use self::resolve::{resolve, resolver_for, Address, InetResolver, Resolve, UnixResolver};

use std::fmt;

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
	Ipv4,
	Ipv6,
	Unix,
}

impl Family {
	/// Returns the libc constant for this address family.
	#[inline]
	pub fn raw(self) -> libc::c_int {
		match self {
			Family::Ipv4 => libc::AF_INET,
			Family::Ipv6 => libc::AF_INET6,
			Family::Unix => libc::AF_UNIX,
		}
	}

	pub fn from_raw(raw: libc::c_int) -> Option<Self> {
		match raw {
			libc::AF_INET => Some(Family::Ipv4),
			libc::AF_INET6 => Some(Family::Ipv6),
			libc::AF_UNIX => Some(Family::Unix),
			_ => None,
		}
	}

	pub fn is_inet(self) -> bool {
		self != Family::Unix
	}
}

impl fmt::Display for Family {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Family::Ipv4 => "ipv4",
			Family::Ipv6 => "ipv6",
			Family::Unix => "unix",
		})
	}
}

/// Trait for address types that can be converted to raw sockaddr for syscalls.
pub trait ToSockAddr {
	/// Calls the provided closure with a pointer to the raw sockaddr and its size.
	/// Returns None if the address is invalid (e.g., path too long for Unix).
	fn with_raw<F, R>(&self, f: F) -> Option<R>
	where
		F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> R;
}

/// Trait for address types that can be created from raw sockaddr.
pub trait FromSockAddr: Sized {
	/// Creates address from raw sockaddr storage.
	///
	/// # Safety
	/// `addr` must point to at least `len` readable bytes.
	unsafe fn from_sockaddr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self>;
}

impl FromSockAddr for SocketAddrV4 {
	unsafe fn from_sockaddr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self> {
		if len < std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t {
			return None;
		}
		let raw = unsafe { &*(addr as *const libc::sockaddr_in) };
		Some(Self::from_raw(raw))
	}
}

impl FromSockAddr for SocketAddrV6 {
	unsafe fn from_sockaddr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self> {
		if len < std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t {
			return None;
		}
		let raw = unsafe { &*(addr as *const libc::sockaddr_in6) };
		Some(Self::from_raw(raw))
	}
}

impl FromSockAddr for UnixAddr {
	unsafe fn from_sockaddr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self> {
		let offset = std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t;
		if len < offset {
			return None;
		}
		if len == offset {
			// Unnamed socket: the peer side of most accepted UNIX connections.
			return Some(UnixAddr::unnamed());
		}
		let raw = unsafe { &*(addr as *const libc::sockaddr_un) };
		Some(Self::from_raw(raw, (len - offset) as usize))
	}
}

/// A resolved socket address of any supported family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockAddr {
	V4(SocketAddrV4),
	V6(SocketAddrV6),
	Unix(UnixAddr),
}

impl SockAddr {
	pub fn family(&self) -> Family {
		match self {
			SockAddr::V4(_) => Family::Ipv4,
			SockAddr::V6(_) => Family::Ipv6,
			SockAddr::Unix(_) => Family::Unix,
		}
	}

	/// Returns the port, or None for Unix addresses.
	pub fn port(&self) -> Option<u16> {
		match self {
			SockAddr::V4(a) => Some(a.port()),
			SockAddr::V6(a) => Some(a.port()),
			SockAddr::Unix(_) => None,
		}
	}

	/// The remote address string used for logging and acceptance checks.
	///
	/// IP addresses render without port; IPv4-mapped IPv6 peers render as
	/// dotted quads so one allow-list entry covers dual-stack sockets.
	pub fn host_string(&self) -> String {
		match self {
			SockAddr::V4(a) => std::net::Ipv4Addr::from(a.ip()).to_string(),
			SockAddr::V6(a) => match a.to_ipv4_mapped() {
				Some(v4) => std::net::Ipv4Addr::from(v4).to_string(),
				None => std::net::Ipv6Addr::from(a.ip()).to_string(),
			},
			SockAddr::Unix(a) => a.to_string(),
		}
	}

	/// True if both addresses name the same host, ignoring ports.
	pub fn same_host(&self, other: &SockAddr) -> bool {
		self.host_string() == other.host_string()
	}

	/// Decodes a kernel-filled `sockaddr_storage`.
	///
	/// # Safety
	/// `addr` must point to at least `len` readable bytes.
	pub unsafe fn from_storage(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self> {
		if addr.is_null() || len < std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t {
			return None;
		}
		let family = unsafe { (*addr).sa_family } as libc::c_int;
		unsafe {
			match family {
				libc::AF_INET => SocketAddrV4::from_sockaddr(addr, len).map(SockAddr::V4),
				libc::AF_INET6 => SocketAddrV6::from_sockaddr(addr, len).map(SockAddr::V6),
				libc::AF_UNIX => UnixAddr::from_sockaddr(addr, len).map(SockAddr::Unix),
				_ => None,
			}
		}
	}
}

impl ToSockAddr for SockAddr {
	fn with_raw<F, R>(&self, f: F) -> Option<R>
	where
		F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> R,
	{
		match self {
			SockAddr::V4(a) => a.with_raw(f),
			SockAddr::V6(a) => a.with_raw(f),
			SockAddr::Unix(a) => a.with_raw(f),
		}
	}
}

impl fmt::Display for SockAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SockAddr::V4(a) => a.fmt(f),
			SockAddr::V6(a) => a.fmt(f),
			SockAddr::Unix(a) => a.fmt(f),
		}
	}
}

impl From<std::net::SocketAddr> for SockAddr {
	fn from(addr: std::net::SocketAddr) -> Self {
		match addr {
			std::net::SocketAddr::V4(a) => SockAddr::V4(a.into()),
			std::net::SocketAddr::V6(a) => SockAddr::V6(a.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn storage_roundtrip_keeps_family_and_port() {
		let addr = SockAddr::V6(SocketAddrV6::new(std::net::Ipv6Addr::LOCALHOST.octets(), 8443));
		let decoded = addr
			.with_raw(|ptr, len| unsafe { SockAddr::from_storage(ptr, len) })
			.flatten()
			.unwrap();
		assert_eq!(decoded, addr);
		assert_eq!(decoded.family(), Family::Ipv6);
		assert_eq!(decoded.port(), Some(8443));
	}

	#[test]
	fn mapped_peer_renders_as_ipv4() {
		let mapped = SocketAddrV6::v4_mapped([192, 168, 1, 20], 5000);
		assert_eq!(SockAddr::V6(mapped).host_string(), "192.168.1.20");
		let plain = SockAddr::V4(SocketAddrV4::new([192, 168, 1, 20], 80));
		assert!(plain.same_host(&SockAddr::V6(mapped)));
	}

	#[test]
	fn family_constants() {
		assert_eq!(Family::from_raw(Family::Ipv6.raw()), Some(Family::Ipv6));
		assert!(!Family::Unix.is_inet());
		assert_eq!(Family::Ipv4.to_string(), "ipv4");
	}
}
