//! Host/service resolution.
//!
//! IP literals and wildcard binds never reach the system resolver; everything
//! else goes through `getaddrinfo`. Failures carry the resolver's `EAI_*` code.

use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{Family, SockAddr, SocketAddrV4, SocketAddrV6, UnixAddr};
use super::unix::SUN_PATH_MAX;
use crate::error::ResolveError;
use crate::socket::Kind;

/// Hosts that mean "every interface" when binding.
const WILDCARD_HOSTS: [&str; 5] = ["", "*", "any", "0.0.0.0", "::"];

/// A resolved endpoint address.
///
/// Immutable once built; re-resolution produces a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
	family: Family,
	kind: Kind,
	host: String,
	service: String,
	resolved: Vec<SockAddr>,
}

impl Address {
	pub fn family(&self) -> Family {
		self.family
	}

	pub fn kind(&self) -> Kind {
		self.kind
	}

	/// Host (or UNIX path) as given by the caller.
	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn service(&self) -> &str {
		&self.service
	}

	/// First resolved address. Never empty for a successfully built Address.
	pub fn primary(&self) -> &SockAddr {
		&self.resolved[0]
	}

	pub fn all(&self) -> &[SockAddr] {
		&self.resolved
	}
}

/// Resolution strategy for one address family.
pub trait Resolve: Send + Sync {
	fn family(&self) -> Family;

	/// Resolves `host`/`service` to one or more addresses of this family.
	///
	/// `passive` is true for addresses that will be bound rather than connected.
	fn resolve(&self, host: &str, service: &str, kind: Kind, passive: bool) -> Result<Vec<SockAddr>, ResolveError>;
}

/// IPv4 or IPv6 resolution.
#[derive(Debug, Clone, Copy)]
pub struct InetResolver {
	family: Family,
}

impl InetResolver {
	pub fn ipv4() -> Self {
		Self { family: Family::Ipv4 }
	}

	pub fn ipv6() -> Self {
		Self { family: Family::Ipv6 }
	}

	fn any(&self, port: u16) -> SockAddr {
		match self.family {
			Family::Ipv6 => SockAddr::V6(SocketAddrV6::any(port)),
			_ => SockAddr::V4(SocketAddrV4::any(port)),
		}
	}

	fn loopback(&self, port: u16) -> SockAddr {
		match self.family {
			Family::Ipv6 => SockAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST.octets(), port)),
			_ => SockAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST.octets(), port)),
		}
	}

	/// Places a literal IP in this resolver's family.
	fn literal(&self, ip: IpAddr, port: u16) -> Option<SockAddr> {
		match (self.family, ip) {
			(Family::Ipv4, IpAddr::V4(v4)) => Some(SockAddr::V4(SocketAddrV4::new(v4.octets(), port))),
			(Family::Ipv6, IpAddr::V4(v4)) => Some(SockAddr::V6(SocketAddrV6::v4_mapped(v4.octets(), port))),
			(Family::Ipv6, IpAddr::V6(v6)) => Some(SockAddr::V6(SocketAddrV6::new(v6.octets(), port))),
			_ => None,
		}
	}

	/// Port for `service`: numeric strings directly, names via the services database.
	fn port(&self, service: &str, kind: Kind) -> Result<u16, ResolveError> {
		if service.is_empty() {
			return Ok(0);
		}
		if let Ok(port) = service.parse::<u16>() {
			return Ok(port);
		}
		let found = getaddrinfo(None, service, self.family, kind, libc::AI_PASSIVE)?;
		found
			.first()
			.and_then(SockAddr::port)
			.ok_or_else(|| ResolveError::NoAddress {
				host: String::new(),
				service: service.to_owned(),
				family: self.family,
			})
	}
}

impl Resolve for InetResolver {
	fn family(&self) -> Family {
		self.family
	}

	fn resolve(&self, host: &str, service: &str, kind: Kind, passive: bool) -> Result<Vec<SockAddr>, ResolveError> {
		let host = host.trim_start_matches('[').trim_end_matches(']');

		if WILDCARD_HOSTS.contains(&host) {
			let port = self.port(service, kind)?;
			let addr = if passive { self.any(port) } else { self.loopback(port) };
			return Ok(vec![addr]);
		}

		if let Ok(ip) = host.parse::<IpAddr>() {
			let port = self.port(service, kind)?;
			return self
				.literal(ip, port)
				.map(|addr| vec![addr])
				.ok_or_else(|| ResolveError::NoAddress {
					host: host.to_owned(),
					service: service.to_owned(),
					family: self.family,
				});
		}

		let flags = match self.family {
			Family::Ipv6 => libc::AI_V4MAPPED,
			_ => 0,
		};
		let flags = if passive { flags | libc::AI_PASSIVE } else { flags };
		let service = if service.is_empty() { "0" } else { service };
		let found = getaddrinfo(Some(host), service, self.family, kind, flags)?;
		if found.is_empty() {
			return Err(ResolveError::NoAddress {
				host: host.to_owned(),
				service: service.to_owned(),
				family: self.family,
			});
		}
		Ok(found)
	}
}

/// UNIX path resolution. A leading `@` selects an abstract address.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixResolver;

impl Resolve for UnixResolver {
	fn family(&self) -> Family {
		Family::Unix
	}

	fn resolve(&self, host: &str, service: &str, _kind: Kind, _passive: bool) -> Result<Vec<SockAddr>, ResolveError> {
		if host.is_empty() {
			return Err(ResolveError::NoAddress {
				host: String::new(),
				service: service.to_owned(),
				family: Family::Unix,
			});
		}
		let max = SUN_PATH_MAX - 1;
		let addr = match host.strip_prefix('@') {
			Some(name) => {
				if name.len() > max {
					return Err(ResolveError::PathTooLong { len: name.len(), max });
				}
				UnixAddr::abstract_socket(name)
			}
			None => {
				if host.len() > max {
					return Err(ResolveError::PathTooLong { len: host.len(), max });
				}
				UnixAddr::new(host)
			}
		};
		Ok(vec![SockAddr::Unix(addr)])
	}
}

/// Returns the resolution strategy for `family`.
pub fn resolver_for(family: Family) -> Box<dyn Resolve> {
	match family {
		Family::Ipv4 => Box::new(InetResolver::ipv4()),
		Family::Ipv6 => Box::new(InetResolver::ipv6()),
		Family::Unix => Box::new(UnixResolver),
	}
}

/// Resolves `host`/`service` into an [`Address`] of the given family.
pub fn resolve(host: &str, service: &str, family: Family, kind: Kind, passive: bool) -> Result<Address, ResolveError> {
	let resolved = resolver_for(family).resolve(host, service, kind, passive)?;
	tracing::trace!(host, service, %family, count = resolved.len(), "resolved");
	Ok(Address {
		family,
		kind,
		host: host.to_owned(),
		service: service.to_owned(),
		resolved,
	})
}

/// Thin wrapper over `getaddrinfo`/`freeaddrinfo`.
fn getaddrinfo(host: Option<&str>, service: &str, family: Family, kind: Kind, flags: libc::c_int) -> Result<Vec<SockAddr>, ResolveError> {
	let c_host = host.map(CString::new).transpose().map_err(|_| ResolveError::Nul)?;
	let c_service = CString::new(service).map_err(|_| ResolveError::Nul)?;

	let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
	hints.ai_family = family.raw();
	hints.ai_socktype = kind.raw();
	hints.ai_flags = flags;

	let mut list: *mut libc::addrinfo = std::ptr::null_mut();
	let code = unsafe {
		libc::getaddrinfo(
			c_host.as_ref().map_or(std::ptr::null(), |h| h.as_ptr()),
			c_service.as_ptr(),
			&hints,
			&mut list,
		)
	};
	if code != 0 {
		return Err(ResolveError::Lookup {
			host: host.unwrap_or_default().to_owned(),
			service: service.to_owned(),
			code,
		});
	}

	let mut found = Vec::new();
	let mut cursor = list;
	while !cursor.is_null() {
		let entry = unsafe { &*cursor };
		if let Some(addr) = unsafe { SockAddr::from_storage(entry.ai_addr, entry.ai_addrlen) } {
			if addr.family() == family && !found.contains(&addr) {
				found.push(addr);
			}
		}
		cursor = entry.ai_next;
	}
	unsafe { libc::freeaddrinfo(list) };
	Ok(found)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wildcard_bind_never_queries_names() {
		let v4 = resolve("", "8080", Family::Ipv4, Kind::Stream, true).unwrap();
		assert_eq!(v4.primary(), &SockAddr::V4(SocketAddrV4::any(8080)));
		let v6 = resolve("*", "8080", Family::Ipv6, Kind::Stream, true).unwrap();
		assert_eq!(v6.primary(), &SockAddr::V6(SocketAddrV6::any(8080)));
	}

	#[test]
	fn literal_family_mapping() {
		let mapped = resolve("127.0.0.1", "80", Family::Ipv6, Kind::Stream, false).unwrap();
		assert_eq!(mapped.primary(), &SockAddr::V6(SocketAddrV6::v4_mapped([127, 0, 0, 1], 80)));

		let err = resolve("::1", "80", Family::Ipv4, Kind::Stream, false).unwrap_err();
		assert!(matches!(err, ResolveError::NoAddress { .. }));
		assert_eq!(err.code(), libc::EAI_NONAME);
	}

	#[test]
	fn bracketed_ipv6_literal() {
		let addr = resolve("[::1]", "443", Family::Ipv6, Kind::Stream, false).unwrap();
		assert_eq!(addr.primary().port(), Some(443));
		assert_eq!(addr.primary().host_string(), "::1");
	}

	#[test]
	fn unix_paths() {
		let addr = resolve("@media", "", Family::Unix, Kind::Stream, true).unwrap();
		assert_eq!(addr.primary(), &SockAddr::Unix(UnixAddr::abstract_socket("media")));

		let long = "/tmp/".to_owned() + &"s".repeat(SUN_PATH_MAX);
		let err = resolve(&long, "", Family::Unix, Kind::Stream, true).unwrap_err();
		assert!(matches!(err, ResolveError::PathTooLong { .. }));
	}

	#[test]
	fn unknown_host_reports_resolver_code() {
		let err = resolve("no-such-host.invalid", "80", Family::Ipv4, Kind::Stream, false).unwrap_err();
		assert_ne!(err.code(), 0);
		assert!(!matches!(err, ResolveError::PathTooLong { .. }));
	}
}
