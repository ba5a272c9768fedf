use std::os::fd::AsRawFd;

use crate::addr::SockAddr;
use crate::error::{SocketError, errno};

fn set_option<S: AsRawFd, T>(socket: &S, level: libc::c_int, name: libc::c_int, val: &T, option: &'static str) -> std::io::Result<()> {
	let result = unsafe {
		libc::setsockopt(
			socket.as_raw_fd(),
			level,
			name,
			val as *const T as *const libc::c_void,
			std::mem::size_of::<T>() as libc::socklen_t,
		)
	};
	if result == -1 {
		Err(SocketError::SetOption { errno: errno(), option }.into())
	} else {
		Ok(())
	}
}

fn set_flag<S: AsRawFd>(socket: &S, level: libc::c_int, name: libc::c_int, enable: bool, option: &'static str) -> std::io::Result<()> {
	let val: libc::c_int = if enable { 1 } else { 0 };
	set_option(socket, level, name, &val, option)
}

/// Sets SO_REUSEADDR on a socket.
///
/// Allows binding to an address that's in TIME_WAIT state.
/// Essential for server restarts.
pub fn set_reuse_addr<S: AsRawFd>(socket: &S, enable: bool) -> std::io::Result<()> {
	set_flag(socket, libc::SOL_SOCKET, libc::SO_REUSEADDR, enable, "SO_REUSEADDR")
}

/// Sets SO_REUSEPORT on a socket.
///
/// Lets several multicast listeners share one group port.
pub fn set_reuse_port<S: AsRawFd>(socket: &S, enable: bool) -> std::io::Result<()> {
	set_flag(socket, libc::SOL_SOCKET, libc::SO_REUSEPORT, enable, "SO_REUSEPORT")
}

/// Sets TCP_NODELAY on a socket.
///
/// Disables Nagle's algorithm, so small writes go out immediately.
pub fn set_tcp_nodelay<S: AsRawFd>(socket: &S, enable: bool) -> std::io::Result<()> {
	set_flag(socket, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable, "TCP_NODELAY")
}

/// Sets IPV6_V6ONLY.
///
/// Cleared on dual-stack sockets so IPv4 peers arrive as IPv4-mapped addresses.
pub fn set_v6only<S: AsRawFd>(socket: &S, enable: bool) -> std::io::Result<()> {
	set_flag(socket, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, enable, "IPV6_V6ONLY")
}

/// Enables TCP keep-alive (SO_KEEPALIVE).
///
/// When enabled, the kernel sends keep-alive segments on idle connections to detect dead peers.
/// Use with TCP_KEEPIDLE, TCP_KEEPINTVL, TCP_KEEPCNT to tune timing.
pub fn set_keepalive<S: AsRawFd>(socket: &S, enable: bool) -> std::io::Result<()> {
	set_flag(socket, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enable, "SO_KEEPALIVE")
}

/// Sets TCP keep-alive idle time (TCP_KEEPIDLE).
///
/// Seconds of idle time before the first keep-alive segment is sent.
/// Requires SO_KEEPALIVE to be enabled.
pub fn set_keepalive_idle<S: AsRawFd>(socket: &S, seconds: u32) -> std::io::Result<()> {
	set_option(socket, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, &(seconds as libc::c_int), "TCP_KEEPIDLE")
}

/// Sets the interval between TCP keep-alive segments (TCP_KEEPINTVL).
pub fn set_keepalive_interval<S: AsRawFd>(socket: &S, seconds: u32) -> std::io::Result<()> {
	set_option(socket, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, &(seconds as libc::c_int), "TCP_KEEPINTVL")
}

/// Sets how many unanswered TCP keep-alive segments drop the peer (TCP_KEEPCNT).
///
/// Total detection time = KEEPIDLE + (KEEPINTVL × KEEPCNT).
pub fn set_keepalive_count<S: AsRawFd>(socket: &S, count: u32) -> std::io::Result<()> {
	set_option(socket, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, &(count as libc::c_int), "TCP_KEEPCNT")
}

/// Joins a multicast group on the default interface.
///
/// IPv4 groups use IP_ADD_MEMBERSHIP, IPv6 groups IPV6_ADD_MEMBERSHIP.
/// An IPv4 group on an IPv6 socket is joined through the IPv4 API.
pub fn join_multicast<S: AsRawFd>(socket: &S, group: &SockAddr) -> std::io::Result<()> {
	match group {
		SockAddr::V4(addr) => join_v4(socket, addr.ip()),
		SockAddr::V6(addr) => match addr.to_ipv4_mapped() {
			Some(v4) => join_v4(socket, v4),
			None => {
				let mreq = libc::ipv6_mreq {
					ipv6mr_multiaddr: libc::in6_addr { s6_addr: addr.ip() },
					ipv6mr_interface: addr.scope_id(),
				};
				set_option(socket, libc::IPPROTO_IPV6, libc::IPV6_ADD_MEMBERSHIP, &mreq, "IPV6_ADD_MEMBERSHIP")
			}
		},
		SockAddr::Unix(_) => Err(SocketError::Unsupported { what: "unix multicast" }.into()),
	}
}

fn join_v4<S: AsRawFd>(socket: &S, group: [u8; 4]) -> std::io::Result<()> {
	let mreq = libc::ip_mreq {
		imr_multiaddr: libc::in_addr { s_addr: u32::from_ne_bytes(group) },
		imr_interface: libc::in_addr { s_addr: libc::INADDR_ANY },
	};
	set_option(socket, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, &mreq, "IP_ADD_MEMBERSHIP")
}

/// Sets the time-to-live (hop limit) of outgoing multicast datagrams.
pub fn set_multicast_ttl<S: AsRawFd>(socket: &S, v6: bool, ttl: u32) -> std::io::Result<()> {
	let val = ttl as libc::c_int;
	if v6 {
		set_option(socket, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, &val, "IPV6_MULTICAST_HOPS")
	} else {
		set_option(socket, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, &val, "IP_MULTICAST_TTL")
	}
}

/// Controls whether multicast datagrams loop back to local listeners.
pub fn set_multicast_loop<S: AsRawFd>(socket: &S, v6: bool, enable: bool) -> std::io::Result<()> {
	if v6 {
		set_flag(socket, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, enable, "IPV6_MULTICAST_LOOP")
	} else {
		set_flag(socket, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, enable, "IP_MULTICAST_LOOP")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::addr::Family;
	use crate::socket::{Kind, RawSocket};

	fn get_int(socket: &RawSocket, level: libc::c_int, name: libc::c_int) -> libc::c_int {
		let mut val: libc::c_int = 0;
		let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
		let rc = unsafe {
			libc::getsockopt(socket.as_raw_fd(), level, name, &mut val as *mut _ as *mut libc::c_void, &mut len)
		};
		assert_eq!(rc, 0);
		val
	}

	#[test]
	fn keepalive_settings_stick() {
		let socket = RawSocket::new(Family::Ipv4, Kind::Stream).unwrap();
		set_keepalive(&socket, true).unwrap();
		set_keepalive_idle(&socket, 45).unwrap();
		set_keepalive_count(&socket, 3).unwrap();
		assert_eq!(get_int(&socket, libc::SOL_SOCKET, libc::SO_KEEPALIVE), 1);
		assert_eq!(get_int(&socket, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE), 45);
		assert_eq!(get_int(&socket, libc::IPPROTO_TCP, libc::TCP_KEEPCNT), 3);
	}

	#[test]
	fn reuse_addr_sticks() {
		let socket = RawSocket::new(Family::Ipv4, Kind::Stream).unwrap();
		set_reuse_addr(&socket, true).unwrap();
		assert_eq!(get_int(&socket, libc::SOL_SOCKET, libc::SO_REUSEADDR), 1);
	}

	#[test]
	fn unix_multicast_is_rejected() {
		let socket = RawSocket::new(Family::Unix, Kind::Datagram).unwrap();
		let group = SockAddr::Unix(crate::addr::UnixAddr::new("/tmp/x"));
		let err = join_multicast(&socket, &group).unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
	}
}
