use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use sockline::{
	Client, ConnectionId, Endpoint, Family, Received, Server, SocketOptions, UnixClient, UnixServer,
};

fn port_of(endpoint: &impl Endpoint) -> String {
	endpoint.socket().local_addr().unwrap().port().unwrap().to_string()
}

fn accept_one(accept: &mut dyn FnMut() -> std::io::Result<Option<ConnectionId>>) -> ConnectionId {
	let deadline = Instant::now() + Duration::from_secs(5);
	while Instant::now() < deadline {
		if let Some(conn) = accept().unwrap() {
			return conn;
		}
		thread::sleep(Duration::from_millis(5));
	}
	panic!("no peer accepted");
}

fn ipv6_loopback() -> bool {
	let mut candidate = Server::with_family("v6-check", Family::Ipv6);
	candidate.open_at("::1", "0").is_ok()
}

#[test]
fn ipv4_listener() {
	let mut server = Server::new("v4");
	server.open_at("127.0.0.1", "0").unwrap();
	assert!(server.socket().is_listening());
	assert_eq!(server.socket().family(), Family::Ipv4);
	assert_ne!(port_of(&server), "0");
}

#[test]
fn ipv6_listener() {
	if !ipv6_loopback() {
		eprintln!("no IPv6 loopback, skipping");
		return;
	}
	let mut server = Server::with_family("v6", Family::Ipv6);
	server.open_at("::1", "0").unwrap();
	let port = port_of(&server);

	let mut client = Client::with_family("v6-client", Family::Ipv6);
	client.open_at("::1", &port).unwrap();
	assert!(client.socket().is_connected());

	let conn = accept_one(&mut || server.accept());
	assert_eq!(server.socket().connection(conn).unwrap().remote(), "::1");
}

#[test]
fn dual_stack_listener_takes_ipv4_peers() {
	if !ipv6_loopback() {
		eprintln!("no IPv6 loopback, skipping");
		return;
	}
	let mut server = Server::with_family("dual", Family::Ipv6).with_options(SocketOptions::new().dual_stack(true));
	server.open_at("::", "0").unwrap();
	let port = port_of(&server);

	let mut client = Client::new("v4-client");
	client.open_at("127.0.0.1", &port).unwrap();
	assert!(client.socket().is_connected());

	let conn = accept_one(&mut || server.accept());
	assert_eq!(server.socket().connection(conn).unwrap().remote(), "127.0.0.1");
}

#[test]
fn ipv6_literal_switches_family() {
	if !ipv6_loopback() {
		eprintln!("no IPv6 loopback, skipping");
		return;
	}
	let mut server = Server::new("literal");
	server.open_at("::1", "0").unwrap();
	assert_eq!(server.socket().family(), Family::Ipv6);
}

#[test]
fn unix_listener_removes_its_path() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("reactor.sock");
	let path_str = path.to_str().unwrap();

	let mut server = UnixServer::new("ctl");
	server.open_at(path_str, "").unwrap();
	assert!(Path::new(path_str).exists());

	let mut client = UnixClient::new("ctl-client");
	client.open_at(path_str, "").unwrap();
	let conn = accept_one(&mut || server.accept());
	assert_eq!(server.socket().connection_ids(), vec![conn]);

	server.close();
	assert!(!path.exists());
	assert!(!server.socket().is_open());
	assert!(server.socket().connection_ids().is_empty());
}

#[test]
fn stale_unix_path_is_replaced() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("stale.sock");
	let path_str = path.to_str().unwrap();

	// A listener that exits without unlinking its path.
	drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
	assert!(path.exists());

	let mut second = UnixServer::new("second");
	second.open_at(path_str, "").unwrap();
	assert!(second.socket().is_listening());
}

#[test]
fn live_unix_path_is_not_taken_over() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("live.sock");
	let path_str = path.to_str().unwrap();

	let mut first = UnixServer::new("first");
	first.open_at(path_str, "").unwrap();

	let mut second = UnixServer::new("second");
	let err = second.open_at(path_str, "").unwrap_err();
	assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
	assert!(!second.socket().is_open());
	second.close();
	assert!(path.exists());

	let mut client = UnixClient::new("still-served");
	client.open_at(path_str, "").unwrap();
	assert!(client.socket().is_connected());
	assert!(first.socket().is_listening());
}

#[test]
fn close_twice_is_harmless() {
	let mut server = Server::new("twice");
	server.open_at("127.0.0.1", "0").unwrap();
	server.close();
	server.close();
	assert!(!server.socket().is_open());
	assert!(server.socket().fd().is_none());
}

#[test]
fn bind_failure_closes_the_socket() {
	let mut first = Server::new("first");
	first.open_at("127.0.0.1", "0").unwrap();
	let port = port_of(&first);

	let mut second = Server::new("second");
	assert!(second.open_at("127.0.0.1", &port).is_err());
	assert!(!second.socket().is_open());
}

fn round_trip(size: usize) {
	let mut server = Server::new("sink");
	server.open_at("127.0.0.1", "0").unwrap();
	let port = port_of(&server);

	let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
	let expected = payload.clone();

	let mut client = Client::new("source");
	client.open_at("127.0.0.1", &port).unwrap();
	assert!(client.socket().is_connected());
	let conn = accept_one(&mut || server.accept());

	let sender = thread::spawn(move || {
		let sent = client.send(&payload).unwrap();
		(sent, client)
	});

	let mut got = Vec::with_capacity(size);
	let mut buf = vec![0u8; 64 * 1024];
	let deadline = Instant::now() + Duration::from_secs(10);
	while got.len() < size && Instant::now() < deadline {
		match server.receive(conn, &mut buf).unwrap() {
			Received::Data(n) => got.extend_from_slice(&buf[..n]),
			Received::WouldBlock => thread::sleep(Duration::from_millis(1)),
			Received::Closed => break,
		}
	}

	let (sent, _client) = sender.join().unwrap();
	assert_eq!(sent, size);
	assert_eq!(got.len(), size);
	assert!(got == expected, "payload of {size} bytes corrupted");
}

#[test]
fn single_byte_round_trip() {
	round_trip(1);
}

#[test]
fn segment_sized_round_trip() {
	round_trip(1500);
}

#[test]
fn multi_segment_round_trip() {
	round_trip(4 * 1024 * 1024);
}

#[test]
fn peer_close_is_reported() {
	let mut server = Server::new("closing");
	server.open_at("127.0.0.1", "0").unwrap();
	let port = port_of(&server);

	let mut client = Client::new("short-lived");
	client.open_at("127.0.0.1", &port).unwrap();
	let conn = accept_one(&mut || server.accept());
	client.close();

	let mut buf = [0u8; 8];
	let deadline = Instant::now() + Duration::from_secs(5);
	let mut closed = false;
	while Instant::now() < deadline {
		match server.receive(conn, &mut buf).unwrap() {
			Received::Closed => {
				closed = true;
				break;
			}
			_ => thread::sleep(Duration::from_millis(5)),
		}
	}
	assert!(closed);
	assert!(server.socket().connection(conn).unwrap().state().is_finished());
}
