//! Lowers the process descriptor limit, so it runs as its own test binary.

use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sockline::{Controller, Endpoint, Handler, Link, MultiplexerKind, ReactorConfig, Server};

/// Keeps the text of every reported socket failure.
struct Failures(Arc<Mutex<Vec<String>>>);

impl Handler for Failures {
	fn on_data(&mut self, _link: &mut Link<'_>) -> io::Result<usize> {
		Ok(0)
	}

	fn on_error(&mut self, _socket: &str, error: &io::Error) {
		self.0.lock().push(error.to_string());
	}
}

/// Runs `f` with RLIMIT_NOFILE lowered to `limit`, then restores it.
fn with_descriptor_limit<R>(limit: libc::rlim_t, f: impl FnOnce() -> R) -> R {
	let mut saved = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
	assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut saved) }, 0);
	let lowered = libc::rlimit { rlim_cur: limit, rlim_max: saved.rlim_max };
	assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lowered) }, 0);
	let result = f();
	assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &saved) }, 0);
	result
}

#[test]
fn exhausted_descriptors_close_the_listener() {
	let controller = Controller::new(ReactorConfig::new().multiplexer(MultiplexerKind::Poll)).unwrap();
	let mut server = Server::new("starved");
	server.open_at("127.0.0.1", "0").unwrap();
	let port = server.socket().local_addr().unwrap().port().unwrap();
	let failures = Arc::new(Mutex::new(Vec::new()));
	let id = controller.register(server, Failures(Arc::clone(&failures))).unwrap();

	let _peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
	thread::sleep(Duration::from_millis(20));

	// The lowest free descriptor becomes the first one past the limit.
	let next = std::fs::File::open("/dev/null").unwrap().as_raw_fd();
	with_descriptor_limit(next as libc::rlim_t, || {
		controller.poll_once(Duration::from_secs(1)).unwrap();
	});

	assert!(!controller.with_socket(id, |socket| socket.is_open()).unwrap());
	{
		let failures = failures.lock();
		assert_eq!(failures.len(), 1);
		assert!(failures[0].contains("too many open files"), "{}", failures[0]);
	}

	// A closed listener no longer wakes the reactor.
	let started = Instant::now();
	let mut passes = 0;
	while started.elapsed() < Duration::from_millis(200) {
		controller.poll_once(Duration::from_millis(50)).unwrap();
		passes += 1;
	}
	assert!(passes <= 8, "{passes} passes in 200ms");
	assert_eq!(failures.lock().len(), 1);
}
