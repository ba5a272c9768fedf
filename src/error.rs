use crate::addr::Family;

/// Socket creation/configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket() failed: {}", errno_to_str(*.errno))]
    Create { errno: i32 },

    #[error("bind({addr}) failed: {}", errno_to_str(*.errno))]
    Bind { errno: i32, addr: String },

    #[error("listen(backlog={backlog}) failed: {}", errno_to_str(*.errno))]
    Listen { errno: i32, backlog: i32 },

    #[error("connect({addr}) failed: {}", errno_to_str(*.errno))]
    Connect { errno: i32, addr: String },

    #[error("accept() failed: {}", errno_to_str(*.errno))]
    Accept { errno: i32 },

    #[error("setsockopt({option}) failed: {}", errno_to_str(*.errno))]
    SetOption { errno: i32, option: &'static str },

    #[error("getsockopt({option}) failed: {}", errno_to_str(*.errno))]
    GetOption { errno: i32, option: &'static str },

    #[error("invalid address: {reason}")]
    InvalidAddress { reason: &'static str },

    #[error("socket {name:?} is not open")]
    NotOpen { name: String },

    #[error("socket {name:?} has no connection {id}")]
    UnknownConnection { name: String, id: i32 },

    #[error("operation not supported on {what}")]
    Unsupported { what: &'static str },
}

/// I/O operation errors.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("read() failed: {}", errno_to_str(*.errno))]
    Read { errno: i32 },

    #[error("write() failed: {}", errno_to_str(*.errno))]
    Write { errno: i32 },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("operation would block")]
    WouldBlock,

    #[error("interrupted by signal")]
    Interrupted,

    #[error("{op} timed out")]
    TimedOut { op: &'static str },
}

/// Name resolution errors.
///
/// Carries the resolver's own `EAI_*` code, never an errno, so callers can
/// tell "could not resolve" apart from "could not bind".
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("cannot resolve {host:?} service {service:?}: {}", gai_to_str(*.code))]
    Lookup { host: String, service: String, code: i32 },

    #[error("no {family} address for {host:?} service {service:?}")]
    NoAddress { host: String, service: String, family: Family },

    #[error("unix socket path is {len} bytes, limit is {max}")]
    PathTooLong { len: usize, max: usize },

    #[error("host or service contains an interior NUL byte")]
    Nul,
}

impl ResolveError {
    /// Resolver-specific error code (`EAI_*`).
    pub fn code(&self) -> i32 {
        match self {
            ResolveError::Lookup { code, .. } => *code,
            ResolveError::NoAddress { .. } => libc::EAI_NONAME,
            ResolveError::PathTooLong { .. } | ResolveError::Nul => libc::EAI_FAIL,
        }
    }
}

/// TLS engine errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("tls configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("invalid server name {0:?}")]
    ServerName(String),

    #[error("cannot read {path}: {source}")]
    Pem { path: String, source: std::io::Error },

    #[error("no private key in {0}")]
    MissingKey(String),

    #[error("tls handshake failed: {0}")]
    Handshake(rustls::Error),

    #[error("peer closed during tls handshake")]
    Closed,

    #[error("tls handshake timed out")]
    TimedOut,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reactor errors.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("{op} failed: {}", errno_to_str(*.errno))]
    Multiplexer { errno: i32, op: &'static str },

    #[error("no socket registered as {0}")]
    UnknownSocket(u64),

    #[error("listening socket {socket:?} reported a hang-up or error")]
    ListenerFailed { socket: String },

    #[error("reactor thread is running")]
    Running,

    #[error("cannot spawn {name}: {source}")]
    Spawn { name: &'static str, source: std::io::Error },
}

/// Configuration store errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot access {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot write configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("section [{0}] is not a table")]
    NotATable(String),
}

/// Returns current errno value.
#[inline]
pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Returns the typed resolution error inside an `io::Error`, if that is what it carries.
pub fn resolve_error(err: &std::io::Error) -> Option<&ResolveError> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<ResolveError>())
}

/// Converts errno to human-readable string.
fn errno_to_str(errno: i32) -> String {
    match errno {
        libc::EACCES => "permission denied".into(),
        libc::EADDRINUSE => "address already in use".into(),
        libc::EADDRNOTAVAIL => "address not available".into(),
        libc::EAFNOSUPPORT => "address family not supported".into(),
        libc::EAGAIN => "resource temporarily unavailable".into(),
        libc::EBADF => "bad file descriptor".into(),
        libc::EEXIST => "already exists".into(),
        libc::ECONNABORTED => "connection aborted".into(),
        libc::ECONNREFUSED => "connection refused".into(),
        libc::ECONNRESET => "connection reset by peer".into(),
        libc::EHOSTUNREACH => "host unreachable".into(),
        libc::EINPROGRESS => "operation in progress".into(),
        libc::EINTR => "interrupted by signal".into(),
        libc::EINVAL => "invalid argument".into(),
        libc::EISCONN => "already connected".into(),
        libc::EMFILE => "too many open files".into(),
        libc::ENFILE => "too many open files in system".into(),
        libc::ENETUNREACH => "network unreachable".into(),
        libc::ENOBUFS => "no buffer space available".into(),
        libc::ENOENT => "no such file or directory".into(),
        libc::ENOTCONN => "not connected".into(),
        libc::EPIPE => "broken pipe".into(),
        libc::ETIMEDOUT => "connection timed out".into(),
        _ => format!("errno {}", errno),
    }
}

/// Converts a resolver code to its system message.
fn gai_to_str(code: i32) -> String {
    if code == libc::EAI_SYSTEM {
        return errno_to_str(errno());
    }
    let msg = unsafe { libc::gai_strerror(code) };
    if msg.is_null() {
        return format!("resolver error {}", code);
    }
    unsafe { std::ffi::CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}

/// Maps errno to std::io::ErrorKind.
fn errno_to_kind(errno: i32) -> std::io::ErrorKind {
    match errno {
        libc::EACCES | libc::EPERM => std::io::ErrorKind::PermissionDenied,
        libc::EADDRINUSE => std::io::ErrorKind::AddrInUse,
        libc::EADDRNOTAVAIL => std::io::ErrorKind::AddrNotAvailable,
        libc::EEXIST => std::io::ErrorKind::AlreadyExists,
        libc::EAGAIN => std::io::ErrorKind::WouldBlock,
        libc::ECONNABORTED => std::io::ErrorKind::ConnectionAborted,
        libc::ECONNREFUSED => std::io::ErrorKind::ConnectionRefused,
        libc::ECONNRESET => std::io::ErrorKind::ConnectionReset,
        libc::EINTR => std::io::ErrorKind::Interrupted,
        libc::EINVAL => std::io::ErrorKind::InvalidInput,
        libc::ENOENT => std::io::ErrorKind::NotFound,
        libc::ENOTCONN => std::io::ErrorKind::NotConnected,
        libc::EPIPE => std::io::ErrorKind::BrokenPipe,
        libc::ETIMEDOUT => std::io::ErrorKind::TimedOut,
        _ => std::io::ErrorKind::Other,
    }
}

impl From<SocketError> for std::io::Error {
    fn from(err: SocketError) -> Self {
        let errno = match &err {
            SocketError::Create { errno } => *errno,
            SocketError::Bind { errno, .. } => *errno,
            SocketError::Listen { errno, .. } => *errno,
            SocketError::Connect { errno, .. } => *errno,
            SocketError::Accept { errno } => *errno,
            SocketError::SetOption { errno, .. } => *errno,
            SocketError::GetOption { errno, .. } => *errno,
            SocketError::InvalidAddress { .. } => libc::EINVAL,
            SocketError::NotOpen { .. } => libc::ENOTCONN,
            SocketError::UnknownConnection { .. } => libc::ENOENT,
            SocketError::Unsupported { .. } => libc::EINVAL,
        };
        std::io::Error::new(errno_to_kind(errno), err)
    }
}

impl From<IoError> for std::io::Error {
    fn from(err: IoError) -> Self {
        let kind = match &err {
            IoError::Read { errno } => errno_to_kind(*errno),
            IoError::Write { errno } => errno_to_kind(*errno),
            IoError::ConnectionClosed => std::io::ErrorKind::ConnectionReset,
            IoError::WouldBlock => std::io::ErrorKind::WouldBlock,
            IoError::Interrupted => std::io::ErrorKind::Interrupted,
            IoError::TimedOut { .. } => std::io::ErrorKind::TimedOut,
        };
        std::io::Error::new(kind, err)
    }
}

impl From<ResolveError> for std::io::Error {
    fn from(err: ResolveError) -> Self {
        let kind = match &err {
            ResolveError::PathTooLong { .. } | ResolveError::Nul => std::io::ErrorKind::InvalidInput,
            _ => std::io::ErrorKind::NotFound,
        };
        std::io::Error::new(kind, err)
    }
}

impl From<TlsError> for std::io::Error {
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::Io(inner) => inner,
            other => {
                let kind = match &other {
                    TlsError::Closed => std::io::ErrorKind::UnexpectedEof,
                    TlsError::TimedOut => std::io::ErrorKind::TimedOut,
                    TlsError::Pem { .. } | TlsError::MissingKey(_) => std::io::ErrorKind::NotFound,
                    _ => std::io::ErrorKind::InvalidData,
                };
                std::io::Error::new(kind, other)
            }
        }
    }
}

impl From<ReactorError> for std::io::Error {
    fn from(err: ReactorError) -> Self {
        match err {
            ReactorError::Spawn { source, .. } => source,
            other => {
                let kind = match &other {
                    ReactorError::Multiplexer { errno, .. } => errno_to_kind(*errno),
                    ReactorError::UnknownSocket(_) => std::io::ErrorKind::NotFound,
                    ReactorError::ListenerFailed { .. } => std::io::ErrorKind::BrokenPipe,
                    _ => std::io::ErrorKind::Other,
                };
                std::io::Error::new(kind, other)
            }
        }
    }
}

impl From<ConfigError> for std::io::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io { source, .. } => source,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_error_survives_io_conversion() {
        let err: std::io::Error = ResolveError::Lookup {
            host: "nowhere".into(),
            service: "80".into(),
            code: libc::EAI_NONAME,
        }
        .into();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        let inner = resolve_error(&err).unwrap();
        assert_eq!(inner.code(), libc::EAI_NONAME);
    }

    #[test]
    fn socket_errors_keep_errno_kind() {
        let err: std::io::Error = SocketError::Bind {
            errno: libc::EADDRINUSE,
            addr: "127.0.0.1:80".into(),
        }
        .into();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
        assert!(resolve_error(&err).is_none());
        assert!(err.to_string().contains("address already in use"));
    }

    #[test]
    fn would_block_maps_to_kind() {
        let err: std::io::Error = IoError::Read { errno: libc::EAGAIN }.into();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
