pub mod addr;
pub mod socket;
pub mod tls;
pub mod endpoint;
pub mod reactor;
pub mod config;
mod error;

pub use self::error::{ConfigError, IoError, ReactorError, ResolveError, SocketError, TlsError, errno, resolve_error};
pub use self::addr::{Address, Family, SockAddr, SocketAddrV4, SocketAddrV6, UnixAddr, resolve};
pub use self::socket::{Connection, ConnectionId, Kind, Role, Socket, State, Received, Shutdown,
					   SocketOptions, ReuseConfig, KeepaliveConfig, RawSocket};
pub use self::tls::{Handshake, TlsContext, TlsSession};
pub use self::endpoint::{AcceptPolicy, Client, Server, TlsClient, TlsServer, Udp, Multicast,
						 UnixClient, UnixServer, Endpoint, Handler, Link, data_handler};
pub use self::reactor::{Controller, MultiplexerKind, ReactorConfig, ReconnectDriver, SocketId, Supervisor};
pub use self::config::{ConfigStore, Port, SocketSection};
