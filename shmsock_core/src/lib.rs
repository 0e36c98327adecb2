//! # SHMSOCK Core
//!
//! Stream sockets between two endpoints that share memory instead of copying
//! through the kernel.
//!
//! - **Memory**: page grants, the shared ring descriptor and the
//!   single-producer/single-consumer ring buffer
//! - **Communication**: doorbells, cancellation and the watchable rendezvous
//!   directory used for service discovery
//! - **Core**: service names, the connect/accept handshake and the socket
//!   state machine
//!
//! ## Quick Start
//!
//! ```rust
//! use shmsock_core::{Endpoint, EndpointId, IoMode, LoopbackHost, SocketConfig};
//!
//! let host = LoopbackHost::new();
//! let server = Endpoint::create(
//!     SocketConfig::for_endpoint(EndpointId(1)),
//!     host.attach(EndpointId(1)),
//! )?;
//! server.bind("echo")?;
//! server.listen(1)?;
//!
//! let acceptor = std::thread::spawn(move || server.accept());
//!
//! let client = Endpoint::create(
//!     SocketConfig::for_endpoint(EndpointId(2)),
//!     host.attach(EndpointId(2)),
//! )?;
//! client.connect("echo")?;
//! client.send(b"hello", IoMode::Blocking)?;
//! client.close()?;
//!
//! let accepted = acceptor.join().expect("acceptor panicked")?;
//! assert_eq!(accepted.recv(16, IoMode::Blocking)?, b"hello");
//! # Ok::<(), shmsock_core::ShmsockError>(())
//! ```

pub mod backend;
pub mod communication;
pub mod config;
pub mod core;
pub mod error;
pub mod memory;

pub use backend::{Backend, LoopbackHost};
pub use communication::{CancelToken, MemDirectory, NotificationChannel, RendezvousDirectory};
pub use config::SocketConfig;
pub use self::core::{Endpoint, EndpointId, Role, ServiceName, SocketState};
pub use error::{ShmsockError, ShmsockResult};
pub use memory::{GrantToken, IoMode, MemoryGrant, RingStats};
