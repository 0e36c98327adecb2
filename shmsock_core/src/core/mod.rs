pub mod address;
pub mod endpoint;
pub(crate) mod handshake;

pub use address::{EndpointId, ServiceName};
pub use endpoint::{Endpoint, Role, SocketState};
