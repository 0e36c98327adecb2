pub mod cancel;
pub mod directory;
pub mod doorbell;
pub mod rendezvous;

pub use cancel::CancelToken;
pub use directory::MemDirectory;
pub use doorbell::{
    Doorbell, EventHub, LoopbackEvents, NotificationChannel, Port, WaitResult,
    DEFAULT_POLL_INTERVAL,
};
pub use rendezvous::{RendezvousDirectory, ServicePaths, Watch};
