pub mod chain;
pub mod descriptor;
pub mod grant;
pub mod page;
pub mod platform;
pub mod ring;

pub use chain::CapabilityChain;
pub use descriptor::{Descriptor, DescriptorRef, DescriptorSnapshot};
pub use grant::{GrantTable, GrantToken, LoopbackGrants, MemoryGrant, DEFAULT_MAX_GRANTS};
pub use page::{Page, PageFrame, PageSet};
pub use platform::{page_size, pages_for_order, MAX_BUFFER_ORDER};
pub use ring::{IoMode, RingBuffer, RingStats};
