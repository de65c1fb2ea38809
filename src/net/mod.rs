//! Framed TCP messaging between the router and its clients.

pub mod client;
pub mod frame;
pub mod server;

pub use client::UnitClient;
pub use frame::{MetaHeader, PackageType, UnitType};
pub use server::{ClientInfo, RouterServer};

use std::sync::Arc;

/// Handler invoked per received frame, keyed by package type.
pub type FrameCallback = Arc<dyn Fn(&MetaHeader, &[u8]) + Send + Sync>;

/// Receive buffer per connection; a frame must fit entirely.
pub(crate) const RECEIVE_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Poll granularity for abort-flag observation.
pub(crate) const POLL_TIMEOUT_MS: u64 = 200;
