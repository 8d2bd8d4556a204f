//! cora-core: Shared building blocks for cora protocol clients.
//!
//! This crate provides:
//! - Protocol message catalog and the `Message` wire buffer
//! - Record schemas, records and device settings
//! - The transport collaborator traits and a channel-backed transport
//! - The cooperative event runtime (session routing, liveness registry,
//!   posted events, one-shot timers) and its tokio driver
//! - Challenge/response logon digests
//! - Logging setup

pub mod auth;
pub mod constants;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod runtime;
pub mod transport;

pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
pub use runtime::{Finish, ReceiverId, Runtime, TimerId};
pub use transport::{SessionReceiver, Transport};
