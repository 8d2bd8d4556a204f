//! cora-test-utils: Test infrastructure for cora clients.
//!
//! Provides:
//! - MockTransport: In-memory transport recording every session operation
//! - FakeServer: Scripted server answering logon, resource, broker and
//!   device commands through the runtime

mod fake_server;
mod mock_transport;

pub use fake_server::{AdviseStart, FakeServer, ResourceType, fake_runtime};
pub use mock_transport::{MockHandle, MockTransport};
