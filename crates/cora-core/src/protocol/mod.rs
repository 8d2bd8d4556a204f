//! Protocol module for the cora wire format.
//!
//! This module provides:
//! - The message type catalog
//! - The `Message` buffer with typed big-endian readers and writers
//! - Record schemas, records and record batches
//! - Pluggable device settings

mod message;
pub mod messages;
mod record;
mod setting;
mod types;

#[cfg(test)]
mod proptest;

pub use message::Message;
pub use record::{Record, RecordBatch, RecordDescription, Value, ValueDesc, ValueType};
pub use setting::{DefaultSettingFactory, InputLocationLabels, Setting, SettingFactory, decode_setting};
pub use types::{ChangeCode, CloseReason, LgrDate, ServerVersion, SessionNo};
