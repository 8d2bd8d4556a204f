//! Device settings.
//!
//! Settings are polymorphic values keyed by a numeric identifier. The client
//! runtime only needs a handful of them, so a [`SettingFactory`] decides which
//! identifiers are understood; everything else is skipped.

use std::any::Any;
use std::fmt;

use super::message::Message;
use super::messages::settings::INPUT_LOCATION_LABELS;
use super::types::SessionNo;
use crate::error::Result;

/// A typed device setting value.
pub trait Setting: fmt::Debug {
    /// Numeric setting identifier.
    fn identifier(&self) -> u32;

    /// Decode the value from a message positioned at the setting body.
    fn read(&mut self, msg: &mut Message) -> Result<()>;

    /// Encode the value.
    fn write(&self, msg: &mut Message);

    /// Human readable form of the value.
    fn format(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

/// Creates empty settings for the identifiers it understands.
pub trait SettingFactory {
    /// Returns `None` for identifiers the factory does not know.
    fn make_setting(&self, identifier: u32) -> Option<Box<dyn Setting>>;
}

/// Decode one setting body through a factory.
///
/// Unknown identifiers and undecodable bodies both yield `None`.
pub fn decode_setting(
    factory: &dyn SettingFactory,
    identifier: u32,
    body: &[u8],
) -> Option<Box<dyn Setting>> {
    let mut setting = factory.make_setting(identifier)?;
    let mut msg = Message::with_body(SessionNo(0), 0, body);
    match setting.read(&mut msg) {
        Ok(()) => Some(setting),
        Err(e) => {
            tracing::debug!(identifier, error = %e, "skipping undecodable setting");
            None
        }
    }
}

/// Labels of a classic datalogger's input locations, in location order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputLocationLabels {
    pub labels: Vec<String>,
}

impl Setting for InputLocationLabels {
    fn identifier(&self) -> u32 {
        INPUT_LOCATION_LABELS
    }

    fn read(&mut self, msg: &mut Message) -> Result<()> {
        let count = msg.read_u4()?;
        let mut labels = Vec::new();
        for _ in 0..count {
            labels.push(msg.read_str()?);
        }
        self.labels = labels;
        Ok(())
    }

    fn write(&self, msg: &mut Message) {
        msg.add_u4(self.labels.len() as u32);
        for label in &self.labels {
            msg.add_str(label);
        }
    }

    fn format(&self) -> String {
        self.labels.join(", ")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory that knows the settings the client runtime consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSettingFactory;

impl SettingFactory for DefaultSettingFactory {
    fn make_setting(&self, identifier: u32) -> Option<Box<dyn Setting>> {
        match identifier {
            INPUT_LOCATION_LABELS => Some(Box::new(InputLocationLabels::default())),
            _ => None,
        }
    }
}
