//! Property-based tests for the message buffer and wire decoders.
//!
//! These tests use proptest to verify:
//! - Readers never panic on arbitrary bodies
//! - Decoders of records, table definitions and settings never panic,
//!   including on hostile array dimensions
//! - Server version ordering agrees with component-wise comparison

#![cfg(test)]

use std::rc::Rc;

use proptest::prelude::*;

use crate::protocol::{
    DefaultSettingFactory, Message, Record, RecordDescription, ServerVersion, SessionNo,
    ValueDesc, ValueType, decode_setting, messages::settings::INPUT_LOCATION_LABELS,
};

// =============================================================================
// Arbitrary Generators
// =============================================================================

fn arb_body() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

prop_compose! {
    fn arb_version()(parts in prop::collection::vec(0u32..50, 1..5)) -> (String, Vec<u32>) {
        let text = parts.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(".");
        (text, parts)
    }
}

fn status_description() -> Rc<RecordDescription> {
    Rc::new(RecordDescription::new(
        "ws1",
        "Status",
        vec![
            ValueDesc::scalar("Batt", ValueType::Ieee4),
            ValueDesc::scalar("Name", ValueType::Ascii),
            ValueDesc::scalar("Flag", ValueType::Bool),
        ],
    ))
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn readers_never_panic(body in arb_body(), ops in prop::collection::vec(0u8..8, 0..64)) {
        let mut msg = Message::with_body(SessionNo(1), 0, &body);
        for op in ops {
            let _ = match op {
                0 => msg.read_u1().map(|_| ()),
                1 => msg.read_u2().map(|_| ()),
                2 => msg.read_u4().map(|_| ()),
                3 => msg.read_i8().map(|_| ()),
                4 => msg.read_f8().map(|_| ()),
                5 => msg.read_str().map(|_| ()),
                6 => msg.read_bytes().map(|_| ()),
                _ => msg.read_stamp().map(|_| ()),
            };
            prop_assert!(msg.remaining() <= body.len());
        }
    }

    #[test]
    fn failed_read_does_not_consume(body in arb_body()) {
        let mut msg = Message::with_body(SessionNo(1), 0, &body);
        while msg.read_u4().is_ok() {}
        let left = msg.remaining();
        prop_assert!(left < 4);
        prop_assert!(msg.read_u4().is_err());
        prop_assert_eq!(msg.remaining(), left);
    }

    #[test]
    fn decoders_never_panic(body in arb_body()) {
        let mut msg = Message::with_body(SessionNo(1), 0, &body);
        let _ = RecordDescription::read("b", &mut msg);
        msg.reset_read();
        let _ = Record::read(status_description(), &mut msg);
        let _ = decode_setting(&DefaultSettingFactory, INPUT_LOCATION_LABELS, &body);
    }

    #[test]
    fn hostile_dimensions_never_panic(
        dims in prop::collection::vec(any::<u32>(), 0..5),
        body in arb_body(),
    ) {
        let mut column = ValueDesc::scalar("Grid", ValueType::Ieee8);
        column.dims = dims;
        let mut msg = Message::new(SessionNo(1), 0);
        RecordDescription::new("b", "T", vec![column.clone()]).write(&mut msg);
        if let Ok(desc) = RecordDescription::read("b", &mut msg) {
            prop_assert!(desc.values[0].element_count().is_some());
        }
        let mut msg = Message::with_body(SessionNo(1), 0, &body);
        let _ = Record::read(Rc::new(RecordDescription::new("b", "T", vec![column])), &mut msg);
    }

    #[test]
    fn version_order_is_component_order(a in arb_version(), b in arb_version()) {
        let va = ServerVersion::parse(&a.0).unwrap();
        let vb = ServerVersion::parse(&b.0).unwrap();
        prop_assert_eq!(va.cmp(&vb), a.1.cmp(&b.1));
        prop_assert_eq!(va.at_least(&b.0), a.1 >= b.1);
    }
}
