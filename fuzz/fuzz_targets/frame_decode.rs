//! Fuzz target for inbound and outbound frame decoding
//!
//! Arbitrary bytes from the network must never panic the decoder. Every
//! invalid input returns an error; every accepted frame re-encodes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use roomfeed_proto::{InboundFrame, OutboundFrame};

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = InboundFrame::decode(data) {
        assert!(frame.encode().is_ok(), "decoded inbound frame must re-encode");
    }
    if let Ok(frame) = OutboundFrame::decode(data) {
        assert!(frame.encode().is_ok(), "decoded outbound frame must re-encode");
    }
});
