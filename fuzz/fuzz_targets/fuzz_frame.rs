//! Fuzz target for the wire codec and control requests.
//!
//! Arbitrary bytes must never panic the parsers, and any frame that parses
//! must survive an encode/parse cycle unchanged.

#![no_main]

use botlink::frame::Frame;
use botlink::protocol::{Request, Response};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<Request>(data);
    let _ = serde_json::from_slice::<Response>(data);

    if let Ok(line) = std::str::from_utf8(data) {
        if let Ok(frame) = Frame::parse(line) {
            let encoded = frame.encode();
            let again = Frame::parse(&encoded).expect("encoded frame must parse");
            assert_eq!(frame, again);
        }
    }
});
