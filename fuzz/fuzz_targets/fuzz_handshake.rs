//! Fuzz target for the handshake state machine.
//!
//! Feeds arbitrary frame sequences to an acceptor that shares a secret with
//! `peer`. It must never panic, and must never authenticate unless it was
//! shown the correct proof.

#![no_main]

use arbitrary::Arbitrary;
use botlink::directory::{BotRecord, MemoryDirectory};
use botlink::frame::Frame;
use botlink::handshake::{Negotiator, PROTOCOL_VERSION, proof};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

const SECRET: &str = "fuzz-secret";

#[derive(Debug, Arbitrary)]
enum FuzzFrame {
    Botlink {
        from_peer: bool,
        current_version: bool,
        nonce: Option<[u8; 16]>,
    },
    LinkAuth {
        from_peer: bool,
        valid: bool,
        junk: [u8; 32],
    },
    LinkReady {
        from_peer: bool,
    },
    Chat {
        text: String,
    },
}

fn sender(from_peer: bool) -> String {
    if from_peer { "peer".into() } else { "intruder".into() }
}

fuzz_target!(|frames: Vec<FuzzFrame>| {
    let directory = MemoryDirectory::new().with_bot(BotRecord::new("peer").with_secret(SECRET));
    let mut negotiator = Negotiator::acceptor("me", Arc::new(directory));
    let good_proof = proof("peer", SECRET, "me");
    let mut shown_good_proof = false;

    for f in frames {
        let frame = match f {
            FuzzFrame::Botlink {
                from_peer,
                current_version,
                nonce,
            } => Frame::Botlink {
                from: sender(from_peer),
                to: "me".into(),
                version: if current_version { PROTOCOL_VERSION } else { 0 },
                software: "fuzz".into(),
                nonce: nonce.map(hex_encode),
            },
            FuzzFrame::LinkAuth { from_peer, valid, junk } => {
                let proof = if valid { good_proof.clone() } else { hex_encode(junk) };
                Frame::LinkAuth { from: sender(from_peer), proof }
            }
            FuzzFrame::LinkReady { from_peer } => Frame::LinkReady {
                from: sender(from_peer),
                software: "fuzz".into(),
            },
            FuzzFrame::Chat { text } => Frame::Chat {
                from: "peer".into(),
                nick: "nick".into(),
                text,
            },
        };
        if matches!(&frame, Frame::LinkAuth { from, proof } if from == "peer" && *proof == good_proof) {
            shown_good_proof = true;
        }
        if negotiator.handle(&frame).is_err() {
            break;
        }
    }

    assert!(!negotiator.is_authenticated() || shown_good_proof);
});

fn hex_encode<const N: usize>(bytes: [u8; N]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
