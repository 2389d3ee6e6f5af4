//! Fuzz target: `FrameDecoder::feed` / `next_frame`
//!
//! Drives arbitrary byte sequences into the streaming frame decoder and
//! asserts that it never panics, never yields empty or oversized payloads,
//! and accepts bytes cleanly again after a reset.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use ihaproxy::rpc::codec::{FrameDecoder, MAX_FRAME_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = FrameDecoder::new();

    // Split the input in two so partial headers are exercised as well.
    let (head, tail) = data.split_at(data.len() / 2);
    for piece in [head, tail] {
        decoder.feed(piece);
        while let Ok(Some(payload)) = decoder.next_frame() {
            assert!(payload.len() <= MAX_FRAME_SIZE, "payload exceeds MAX_FRAME_SIZE");
            assert!(!payload.is_empty(), "decoder must not yield empty payload");
        }
    }

    decoder.reset();
    assert_eq!(decoder.buffered(), 0);
    decoder.feed(data);
    let _ = decoder.next_frame();
});
