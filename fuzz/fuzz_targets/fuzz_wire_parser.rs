#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use strata_quicdgram::wire::{Frame, FrameHeader};

/// Fuzz the complete frame decode pipeline. Neither `FrameHeader::decode` nor
/// `Frame::decode` may panic on arbitrary input; malformed input must return
/// `Err`, never a panic or an infinite loop.
fuzz_target!(|data: &[u8]| {
    let mut header_buf = Bytes::copy_from_slice(data);
    let _ = FrameHeader::decode(&mut header_buf);

    let mut frame_buf = Bytes::copy_from_slice(data);
    if let Ok(frame) = Frame::decode(&mut frame_buf) {
        let mut re_encoded = BytesMut::new();
        frame.header.encode(&mut re_encoded);
        let re_decoded = FrameHeader::decode(&mut Bytes::copy_from_slice(&re_encoded))
            .expect("re-encoded header must redecode");
        assert_eq!(re_decoded, frame.header);
    }
});
