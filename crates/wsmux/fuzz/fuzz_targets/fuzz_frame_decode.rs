#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use wsmux::frame::Frame;

/// The decoder must never panic, and anything it accepts must re-encode to
/// the exact input.
fuzz_target!(|data: &[u8]| {
    let msg = Bytes::copy_from_slice(data);
    if let Ok(frame) = Frame::decode(msg.clone(), 16 * 1024) {
        assert_eq!(frame.encode(), msg);
        let _ = frame.credit();
    }
});
