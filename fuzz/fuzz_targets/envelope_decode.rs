#![no_main]

use libfuzzer_sys::fuzz_target;
use warp_codec::body::{ListAction, MapAction};
use warp_codec::envelope::{decode_envelope, encode_envelope};

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(envelope) = decode_envelope(frame) {
        let _ = ListAction::from_body(envelope.body());
        let _ = MapAction::from_body(envelope.body());
        let _ = encode_envelope(&envelope);
    }
});
