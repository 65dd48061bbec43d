#![no_main]

use libfuzzer_sys::fuzz_target;
use live_quiz_engine::directory::{decode_ack, decode_participants, decode_session};

fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };
    let _ = decode_participants(1, body);
    let _ = decode_session(1, body);
    let _ = decode_ack(1, body);
});
