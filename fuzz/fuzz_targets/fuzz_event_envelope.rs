#![no_main]

use libfuzzer_sys::fuzz_target;
use live_quiz_engine::protocol::EventEnvelope;
use live_quiz_engine::reconciler::Reconciler;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = serde_json::from_slice::<EventEnvelope>(data) else {
        return;
    };

    // Decoding must never panic, whatever the payload shape.
    let _ = envelope.decode();

    // Neither may applying it to a live reconciler.
    if let Some(session_id) = envelope.session_id {
        let mut reconciler = Reconciler::new(session_id, Some("fuzz".into()));
        reconciler.apply_envelope(&envelope);
        let _ = reconciler.view(true, None);
    }
});
