#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Exercise the raw-byte decode path (includes serde_json's own UTF-8
    // validation and error handling for invalid sequences).
    let _ = signalr_client::NegotiationResponse::from_slice(data);

    // Also exercise the value-based path for input that parses as JSON.
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        let _ = signalr_client::NegotiationResponse::from_value(&value);
    }
});
