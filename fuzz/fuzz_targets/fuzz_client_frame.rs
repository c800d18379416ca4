#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Client frames come back to us through service echoes and test
    // doubles, so the parse path has to hold up to arbitrary bytes too.
    let _ = serde_json::from_slice::<thirty_sync::protocol::ClientFrame>(data);

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = serde_json::from_str::<thirty_sync::protocol::ClientFrame>(s);
    }
});
