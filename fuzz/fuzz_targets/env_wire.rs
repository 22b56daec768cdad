#![no_main]

use hola::host::{encode_env_wire, parse_env_wire};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(wire) = std::str::from_utf8(data) else {
        return;
    };

    // Parsing arbitrary wire input must never panic; when it parses,
    // re-encoding and re-parsing must be stable.
    if let Ok(pairs) = parse_env_wire(wire) {
        let reencoded = encode_env_wire(&pairs);
        assert_eq!(parse_env_wire(&reencoded).unwrap(), pairs);
    }
});
