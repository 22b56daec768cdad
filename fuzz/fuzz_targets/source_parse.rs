#![no_main]

use hola::source::{Encoding, decode, encode, parse_source};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing must never panic, whatever the recipe wrote.
        let _ = parse_source(input);
    }

    // Base64 decode of arbitrary bytes must fail cleanly, and
    // encode-then-decode must round-trip.
    let _ = decode(data, Encoding::Base64);
    let encoded = encode(data, Encoding::Base64);
    assert_eq!(decode(&encoded, Encoding::Base64).unwrap(), data);
});
