#![no_main]

use hola_kms::{KmsClient, KmsRequest, LocalKms};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let kms = LocalKms::default();
    let req = KmsRequest::symmetric("alias/fuzz");

    // Arbitrary bytes must never decrypt successfully by accident...
    let _ = kms.decrypt(&req, data);

    // ...and a genuine seal must always open to the original payload.
    let sealed = kms.encrypt(&req, data).unwrap();
    assert_eq!(kms.decrypt(&req, &sealed).unwrap(), data);
});
