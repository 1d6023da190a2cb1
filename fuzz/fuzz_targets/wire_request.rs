#![no_main]

use libfuzzer_sys::fuzz_target;
use meshca_identity::server::Request;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<Request>(data);
});
