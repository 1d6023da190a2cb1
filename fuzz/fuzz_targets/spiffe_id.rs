#![no_main]

use libfuzzer_sys::fuzz_target;
use meshca_identity::Identity;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(id) = Identity::from_spiffe_uri(s) {
            assert_eq!(Identity::from_spiffe_uri(&id.to_spiffe_uri()).unwrap(), id);
        }
    }
});
