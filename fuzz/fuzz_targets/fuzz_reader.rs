#![no_main]

use libfuzzer_sys::fuzz_target;
use payment_stream::Reader;

fuzz_target!(|data: &[u8]| {
    // Walk arbitrary input with every variable-length reader; must never panic
    let mut reader = Reader::new(data.to_vec());
    while reader.remaining() > 0 {
        reader.bookmark();
        if reader.read_var_uint().is_ok() {
            continue;
        }
        let _ = reader.restore();
        reader.bookmark();
        if reader.read_var_int().is_ok() {
            continue;
        }
        let _ = reader.restore();
        if reader.read_var_octet_string().is_err() && reader.skip(1).is_err() {
            break;
        }
    }
});
