#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = flakestat_domain::classify_runner_output("/fuzz.html", data);
});
