#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let log = String::from_utf8_lossy(data);
    let outcome = flakestat_domain::scrape_crash_log(&log);
    for record in &outcome.records {
        assert!(record.lines.len() >= 2);
    }
});
