#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Whatever parses must survive conversion without panicking.
    if let Ok(report) = serde_json::from_slice::<flakestat_types::WptReport>(data) {
        let records: Vec<_> = report
            .results
            .into_iter()
            .filter_map(|raw| flakestat_domain::trial_from_raw(raw).ok())
            .collect();
        let grouping = flakestat_domain::group_trials(records, None);
        let _ = flakestat_domain::aggregate(&grouping.groups);
    }
});
