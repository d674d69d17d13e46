//! Classification of raw runner output, and the file naming shared by the
//! orchestration commands.

use flakestat_types::RunOutcome;
use std::collections::{BTreeMap, BTreeSet};

/// Printed by the runner on the second line when the path matches no test.
pub const NO_SUCH_TEST_MARKER: &[u8] = b"ERROR Unable to find any tests at the path";

/// `/a/b.html` -> `_a_b.html`.
pub fn trial_output_stem(test: &str) -> String {
    test.replace('/', "_")
}

/// Output file name for trial `index` of `test`.
///
/// Stem and index are joined without a separator, so distinct pairs can
/// share a name (`/a.html1` trial 0 and `/a.html` trial 10). Callers check
/// their test list with [`output_name_collisions`] first.
pub fn trial_output_name(test: &str, index: u32) -> String {
    format!("{}{}", trial_output_stem(test), index)
}

/// Line written to the timeout file when trial `index` of `test` was killed.
/// Shares the ambiguity of [`trial_output_name`].
pub fn timeout_key(test: &str, index: u32) -> String {
    format!("{test}{index}")
}

/// Output names claimed by more than one distinct `(test, trial)` pair, sorted.
pub fn output_name_collisions<'a, I>(tests: I, trials: u32) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut owners: BTreeMap<String, (&str, u32)> = BTreeMap::new();
    let mut clashes = BTreeSet::new();

    for test in tests {
        for index in 0..trials {
            let name = trial_output_name(test, index);
            match owners.get(&name) {
                Some(&(owner, owner_index)) if owner != test || owner_index != index => {
                    clashes.insert(name);
                }
                Some(_) => {}
                None => {
                    owners.insert(name, (test, index));
                }
            }
        }
    }

    clashes.into_iter().collect()
}

/// Decide what one runner execution amounted to from its captured stdout.
pub fn classify_runner_output(test: &str, output: &[u8]) -> RunOutcome {
    let lines: Vec<&[u8]> = output.trim_ascii_end().split(|b| *b == b'\n').collect();

    if lines.len() < 2 {
        return RunOutcome::Unknown;
    }

    if contains(lines[1], NO_SUCH_TEST_MARKER) {
        return RunOutcome::DoesNotExist;
    }

    // The verdict sits three lines from the end in the runner's summary block.
    if let Some(idx) = lines.len().checked_sub(3) {
        let result_line = lines[idx].trim_ascii();
        if result_line == b"OK" {
            return RunOutcome::Succeeded;
        }
        if result_line == [b"TIMEOUT ", test.as_bytes()].concat().as_slice() {
            return RunOutcome::TimedOut;
        }
        if result_line.starts_with(b"FAIL") {
            return RunOutcome::Failed;
        }
    }

    // Unexpected-results sections are sometimes followed by a lot of output.
    if lines.iter().any(|line| line.starts_with(b"FAIL")) {
        return RunOutcome::Failed;
    }

    RunOutcome::Unknown
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
