//! Crash blocks in harness logs.
//!
//! ```text
//!   ▶ CRASH [expected OK] /css/foo.html
//!   │ thread 'main' panicked at ...
//!   │ stack backtrace:
//!   └ ...
//! ```

use flakestat_types::CrashRecord;

const CRASH_HEADER: &str = "  ▶ CRASH";
const CRASH_BODY: &str = "  │ ";
const CRASH_FOOTER: &str = "  └ ";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeOutcome {
    pub records: Vec<CrashRecord>,

    /// Blocks that never reached a footer line.
    pub unterminated: usize,
}

pub fn scrape_crash_log(log: &str) -> ScrapeOutcome {
    let mut outcome = ScrapeOutcome::default();
    let mut current: Option<Vec<String>> = None;

    for line in log.lines() {
        if line.starts_with(CRASH_HEADER) {
            if current.replace(vec![line.to_string()]).is_some() {
                outcome.unterminated += 1;
            }
            continue;
        }

        let Some(lines) = current.as_mut() else {
            continue;
        };

        if line.starts_with(CRASH_BODY) {
            lines.push(line.to_string());
        } else if line.starts_with(CRASH_FOOTER) {
            lines.push(line.to_string());
            if let Some(lines) = current.take() {
                outcome.records.push(CrashRecord {
                    test: test_from_header(&lines[0]),
                    lines,
                });
            }
        }
    }

    if current.is_some() {
        outcome.unterminated += 1;
    }

    outcome
}

fn test_from_header(header: &str) -> Option<String> {
    header
        .split_whitespace()
        .last()
        .filter(|tok| tok.starts_with('/'))
        .map(str::to_string)
}
