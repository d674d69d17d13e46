use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use flakestat_adapters::{read_lines, FsArtifactStore, FsReportSource, StdProcessRunner};
use flakestat_app::{
    parse_config, render_crash_records, render_missing, render_summary_csv, render_tally_csv,
    render_unexpected_counts, AggregateRequest, AggregateUseCase, AnalyseOutputUseCase,
    AnalyseRequest, MissingTestsUseCase, RecordRequest, RecordUseCase, RunnerOverrides,
    RunnerSettings, SystemClock, TrialMode, TrialRunRequest, TrialRunUseCase,
};
use flakestat_domain::scrape_crash_log;
use flakestat_types::{ConfigFile, ToolInfo, DEFAULT_FILE_PATTERN, DEFAULT_TRIALS};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

/// Picked up from the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "flakestat.toml";

#[derive(Debug, Parser)]
#[command(
    name = "flakestat",
    version,
    about = "Aggregate repeated web-platform-tests runs and hunt intermittent failures"
)]
struct Cli {
    /// TOML config with runner and ingest defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log more (-v info, -vv debug, -vvv trace). Logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Directory of wptreport JSON files
    input_dir: PathBuf,

    /// Newline-delimited test identities to keep; everything else is dropped
    #[arg(long)]
    allow_list: Option<PathBuf>,

    /// Glob selecting results files inside the input directory
    #[arg(long)]
    pattern: Option<String>,
}

#[derive(Debug, Args)]
struct RunnerArgs {
    /// Executions per test
    #[arg(long)]
    trials: Option<u32>,

    /// Processes in flight per batch
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-process wait before the process is killed (e.g. "30s")
    #[arg(long)]
    timeout: Option<String>,

    /// Working directory for the runner
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Runner command as one shell-quoted string; the test path is appended
    #[arg(long, conflicts_with = "command")]
    runner: Option<String>,

    /// Runner argv after `--`; the test path is appended
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fold every trial of every test into one summary row per test.
    Aggregate {
        #[command(flatten)]
        ingest: IngestArgs,

        /// Fail when results files hold different numbers of entries
        #[arg(long, default_value_t = false)]
        strict_counts: bool,

        /// Omit the EXPECTED_RUNTIME column
        #[arg(long, default_value_t = false)]
        no_runtime: bool,

        /// Write the CSV here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,

        /// Also write the JSON summary report
        #[arg(long)]
        json: Option<PathBuf>,

        /// Pretty-print JSON
        #[arg(long, default_value_t = false)]
        pretty: bool,

        /// Include the per-subtest breakdown of OK trials in the JSON report
        #[arg(long, default_value_t = false)]
        subtests: bool,
    },

    /// List tests whose trials did not all land in the same category.
    Intermittents {
        #[command(flatten)]
        ingest: IngestArgs,
    },

    /// Count top-level statuses of trials that did not match their expectation.
    UnexpectedCounts {
        /// Directory of wptreport JSON files
        input_dir: PathBuf,

        /// Glob selecting results files inside the input directory
        #[arg(long)]
        pattern: Option<String>,
    },

    /// Run every listed test repeatedly, keeping each trial's output.
    RunBaseline {
        /// Newline-delimited test paths
        tests_file: PathBuf,
        output_dir: PathBuf,

        #[command(flatten)]
        runner: RunnerArgs,
    },

    /// Like run-baseline, replaying each test from its rr recording.
    RunReplay {
        tests_file: PathBuf,
        output_dir: PathBuf,

        /// Directory holding `<test>.record` files
        record_dir: PathBuf,

        #[command(flatten)]
        runner: RunnerArgs,
    },

    /// Record each listed test under rr, retrying until it passes.
    Record {
        tests_file: PathBuf,
        output_dir: PathBuf,

        #[command(flatten)]
        runner: RunnerArgs,
    },

    /// Classify the trial outputs left by run-baseline or run-replay.
    AnalyseOutput {
        tests_file: PathBuf,
        output_dir: PathBuf,

        /// Trials per test to look for
        #[arg(long)]
        trials: Option<u32>,

        /// Also print the outcomes folded into summary rows
        #[arg(long, default_value_t = false)]
        summary: bool,

        /// Also write the JSON tally report
        #[arg(long)]
        json: Option<PathBuf>,

        /// Pretty-print JSON
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },

    /// Report tests that were never run or that the runner could not find.
    Missing {
        tests_file: PathBuf,
        output_dir: PathBuf,
    },

    /// Extract crash blocks from a harness log.
    ScrapeLog {
        log_file: PathBuf,

        /// Print the records as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> ExitCode {
    if let Err(err) = real_main() {
        eprintln!("{err:#}");
        return ExitCode::from(1);
    }
    ExitCode::from(0)
}

fn real_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Aggregate {
            ingest,
            strict_counts,
            no_runtime,
            out,
            json,
            pretty,
            subtests,
        } => {
            let mut req = aggregate_request(&config, ingest)?;
            req.strict_counts = strict_counts;
            req.subtests = subtests;

            let usecase = AggregateUseCase::new(FsReportSource, SystemClock, tool_info());
            let report = usecase.execute(&req)?;
            let csv = render_summary_csv(&report.summaries, !no_runtime);

            if let Some(path) = &json {
                write_json(path, &report, pretty)?;
            }
            match out {
                Some(path) => atomic_write(&path, csv.as_bytes())?,
                None => print!("{csv}"),
            }
            Ok(())
        }

        Command::Intermittents { ingest } => {
            let req = aggregate_request(&config, ingest)?;
            let usecase = AggregateUseCase::new(FsReportSource, SystemClock, tool_info());
            let found = usecase.intermittents(&req)?;
            print!("{}", render_summary_csv(&found, true));
            Ok(())
        }

        Command::UnexpectedCounts { input_dir, pattern } => {
            let req = aggregate_request(
                &config,
                IngestArgs {
                    input_dir,
                    allow_list: None,
                    pattern,
                },
            )?;
            let usecase = AggregateUseCase::new(FsReportSource, SystemClock, tool_info());
            let counts = usecase.unexpected_counts(&req)?;
            print!("{}", render_unexpected_counts(&counts));
            Ok(())
        }

        Command::RunBaseline {
            tests_file,
            output_dir,
            runner,
        } => run_trials(&config, &tests_file, output_dir, runner, TrialMode::Baseline),

        Command::RunReplay {
            tests_file,
            output_dir,
            record_dir,
            runner,
        } => run_trials(
            &config,
            &tests_file,
            output_dir,
            runner,
            TrialMode::Replay { record_dir },
        ),

        Command::Record {
            tests_file,
            output_dir,
            runner,
        } => {
            let tests = read_tests(&tests_file)?;
            let settings = runner_settings(&config, runner)?;
            let attempts = settings.record_attempts;
            let usecase = RecordUseCase::new(StdProcessRunner, FsArtifactStore, settings);

            let outcome = usecase.execute(RecordRequest { tests, output_dir })?;

            println!(
                "recorded {}, skipped {}, failed {}",
                outcome.recorded.len(),
                outcome.skipped.len(),
                outcome.never_recorded.len()
            );
            for test in &outcome.never_recorded {
                println!("unable to record after {attempts} attempts: {test}");
            }
            Ok(())
        }

        Command::AnalyseOutput {
            tests_file,
            output_dir,
            trials,
            summary,
            json,
            pretty,
        } => {
            let tests = read_tests(&tests_file)?;
            let trials = trials.or(config.runner.trials).unwrap_or(DEFAULT_TRIALS);
            let usecase = AnalyseOutputUseCase::new(FsArtifactStore, SystemClock, tool_info());

            let outcome = usecase.execute(AnalyseRequest {
                tests,
                output_dir,
                trials,
                summary,
            })?;

            if let Some(path) = &json {
                write_json(path, &outcome.report, pretty)?;
            }
            print!("{}", render_tally_csv(&outcome.report.tallies));
            if let Some(summaries) = &outcome.report.summaries {
                println!();
                print!("{}", render_summary_csv(summaries, true));
            }
            Ok(())
        }

        Command::Missing {
            tests_file,
            output_dir,
        } => {
            let tests = read_tests(&tests_file)?;
            let missing = MissingTestsUseCase::new(FsArtifactStore).execute(&tests, &output_dir)?;
            print!("{}", render_missing(&missing));
            Ok(())
        }

        Command::ScrapeLog { log_file, json } => {
            let bytes = fs::read(&log_file).with_context(|| format!("read {}", log_file.display()))?;
            let outcome = scrape_crash_log(&String::from_utf8_lossy(&bytes));
            if outcome.unterminated > 0 {
                tracing::warn!(
                    blocks = outcome.unterminated,
                    "crash blocks without a closing line were discarded"
                );
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.records)?);
            } else {
                print!("{}", render_crash_records(&outcome.records));
            }
            Ok(())
        }
    }
}

fn run_trials(
    config: &ConfigFile,
    tests_file: &Path,
    output_dir: PathBuf,
    runner: RunnerArgs,
    mode: TrialMode,
) -> anyhow::Result<()> {
    let tests = read_tests(tests_file)?;
    let settings = runner_settings(config, runner)?;
    let usecase = TrialRunUseCase::new(StdProcessRunner, FsArtifactStore, settings);

    let outcome = usecase.execute(TrialRunRequest {
        tests,
        output_dir,
        mode,
    })?;

    println!(
        "spawned {}, skipped {} existing, {} timed out",
        outcome.spawned,
        outcome.skipped_existing,
        outcome.timed_out.len()
    );
    for test in &outcome.unrecorded {
        println!("no recording: {test}");
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    use std::io::IsTerminal;
    use tracing_subscriber::EnvFilter;

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .finish();

    // A subscriber may already be installed when embedded; keep the existing one.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn tool_info() -> ToolInfo {
    ToolInfo {
        name: "flakestat".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ConfigFile> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let implicit = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !implicit.is_file() {
                return Ok(ConfigFile::default());
            }
            implicit
        }
    };

    tracing::debug!(path = %path.display(), "loading config");
    let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    parse_config(&text).with_context(|| format!("in {}", path.display()))
}

fn aggregate_request(config: &ConfigFile, args: IngestArgs) -> anyhow::Result<AggregateRequest> {
    let allow_list = match &args.allow_list {
        Some(path) => {
            let lines = read_lines(path).with_context(|| "read allow-list")?;
            Some(lines.into_iter().collect::<BTreeSet<String>>())
        }
        None => None,
    };

    let file_pattern = args
        .pattern
        .or_else(|| config.ingest.file_pattern.clone())
        .unwrap_or_else(|| DEFAULT_FILE_PATTERN.to_string());

    Ok(AggregateRequest {
        input_dir: args.input_dir,
        file_pattern,
        allow_list,
        strict_counts: false,
        subtests: false,
    })
}

fn runner_settings(config: &ConfigFile, args: RunnerArgs) -> anyhow::Result<RunnerSettings> {
    let command = if !args.command.is_empty() {
        Some(args.command)
    } else if let Some(s) = &args.runner {
        let argv = shell_words::split(s).with_context(|| format!("invalid --runner: {s}"))?;
        Some(argv)
    } else {
        None
    };

    let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;

    RunnerSettings::resolve(
        &config.runner,
        RunnerOverrides {
            command,
            cwd: args.cwd,
            trials: args.trials,
            concurrency: args.concurrency,
            timeout,
        },
    )
}

fn read_tests(path: &Path) -> anyhow::Result<Vec<String>> {
    let tests = read_lines(path).with_context(|| "read tests file")?;
    tracing::info!(tests = tests.len(), file = %path.display(), "using tests file");
    Ok(tests)
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let d = humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))?;
    Ok(d)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, pretty: bool) -> anyhow::Result<()> {
    let bytes = if pretty {
        serde_json::to_vec_pretty(value)?
    } else {
        serde_json::to_vec(value)?
    };

    atomic_write(path, &bytes)
}

fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => {
            fs::create_dir_all(p).with_context(|| format!("create dir {}", p.display()))?;
            p
        }
        _ => Path::new("."),
    };

    let mut tmp = parent.to_path_buf();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4()));

    {
        let mut f =
            fs::File::create(&tmp).with_context(|| format!("create temp {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("write temp {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
