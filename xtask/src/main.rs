use anyhow::Context;
use clap::{Parser, Subcommand};
use schemars::schema_for;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "xtask", about = "Repo automation for flakestat")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// (Re)generate JSON Schemas for reports and config.
    Schema {
        /// Output directory
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },

    /// Check that every results fixture parses as a harness report.
    Fixtures {
        #[arg(long, default_value = "crates/flakestat-cli/tests/fixtures/results")]
        dir: PathBuf,
    },

    /// Run the "usual" repo checks (fmt, clippy, test, fixtures, schema).
    Ci,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Schema { out_dir } => cmd_schema(&out_dir),
        Command::Fixtures { dir } => cmd_fixtures(&dir),
        Command::Ci => cmd_ci(),
    }
}

fn cmd_ci() -> anyhow::Result<()> {
    run("cargo", ["fmt", "--all", "--", "--check"])?;
    run(
        "cargo",
        ["clippy", "--all-targets", "--all-features", "--", "-D", "warnings"],
    )?;
    run("cargo", ["test", "--workspace"])?;
    run("cargo", ["run", "-p", "xtask", "--", "fixtures"])?;
    run("cargo", ["run", "-p", "xtask", "--", "schema"])?;
    Ok(())
}

fn run<const N: usize>(bin: &str, args: [&str; N]) -> anyhow::Result<()> {
    let status = std::process::Command::new(bin)
        .args(args)
        .status()
        .with_context(|| format!("running {bin}"))?;
    if !status.success() {
        anyhow::bail!("{bin} failed: {status}");
    }
    Ok(())
}

fn cmd_fixtures(dir: &Path) -> anyhow::Result<()> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in &paths {
        let text =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let report: flakestat_types::WptReport = serde_json::from_str(&text)
            .with_context(|| format!("parse {}", path.display()))?;
        println!("{}: {} entries", path.display(), report.results.len());
    }

    if paths.is_empty() {
        anyhow::bail!("no results fixtures under {}", dir.display());
    }
    Ok(())
}

fn cmd_schema(out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("create dir {}", out_dir.display()))?;

    write_schema(
        out_dir,
        "flakestat.summary.v1.schema.json",
        schema_for!(flakestat_types::SummaryReport),
    )?;

    write_schema(
        out_dir,
        "flakestat.tally.v1.schema.json",
        schema_for!(flakestat_types::TallyReport),
    )?;

    write_schema(
        out_dir,
        "flakestat.crash.v1.schema.json",
        schema_for!(Vec<flakestat_types::CrashRecord>),
    )?;

    write_schema(
        out_dir,
        "flakestat.config.v1.schema.json",
        schema_for!(flakestat_types::ConfigFile),
    )?;

    Ok(())
}

fn write_schema<T: serde::Serialize>(out_dir: &Path, name: &str, schema: T) -> anyhow::Result<()> {
    let path = out_dir.join(name);
    let json = serde_json::to_vec_pretty(&schema)?;
    fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
