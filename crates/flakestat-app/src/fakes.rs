//! In-memory adapters for use-case tests.

use crate::Clock;
use flakestat_adapters::{
    AdapterError, ArtifactStore, CommandSpec, LoadedReport, ProcessRunner, ReportSource, RunResult,
};
use flakestat_types::WptReport;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct FixedClock;

impl Clock for FixedClock {
    fn now_rfc3339(&self) -> String {
        "2024-01-01T00:00:00Z".to_string()
    }
}

#[derive(Default)]
pub struct MemStore {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemStore {
    pub fn with(self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), contents.as_bytes().to_vec());
        self
    }

    pub fn text(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path.as_ref())
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Independent copy, for handing one run's artifacts to the next use case.
    pub fn snapshot(&self) -> Self {
        Self {
            files: Mutex::new(self.files.lock().unwrap().clone()),
        }
    }
}

impl ArtifactStore for MemStore {
    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, AdapterError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| AdapterError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            })
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), AdapterError> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), AdapterError> {
        let mut files = self.files.lock().unwrap();
        let buf = files.entry(path.to_path_buf()).or_default();
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), AdapterError> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    fn create_dir_all(&self, _path: &Path) -> Result<(), AdapterError> {
        Ok(())
    }
}

type Respond = dyn Fn(&CommandSpec, usize) -> RunResult + Send + Sync;

/// Answers each spawn with `respond(spec, nth call for that argv)`.
pub struct ScriptedRunner {
    respond: Box<Respond>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new(respond: impl Fn(&CommandSpec, usize) -> RunResult + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError> {
        let nth = {
            let mut calls = self.calls.lock().unwrap();
            let nth = calls.iter().filter(|c| c.argv == spec.argv).count();
            calls.push(spec.clone());
            nth
        };
        Ok((self.respond)(spec, nth))
    }
}

pub fn exited(code: i32, stdout: &str) -> RunResult {
    RunResult {
        wall_ms: 10,
        exit_code: code,
        timed_out: false,
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

pub fn killed(stdout: &str) -> RunResult {
    RunResult {
        timed_out: true,
        exit_code: -1,
        ..exited(-1, stdout)
    }
}

#[derive(Default)]
pub struct MemReports {
    pub reports: Vec<(PathBuf, String)>,
}

impl MemReports {
    pub fn with(mut self, name: &str, json: &str) -> Self {
        self.reports.push((PathBuf::from(name), json.to_string()));
        self
    }
}

impl ReportSource for MemReports {
    fn load(&self, _dir: &Path, _pattern: &str) -> Result<Vec<LoadedReport>, AdapterError> {
        let mut out = Vec::new();
        for (path, json) in &self.reports {
            let report: WptReport =
                serde_json::from_str(json).map_err(|source| AdapterError::Parse {
                    path: path.clone(),
                    source,
                })?;
            out.push(LoadedReport {
                path: path.clone(),
                report,
            });
        }
        Ok(out)
    }
}
