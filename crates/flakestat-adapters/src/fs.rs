//! Filesystem access: run artifacts, report directories and list files.

use crate::AdapterError;
use flakestat_types::WptReport;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where orchestration commands keep per-trial output, recordings and the
/// timeout file.
pub trait ArtifactStore: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn read(&self, path: &Path) -> Result<Vec<u8>, AdapterError>;
    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), AdapterError>;
    fn append_line(&self, path: &Path, line: &str) -> Result<(), AdapterError>;

    /// Removing a path that does not exist is not an error.
    fn remove(&self, path: &Path) -> Result<(), AdapterError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), AdapterError>;
}

#[derive(Debug, Default, Clone)]
pub struct FsArtifactStore;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AdapterError + '_ {
    move |source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ArtifactStore for FsArtifactStore {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, AdapterError> {
        fs::read(path).map_err(io_err(path))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), AdapterError> {
        fs::write(path, contents).map_err(io_err(path))
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), AdapterError> {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err(path))?;
        writeln!(f, "{line}").map_err(io_err(path))
    }

    fn remove(&self, path: &Path) -> Result<(), AdapterError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(path)(e)),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), AdapterError> {
        fs::create_dir_all(path).map_err(io_err(path))
    }
}

#[derive(Debug, Clone)]
pub struct LoadedReport {
    pub path: PathBuf,
    pub report: WptReport,
}

/// A directory of wptreport JSON files.
pub trait ReportSource {
    /// Every file in `dir` matching `pattern`, parsed, in sorted path order.
    fn load(&self, dir: &Path, pattern: &str) -> Result<Vec<LoadedReport>, AdapterError>;
}

#[derive(Debug, Default, Clone)]
pub struct FsReportSource;

impl ReportSource for FsReportSource {
    fn load(&self, dir: &Path, pattern: &str) -> Result<Vec<LoadedReport>, AdapterError> {
        if !dir.is_dir() {
            return Err(AdapterError::Io {
                path: dir.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            });
        }

        // Only `pattern` is a glob; the directory is taken literally.
        let full = Path::new(&glob::Pattern::escape(&dir.to_string_lossy())).join(pattern);
        let full = full.to_string_lossy();
        let entries = glob::glob(&full).map_err(|source| AdapterError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| AdapterError::Io {
                path: e.path().to_path_buf(),
                source: e.into_error(),
            })?;
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            tracing::debug!(path = %path.display(), "reading report");
            let bytes = fs::read(&path).map_err(io_err(&path))?;
            let report: WptReport =
                serde_json::from_slice(&bytes).map_err(|source| AdapterError::Parse {
                    path: path.clone(),
                    source,
                })?;
            out.push(LoadedReport { path, report });
        }
        Ok(out)
    }
}

/// Non-blank lines of a list file, trimmed.
pub fn read_lines(path: &Path) -> Result<Vec<String>, AdapterError> {
    let text = fs::read_to_string(path).map_err(io_err(path))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
