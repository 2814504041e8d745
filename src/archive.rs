//! Run archive - keep finished run results for audit and `history`
//!
//! One pretty-printed JSON file per run, plus a `latest.json` pointer to the
//! most recent one. Entries are write-once: a run id that maps onto an
//! existing file is refused rather than replacing it.

use crate::core::RunResult;
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const LATEST: &str = "latest";

/// Directory of archived [`RunResult`]s
#[derive(Debug, Clone)]
pub struct RunArchive {
    dir: PathBuf,
}

impl RunArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<local data dir>/starpipe/runs`
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("starpipe")
            .join("runs")
    }

    pub fn open_default() -> Self {
        Self::new(Self::default_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(run_id)))
    }

    /// Write `result` and point `latest.json` at it
    pub fn save(&self, result: &RunResult) -> Result<PathBuf> {
        let stem = file_stem(&result.run_id);
        if stem == LATEST {
            anyhow::bail!("Run id '{}' is reserved by the archive", result.run_id);
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create archive {}", self.dir.display()))?;

        let path = self.path_for(&result.run_id);
        let json = serde_json::to_string_pretty(result)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = self
                    .read(&path)
                    .map(|run| run.run_id)
                    .unwrap_or_else(|_| "an unreadable entry".to_string());
                anyhow::bail!(
                    "Cannot archive run '{}': {} already holds run '{}'",
                    result.run_id,
                    path.display(),
                    holder
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", path.display()))
            }
        };
        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;

        let latest_path = self.path_for(LATEST);
        let _ = fs::remove_file(&latest_path); // Ignore if doesn't exist
        #[cfg(unix)]
        {
            use std::os::unix::fs as unix_fs;
            if let Some(name) = path.file_name() {
                unix_fs::symlink(name, &latest_path)?;
            }
        }
        #[cfg(not(unix))]
        fs::copy(&path, &latest_path)?;

        log::debug!("Archived run {} to {}", result.run_id, path.display());
        Ok(path)
    }

    pub fn load(&self, run_id: &str) -> Result<RunResult> {
        let path = self.path_for(run_id);
        if !path.exists() {
            anyhow::bail!("No archived run '{}' in {}", run_id, self.dir.display());
        }
        let result = self.read(&path)?;
        if result.run_id != run_id {
            anyhow::bail!(
                "No archived run '{}' in {} ({} holds run '{}')",
                run_id,
                self.dir.display(),
                path.display(),
                result.run_id
            );
        }
        Ok(result)
    }

    /// Most recently saved run
    pub fn latest(&self) -> Result<RunResult> {
        let path = self.path_for(LATEST);
        if !path.exists() {
            anyhow::bail!("No runs archived in {}", self.dir.display());
        }
        self.read(&path)
    }

    fn read(&self, path: &Path) -> Result<RunResult> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Corrupt archive entry {}", path.display()))
    }

    /// Every archived run, newest first. Unreadable entries are skipped.
    pub fn list(&self) -> Result<Vec<RunResult>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if path.file_stem().and_then(|s| s.to_str()) == Some(LATEST) {
                continue;
            }
            match self.read(&path) {
                Ok(run) => runs.push(run),
                Err(e) => log::warn!("Skipping archive entry {}: {}", path.display(), e),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}

/// Run ids may come from the command line; keep them to one path component
fn file_stem(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
