/// On-disk result directory.
///
/// Artifact bytes and the in-memory summary are updated by separate calls:
/// [`ResultStore::persist_artifact`] only writes files, [`ResultStore::record_pipe`]
/// only updates the manifest held in memory, and [`ResultStore::flush`] writes
/// that manifest atomically.
use super::types::{EvaluationResult, Metadata, PipeResult};
use crate::config::types::{EvalError, Result};
use crate::safety::safe_cleanup::reset_dir;
use chrono::Utc;
use log::debug;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "result.json";

/// Write via temp file + fsync + rename so readers never see a torn manifest
fn atomic_write(target: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent dir"))?;
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        target.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));

    {
        let mut f = fs::File::create(&temp_path)?;
        f.write_all(content)?;
        f.sync_all()?;
    }
    fs::rename(&temp_path, target)?;
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

pub struct ResultStore {
    root: PathBuf,
    result: EvaluationResult,
}

impl ResultStore {
    /// Purge anything left at `root` by a previous run and start a new manifest
    pub fn create(root: &Path, metadata: Metadata) -> Result<Self> {
        reset_dir(root)?;
        let run_id = Uuid::new_v4().to_string();
        debug!("result store {} at {}", run_id, root.display());
        Ok(Self {
            root: root.to_path_buf(),
            result: EvaluationResult::new(run_id, metadata),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Per-step artifact directory `{root}/{id}`
    pub fn step_dir(&self, step_id: usize) -> PathBuf {
        self.root.join(step_id.to_string())
    }

    /// Write `bytes` as `{root}/{step_id}/{name}` and return `name`
    pub fn persist_artifact(&self, step_id: usize, name: &str, bytes: &[u8]) -> Result<String> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(EvalError::Filesystem(format!(
                "invalid artifact name: {:?}",
                name
            )));
        }
        let dir = self.step_dir(step_id);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(name), bytes)?;
        Ok(name.to_string())
    }

    pub fn record_pipe(&mut self, pipe: PipeResult) {
        self.result.pipes.push(pipe);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.result.warnings.push(message.into());
    }

    pub fn extend_warnings(&mut self, warnings: impl IntoIterator<Item = String>) {
        self.result.warnings.extend(warnings);
    }

    pub fn result(&self) -> &EvaluationResult {
        &self.result
    }

    /// Atomically (re)write the manifest from the in-memory summary
    pub fn flush(&self) -> Result<PathBuf> {
        let path = self.manifest_path();
        let json = serde_json::to_vec_pretty(&self.result)?;
        atomic_write(&path, &json).map_err(|e| {
            EvalError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot write {}: {}", path.display(), e),
            ))
        })?;
        Ok(path)
    }

    /// Stamp the finish time, write the final manifest and hand back the result
    pub fn finish(mut self) -> Result<EvaluationResult> {
        self.result.finished_at = Some(Utc::now());
        self.flush()?;
        Ok(self.result)
    }
}

/// Load a manifest written by [`ResultStore::flush`]
pub fn load_manifest(root: &Path) -> Result<EvaluationResult> {
    let data = fs::read(root.join(MANIFEST_FILE))?;
    Ok(serde_json::from_slice(&data)?)
}
