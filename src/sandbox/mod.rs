//! Isolated workspace for running untrusted programs.
//!
//! A [`Sandbox`] owns one fresh workspace for the lifetime of an evaluation
//! run. Files are staged with [`Sandbox::copy`]/[`Sandbox::write`], commands
//! are executed through an [`IsolationBackend`], and outputs are read back
//! with [`Sandbox::read`].

pub mod isolate;
pub mod limits;
pub mod local;

use crate::config::types::{EngineConfig, EvalError, ExecutionLimits, Result, SandboxKind};
use crate::safety::confined;
use crate::safety::safe_cleanup::remove_tree_secure;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub use crate::safety::confined::EntryKind;
pub use isolate::IsolateBackend;
pub use local::LocalBackend;

/// How a sandboxed run ended
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Ok,
    /// Non-zero exit code
    RuntimeError,
    /// Terminated by a signal
    Signaled,
    /// CPU or wall limit hit
    TimedOut,
    /// The isolation layer itself failed
    InternalError,
}

/// Resource usage record of one run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// CPU seconds
    pub cpu_time: f64,
    /// Wall clock seconds
    pub wall_time: f64,
    /// Peak memory (KiB) if the backend reports it
    pub memory_kb: Option<u64>,
    pub status: RunStatus,
    pub message: Option<String>,
}

impl ResourceUsage {
    /// Exit code as seen by the grader; signal deaths count as -1
    pub fn exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }

    /// Result-level errors implied by how the process ended
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.status == RunStatus::TimedOut {
            errors.push("Time limit exceeded".to_string());
        } else if self.signal == Some(libc::SIGSEGV) {
            errors.push("Segmentation fault".to_string());
        } else if let Some(signal) = self.signal {
            errors.push(format!("Killed by signal {}", signal));
        }
        if self.status == RunStatus::InternalError {
            errors.push(
                self.message
                    .clone()
                    .unwrap_or_else(|| "Sandbox failure".to_string()),
            );
        }
        errors
    }
}

/// One command to execute inside the workspace. Paths are workspace-relative.
#[derive(Clone, Debug, Default)]
pub struct RunRequest {
    pub command: Vec<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub env: Vec<(String, String)>,
    pub limits: ExecutionLimits,
}

impl RunRequest {
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured result of [`Sandbox::run_captured`] and [`Sandbox::compile`]
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub usage: ResourceUsage,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn exit_code(&self) -> i32 {
        self.usage.exit_code()
    }

    pub fn success(&self) -> bool {
        self.usage.status == RunStatus::Ok && self.usage.exit_code == Some(0)
    }

    /// stdout followed by stderr, as a user would see it in a terminal
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }
}

/// Mechanism that actually isolates a process
pub trait IsolationBackend: Send {
    fn name(&self) -> &'static str;

    /// Purge stale state and create an empty workspace; returns its host path
    fn init(&mut self) -> Result<PathBuf>;

    fn execute(&mut self, workspace: &Path, request: &RunRequest) -> Result<ResourceUsage>;

    fn cleanup(&mut self) -> Result<()>;
}

/// Build the backend selected by the engine configuration
pub fn backend_for(config: &EngineConfig) -> Box<dyn IsolationBackend> {
    match config.sandbox {
        SandboxKind::Isolate => Box::new(IsolateBackend::new(&config.isolate_bin, config.box_id)),
        SandboxKind::Local => Box::new(LocalBackend::new(&config.scratch_root, config.box_id)),
    }
}

pub struct Sandbox {
    backend: Box<dyn IsolationBackend>,
    workspace: PathBuf,
    capture_seq: u32,
}

impl Sandbox {
    /// Create a fresh sandbox for `config`
    pub fn create(config: &EngineConfig) -> Result<Self> {
        Self::with_backend(backend_for(config))
    }

    pub fn with_backend(mut backend: Box<dyn IsolationBackend>) -> Result<Self> {
        let workspace = backend.init()?;
        info!(
            "initialized {} sandbox at {}",
            backend.name(),
            workspace.display()
        );
        Ok(Self {
            backend,
            workspace,
            capture_seq: 0,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Host path of a workspace-relative path; rejects escapes from the workspace
    pub fn path(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let rel = rel.as_ref();
        let mut out = self.workspace.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(EvalError::Sandbox(format!(
                        "path escapes sandbox: {}",
                        rel.display()
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Create (truncate) a file inside the workspace for writing
    pub fn open(&self, rel: impl AsRef<Path>) -> Result<File> {
        confined::open_write(&self.workspace, rel.as_ref(), 0o644)
    }

    pub fn write(&self, rel: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        self.open(rel)?.write_all(data)?;
        Ok(())
    }

    /// Copy a host file into the workspace, keeping its permissions
    pub fn copy(&self, local: &Path, rel: impl AsRef<Path>) -> Result<()> {
        let rel = rel.as_ref();
        let context = |e: std::io::Error| {
            EvalError::Io(std::io::Error::new(
                e.kind(),
                format!("copy {} -> {}: {}", local.display(), rel.display(), e),
            ))
        };
        let mut src = File::open(local).map_err(context)?;
        let mode = src.metadata().map_err(context)?.permissions().mode() & 0o7777;
        let mut dest = confined::open_write(&self.workspace, rel, mode)?;
        io::copy(&mut src, &mut dest).map_err(context)?;
        dest.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(context)?;
        Ok(())
    }

    /// Copy a workspace file to another workspace path, keeping its permissions
    pub fn copy_within(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let mut src = confined::open_read(&self.workspace, from.as_ref())?;
        let mode = src.metadata()?.permissions().mode() & 0o7777;
        let mut dest = confined::open_write(&self.workspace, to.as_ref(), mode)?;
        io::copy(&mut src, &mut dest)?;
        dest.set_permissions(fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Recursively copy a host directory's contents into the workspace.
    /// Symlinks are skipped.
    pub fn copy_dir(&self, local_dir: &Path, rel: impl AsRef<Path>) -> Result<usize> {
        let rel = rel.as_ref();
        confined::create_dirs(&self.workspace, rel)?;
        let mut copied = 0;
        for entry in WalkDir::new(local_dir).min_depth(1) {
            let entry = entry.map_err(|e| EvalError::Filesystem(e.to_string()))?;
            let rel_path = entry
                .path()
                .strip_prefix(local_dir)
                .map_err(|e| EvalError::Filesystem(e.to_string()))?;
            let dest = rel.join(rel_path);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                confined::create_dirs(&self.workspace, &dest)?;
            } else if file_type.is_file() {
                self.copy(entry.path(), &dest)?;
                copied += 1;
            } else {
                debug!("skipping non-regular file {}", entry.path().display());
            }
        }
        Ok(copied)
    }

    /// Contents of a regular workspace file; symlinks are refused
    pub fn read(&self, rel: impl AsRef<Path>) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        confined::open_read(&self.workspace, rel.as_ref())?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// What is at `rel`, without following symlinks
    pub fn kind(&self, rel: impl AsRef<Path>) -> Result<Option<EntryKind>> {
        confined::entry_kind(&self.workspace, rel.as_ref())
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        matches!(self.kind(rel), Ok(Some(_)))
    }

    /// Unlink a workspace entry; a symlink is removed, never its target
    pub fn remove(&self, rel: impl AsRef<Path>) -> Result<()> {
        confined::remove_file(&self.workspace, rel.as_ref())
    }

    /// Remove a workspace directory tree (or a single entry) without
    /// following symlinks
    pub fn remove_tree(&self, rel: impl AsRef<Path>) -> Result<()> {
        remove_tree_secure(&self.path(rel)?)
    }

    /// Execute a request; redirection paths must be workspace-relative
    pub fn run(&mut self, request: &RunRequest) -> Result<ResourceUsage> {
        if request.command.is_empty() {
            return Err(EvalError::Sandbox("empty command".to_string()));
        }
        debug!("sandbox run: {:?}", request.command);
        for target in [&request.stdout, &request.stderr].into_iter().flatten() {
            self.remove(target)?;
        }
        let usage = self.backend.execute(&self.workspace, request)?;
        debug!(
            "exit={:?} signal={:?} status={:?} cpu={:.3}s wall={:.3}s",
            usage.exit_code, usage.signal, usage.status, usage.cpu_time, usage.wall_time
        );
        Ok(usage)
    }

    /// Fresh workspace-relative names for captured stdout/stderr
    pub fn capture_names(&mut self) -> (String, String) {
        self.capture_seq += 1;
        (
            format!(".kelvin-{}.stdout", self.capture_seq),
            format!(".kelvin-{}.stderr", self.capture_seq),
        )
    }

    /// Run with stdout/stderr captured to unique files and read back as text
    pub fn run_captured(&mut self, mut request: RunRequest) -> Result<CommandOutput> {
        let (out_name, err_name) = self.capture_names();
        request.stdout = Some(out_name.clone());
        request.stderr = Some(err_name.clone());

        let usage = self.run(&request)?;
        let stdout = self.read(&out_name).unwrap_or_default();
        let stderr = self.read(&err_name).unwrap_or_default();
        self.remove(&out_name)?;
        self.remove(&err_name)?;

        Ok(CommandOutput {
            usage,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Run a shell command line through `/bin/sh -c`
    pub fn run_shell(&mut self, line: &str, limits: ExecutionLimits) -> Result<CommandOutput> {
        self.run_captured(RunRequest::new(["/bin/sh", "-c", line]).limits(limits))
    }

    /// Invoke a compiler inside the workspace
    pub fn compile(
        &mut self,
        compiler: &str,
        flags: &[String],
        sources: &[String],
        output: &str,
        limits: ExecutionLimits,
    ) -> Result<CommandOutput> {
        let mut command = vec![compiler.to_string()];
        command.extend(sources.iter().cloned());
        command.push("-o".to_string());
        command.push(output.to_string());
        command.extend(flags.iter().cloned());
        self.run_captured(RunRequest {
            command,
            limits,
            ..Default::default()
        })
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(e) = self.backend.cleanup() {
            warn!("sandbox cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_sandbox(root: &Path) -> Sandbox {
        Sandbox::with_backend(Box::new(LocalBackend::new(root, 0))).unwrap()
    }

    #[test]
    fn path_rejects_escapes() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = local_sandbox(tmp.path());
        assert!(sandbox.path("a/b.txt").is_ok());
        assert!(sandbox.path("./a").is_ok());
        assert!(sandbox.path("../etc/passwd").is_err());
        assert!(sandbox.path("/etc/passwd").is_err());
    }

    #[test]
    fn stage_and_read_files() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("main.c"), "int main(){}").unwrap();
        fs::write(src.join("nested/util.h"), "#pragma once").unwrap();

        let sandbox = local_sandbox(&tmp.path().join("scratch"));
        assert_eq!(sandbox.copy_dir(&src, ".").unwrap(), 2);
        assert!(sandbox.exists("nested/util.h"));
        sandbox.write("data/in.txt", b"42").unwrap();
        assert_eq!(sandbox.read("data/in.txt").unwrap(), b"42");
        sandbox.copy(&src.join("main.c"), "copy.c").unwrap();
        assert_eq!(sandbox.read("copy.c").unwrap(), b"int main(){}");
    }

    #[test]
    fn planted_symlinks_never_reach_the_host() {
        let tmp = tempfile::tempdir().unwrap();
        let secret = tmp.path().join("secret");
        fs::write(&secret, "HOST-SECRET\n").unwrap();
        let sandbox = local_sandbox(&tmp.path().join("scratch"));
        std::os::unix::fs::symlink(&secret, sandbox.workspace().join("out.txt")).unwrap();

        assert!(sandbox.read("out.txt").is_err());
        assert!(sandbox.write("out.txt", b"overwritten").is_err());
        assert_eq!(sandbox.kind("out.txt").unwrap(), Some(EntryKind::Symlink));
        assert_eq!(fs::read_to_string(&secret).unwrap(), "HOST-SECRET\n");

        sandbox.remove("out.txt").unwrap();
        assert!(!sandbox.exists("out.txt"));
        assert!(secret.exists());
        sandbox.write("out.txt", b"fresh").unwrap();
        assert_eq!(sandbox.read("out.txt").unwrap(), b"fresh");
    }

    #[test]
    fn copy_keeps_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = tmp.path().join("tool.sh");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        let sandbox = local_sandbox(&tmp.path().join("scratch"));

        sandbox.copy(&tool, "bin/tool.sh").unwrap();
        sandbox.copy_within("bin/tool.sh", "tool").unwrap();
        let mode = fs::metadata(sandbox.path("tool").unwrap()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn usage_errors() {
        let segv = ResourceUsage {
            signal: Some(11),
            status: RunStatus::Signaled,
            ..Default::default()
        };
        assert_eq!(segv.errors(), vec!["Segmentation fault"]);
        assert_eq!(segv.exit_code(), -1);

        let killed = ResourceUsage {
            signal: Some(9),
            status: RunStatus::Signaled,
            ..Default::default()
        };
        assert_eq!(killed.errors(), vec!["Killed by signal 9"]);

        let timeout = ResourceUsage {
            signal: Some(9),
            status: RunStatus::TimedOut,
            ..Default::default()
        };
        assert_eq!(timeout.errors(), vec!["Time limit exceeded"]);

        assert!(ResourceUsage::default().errors().is_empty());
    }

    #[test]
    fn combined_output_joins_streams() {
        let out = CommandOutput {
            usage: ResourceUsage::default(),
            stdout: "a".to_string(),
            stderr: "b\n".to_string(),
        };
        assert_eq!(out.combined(), "a\nb\n");
    }
}
