/// Backend driving the external `isolate` tool
use super::limits::isolate_args;
use super::{IsolationBackend, ResourceUsage, RunRequest, RunStatus};
use crate::config::types::{EvalError, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub struct IsolateBackend {
    bin: PathBuf,
    box_id: u32,
    initialized: bool,
}

impl IsolateBackend {
    pub fn new(bin: &Path, box_id: u32) -> Self {
        Self {
            bin: bin.to_path_buf(),
            box_id,
            initialized: false,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg(format!("--box-id={}", self.box_id)).arg("--cg");
        cmd
    }

    fn invoke(&self, action: &str) -> Result<String> {
        let output = self.command().arg(action).output().map_err(|e| {
            EvalError::Sandbox(format!("cannot execute {}: {}", self.bin.display(), e))
        })?;
        if !output.status.success() {
            return Err(EvalError::Sandbox(format!(
                "isolate {} failed: {}",
                action,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Arguments for `isolate --run`, excluding the binary and box selection
    pub fn run_args(request: &RunRequest, meta: &Path) -> Vec<String> {
        let mut args = vec!["--run".to_string(), format!("--meta={}", meta.display())];
        args.extend(isolate_args(&request.limits));
        if let Some(stdin) = &request.stdin {
            args.push(format!("--stdin={}", stdin));
        }
        if let Some(stdout) = &request.stdout {
            args.push(format!("--stdout={}", stdout));
        }
        if let Some(stderr) = &request.stderr {
            args.push(format!("--stderr={}", stderr));
        }
        args.push(format!("--env=PATH={}", SANDBOX_PATH));
        args.push("--env=HOME=/box".to_string());
        for (key, value) in &request.env {
            args.push(format!("--env={}={}", key, value));
        }
        args.push("--".to_string());
        args.extend(request.command.iter().cloned());
        args
    }
}

/// Parse an isolate meta file (`key:value` lines)
pub fn parse_meta(text: &str) -> ResourceUsage {
    let mut usage = ResourceUsage::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "time" => usage.cpu_time = value.parse().unwrap_or(0.0),
            "time-wall" => usage.wall_time = value.parse().unwrap_or(0.0),
            "max-rss" | "cg-mem" => {
                if let Ok(kb) = value.parse::<u64>() {
                    usage.memory_kb = Some(usage.memory_kb.map_or(kb, |m| m.max(kb)));
                }
            }
            "exitcode" => usage.exit_code = value.parse().ok(),
            "exitsig" => usage.signal = value.parse().ok(),
            "message" => usage.message = Some(value.to_string()),
            "status" => {
                usage.status = match value {
                    "RE" => RunStatus::RuntimeError,
                    "SG" => RunStatus::Signaled,
                    "TO" => RunStatus::TimedOut,
                    "XX" => RunStatus::InternalError,
                    other => {
                        debug!("unknown isolate status {}", other);
                        RunStatus::InternalError
                    }
                }
            }
            _ => {}
        }
    }
    if usage.exit_code.is_none() && usage.signal.is_none() && usage.status == RunStatus::Ok {
        usage.exit_code = Some(0);
    }
    usage
}

impl IsolationBackend for IsolateBackend {
    fn name(&self) -> &'static str {
        "isolate"
    }

    fn init(&mut self) -> Result<PathBuf> {
        if let Err(e) = self.invoke("--cleanup") {
            debug!("pre-init cleanup of box {}: {}", self.box_id, e);
        }
        let root = self.invoke("--init")?;
        let root = root.trim();
        if root.is_empty() {
            return Err(EvalError::Sandbox(
                "isolate --init did not report a box path".to_string(),
            ));
        }
        self.initialized = true;
        Ok(Path::new(root).join("box"))
    }

    fn execute(&mut self, _workspace: &Path, request: &RunRequest) -> Result<ResourceUsage> {
        let meta = tempfile::Builder::new()
            .prefix("kelvin-meta-")
            .tempfile()?;
        let args = Self::run_args(request, meta.path());
        let output = self.command().args(&args).output().map_err(|e| {
            EvalError::Sandbox(format!("cannot execute {}: {}", self.bin.display(), e))
        })?;

        // 0 = ok, 1 = program failed; anything else is isolate's own failure
        match output.status.code() {
            Some(0) | Some(1) => {}
            _ => {
                return Err(EvalError::Sandbox(format!(
                    "isolate --run failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        }

        let text = fs::read_to_string(meta.path())?;
        Ok(parse_meta(&text))
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;
        self.invoke("--cleanup").map(|_| ()).map_err(|e| {
            warn!("isolate cleanup of box {} failed", self.box_id);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ExecutionLimits;

    #[test]
    fn parse_meta_segfault() {
        let usage = parse_meta(
            "time:0.012\ntime-wall:0.050\nmax-rss:1544\nexitsig:11\nstatus:SG\nmessage:Caught fatal signal 11\n",
        );
        assert_eq!(usage.signal, Some(11));
        assert_eq!(usage.status, RunStatus::Signaled);
        assert_eq!(usage.memory_kb, Some(1544));
        assert_eq!(usage.errors(), vec!["Segmentation fault"]);
    }

    #[test]
    fn parse_meta_clean_exit() {
        let usage = parse_meta("time:0.001\ntime-wall:0.010\nmax-rss:900\n");
        assert_eq!(usage.exit_code, Some(0));
        assert_eq!(usage.status, RunStatus::Ok);
        assert!((usage.cpu_time - 0.001).abs() < 1e-9);
    }

    #[test]
    fn parse_meta_timeout() {
        let usage = parse_meta("status:TO\nmessage:Time limit exceeded\nkilled:1\n");
        assert_eq!(usage.status, RunStatus::TimedOut);
        assert_eq!(usage.errors(), vec!["Time limit exceeded"]);
    }

    #[test]
    fn run_args_layout() {
        let request = RunRequest {
            command: vec!["./main".to_string(), "x".to_string()],
            stdin: Some("t.in".to_string()),
            stdout: Some(".kelvin-1.stdout".to_string()),
            stderr: None,
            env: vec![("SEED".to_string(), "3".to_string())],
            limits: ExecutionLimits {
                time: Some(2.0),
                ..Default::default()
            },
        };
        let args = IsolateBackend::run_args(&request, Path::new("/tmp/meta"));
        assert_eq!(args[0], "--run");
        assert_eq!(args[1], "--meta=/tmp/meta");
        assert!(args.contains(&"--time=2".to_string()));
        assert!(args.contains(&"--stdin=t.in".to_string()));
        assert!(args.contains(&"--env=SEED=3".to_string()));
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..], &["./main", "x"]);
    }
}
