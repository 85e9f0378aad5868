//! Per-task extension scripts, run out of process.
//!
//! A task may ship `script.py` (run with the configured python) or an
//! executable named `script`. Every hook call is a separate process:
//!
//! ```text
//! <script> <hook> <request.json> <response.json>     (cwd = task directory)
//! ```
//!
//! `hooks` is called once and must write a JSON array of supported hook
//! names. Any failure disables the script for the rest of the run and is
//! reported as a warning.

use crate::config::catalog::{TestCatalog, TestDefinition};
use crate::config::types::EvalError;
use crate::results::{Metadata, TestResult};
use crate::utils::output::{run_captured, CaptureLimits};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

pub const PYTHON_SCRIPT: &str = "script.py";
pub const EXECUTABLE_SCRIPT: &str = "script";

pub const HOOK_LIST: &str = "hooks";
pub const HOOK_GENERATE_TESTS: &str = "generate_tests";
pub const HOOK_CHECK: &str = "check";

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);
const SCRIPT_OUTPUT_LIMIT: usize = 64 * 1024;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    task_dir: &'a Path,
    tests: Vec<TestDefinition>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GenerateResponse {
    #[serde(default)]
    tests: Vec<TestDefinition>,
}

/// What a `check` hook gets to see besides the result itself
#[derive(Clone, Debug, Serialize)]
pub struct CheckContext<'a> {
    pub task_dir: &'a Path,
    pub step_dir: &'a Path,
    pub test_name: &'a str,
    pub metadata: &'a Metadata,
}

#[derive(Serialize)]
struct CheckRequest<'a> {
    result: &'a TestResult,
    context: &'a CheckContext<'a>,
}

#[derive(Deserialize)]
struct CheckResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    messages: Vec<String>,
}

#[derive(Debug)]
pub struct ScriptHost {
    task_dir: PathBuf,
    argv: Vec<String>,
    hooks: BTreeSet<String>,
    warnings: Vec<String>,
}

impl ScriptHost {
    /// Host without a script; every hook is absent
    pub fn none(task_dir: &Path) -> Self {
        Self {
            task_dir: task_dir.to_path_buf(),
            argv: Vec::new(),
            hooks: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    /// Locate the task's script and perform the `hooks` handshake.
    /// Never fails: problems are recorded as warnings.
    pub fn load(task_dir: &Path, python_bin: &Path) -> Self {
        let mut host = Self::none(task_dir);
        let python = task_dir.join(PYTHON_SCRIPT);
        let executable = task_dir.join(EXECUTABLE_SCRIPT);

        host.argv = if python.is_file() {
            vec![
                python_bin.to_string_lossy().into_owned(),
                python.to_string_lossy().into_owned(),
            ]
        } else if is_executable(&executable) {
            vec![executable.to_string_lossy().into_owned()]
        } else {
            return host;
        };

        match host.invoke(HOOK_LIST, &serde_json::json!({ "task_dir": task_dir })) {
            Ok(value) => match serde_json::from_value::<Vec<String>>(value) {
                Ok(hooks) => {
                    info!("script hooks: {:?}", hooks);
                    host.hooks = hooks.into_iter().collect();
                }
                Err(e) => host.disable(HOOK_LIST, EvalError::Json(e), ""),
            },
            Err((e, trace)) => host.disable(HOOK_LIST, e, &trace),
        }
        host
    }

    pub fn is_loaded(&self) -> bool {
        !self.argv.is_empty()
    }

    pub fn has_hook(&self, hook: &str) -> bool {
        self.hooks.contains(hook)
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Extra test definitions; empty when the hook is absent or failed
    pub fn generate_tests(&mut self, catalog: &TestCatalog) -> Vec<TestDefinition> {
        if !self.has_hook(HOOK_GENERATE_TESTS) {
            return Vec::new();
        }
        let task_dir = self.task_dir.clone();
        let request = GenerateRequest {
            task_dir: &task_dir,
            tests: catalog.definitions(),
        };
        let value = match self.invoke(HOOK_GENERATE_TESTS, &request) {
            Ok(value) => value,
            Err((e, trace)) => {
                self.disable(HOOK_GENERATE_TESTS, e, &trace);
                return Vec::new();
            }
        };
        match serde_json::from_value::<GenerateResponse>(value) {
            Ok(response) => {
                debug!("script generated {} tests", response.tests.len());
                response.tests
            }
            Err(e) => {
                self.disable(HOOK_GENERATE_TESTS, EvalError::Json(e), "");
                Vec::new()
            }
        }
    }

    /// Additional error messages for one test result
    pub fn check(&mut self, result: &TestResult, context: &CheckContext<'_>) -> Vec<String> {
        if !self.has_hook(HOOK_CHECK) {
            return Vec::new();
        }
        let request = CheckRequest { result, context };
        let value = match self.invoke(HOOK_CHECK, &request) {
            Ok(value) => value,
            Err((e, trace)) => {
                self.disable(HOOK_CHECK, e, &trace);
                return Vec::new();
            }
        };
        match serde_json::from_value::<CheckResponse>(value) {
            Ok(response) => response.message.into_iter().chain(response.messages).collect(),
            Err(e) => {
                self.disable(HOOK_CHECK, EvalError::Json(e), "");
                Vec::new()
            }
        }
    }

    fn disable(&mut self, hook: &str, error: EvalError, trace: &str) {
        warn!("script hook {} failed: {}", hook, error);
        let mut message = format!("Script hook '{}' failed: {}", hook, error);
        if !trace.trim().is_empty() {
            message.push('\n');
            message.push_str(trace.trim_end());
        }
        self.warnings.push(message);
        self.hooks.clear();
    }

    /// Run one hook; on failure returns the error plus captured stderr
    fn invoke<T: Serialize>(
        &mut self,
        hook: &str,
        request: &T,
    ) -> std::result::Result<serde_json::Value, (EvalError, String)> {
        let io = tempfile::Builder::new()
            .prefix("kelvin-script-")
            .tempdir()
            .map_err(|e| (EvalError::Io(e), String::new()))?;
        let request_path = io.path().join("request.json");
        let response_path = io.path().join("response.json");

        let payload = serde_json::to_vec(request).map_err(|e| (EvalError::Json(e), String::new()))?;
        fs::write(&request_path, payload).map_err(|e| (EvalError::Io(e), String::new()))?;

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .arg(hook)
            .arg(&request_path)
            .arg(&response_path)
            .current_dir(&self.task_dir);

        let output = run_captured(
            &mut cmd,
            CaptureLimits {
                stream_limit: SCRIPT_OUTPUT_LIMIT,
                timeout: Some(SCRIPT_TIMEOUT),
            },
        )
        .map_err(|e| (e, String::new()))?;

        let stderr = output.stderr.text();
        if output.timed_out {
            return Err((
                EvalError::Script(format!("timed out after {:?}", SCRIPT_TIMEOUT)),
                stderr,
            ));
        }
        if !output.status.success() {
            return Err((
                EvalError::Script(format!("exited with {}", output.status)),
                stderr,
            ));
        }

        let stdout = output.stdout.text();
        if !stdout.trim().is_empty() || !stderr.trim().is_empty() {
            self.warnings.push(format!(
                "Script hook '{}' output:\n{}{}",
                hook, stdout, stderr
            ));
        }

        let response = fs::read(&response_path).map_err(|e| {
            (
                EvalError::Script(format!("no response written: {}", e)),
                String::new(),
            )
        })?;
        serde_json::from_slice(&response).map_err(|e| (EvalError::Json(e), String::new()))
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Fold generated tests into the catalog and renumber it
pub fn enrich_catalog(host: &mut ScriptHost, catalog: &mut TestCatalog, task_dir: &Path) -> usize {
    let generated = host.generate_tests(catalog);
    let count = generated.len();
    for def in generated {
        catalog.upsert(def, task_dir);
    }
    catalog.renumber();
    count
}
