/// Steps delegated to a docker image.
///
/// The sandbox workspace is mounted read-write at `/work`; a task's
/// `template/` directory, when present, is mounted read-only at `/template`.
/// Whatever the image prints is shown in the report and scanned for
/// diagnostics.
use super::diagnostics;
use super::runner::StepContext;
use crate::config::types::{EvalError, NetworkMode, Result};
use crate::results::{html, PipeResult};
use crate::utils::output::{run_captured, CaptureLimits, DEFAULT_CAPTURE_LIMIT};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use uuid::Uuid;

pub const WORK_MOUNT: &str = "/work";
pub const TEMPLATE_MOUNT: &str = "/template";
pub const TEMPLATE_DIR: &str = "template";
/// Environment variable carrying the step's extra parameters as JSON
pub const PARAMS_ENV: &str = "KELVIN_PARAMS";

const DEFAULT_CONTAINER_TIMEOUT: f64 = 300.0;
const KILL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerParams {
    pub image: String,
    /// Overrides the image's default command
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Free-form parameters handed to the image
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub network: bool,
}

/// Full `docker run` argv (without the docker binary itself)
pub fn docker_args(ctx: &StepContext<'_>, params: &ContainerParams, name: &str) -> Vec<String> {
    let limits = ctx.limits();
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        format!("--name={}", name),
        "-v".to_string(),
        format!("{}:{}", ctx.sandbox.workspace().display(), WORK_MOUNT),
        "-w".to_string(),
        WORK_MOUNT.to_string(),
    ];

    let template = ctx.task.task_dir.join(TEMPLATE_DIR);
    if template.is_dir() {
        args.push("-v".to_string());
        args.push(format!("{}:{}:ro", template.display(), TEMPLATE_MOUNT));
    }
    if !params.network && limits.network != Some(NetworkMode::Shared) {
        args.push("--network=none".to_string());
    }
    if let Some(memory) = limits.memory {
        args.push(format!("--memory={}", memory));
    }

    for (key, value) in &params.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    if !params.options.is_null() {
        args.push("-e".to_string());
        args.push(format!("{}={}", PARAMS_ENV, params.options));
    }

    args.push(params.image.clone());
    if let Some(command) = &params.command {
        args.extend(command.iter().cloned());
    }
    args
}

fn container_name() -> String {
    format!("kelvin-{}", Uuid::new_v4().simple())
}

/// Wall limit of a container step; never below the default
fn container_timeout(wall_time: Option<f64>) -> Duration {
    let default = Duration::from_secs_f64(DEFAULT_CONTAINER_TIMEOUT);
    wall_time
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map_or(default, |limit| limit.max(default))
}

/// Killing the docker client leaves the container running
fn kill_container(docker_bin: &Path, name: &str) {
    warn!("container {} timed out, killing it", name);
    let result = run_captured(
        Command::new(docker_bin).args(["kill", name]),
        CaptureLimits {
            stream_limit: 4096,
            timeout: Some(KILL_TIMEOUT),
        },
    );
    match result {
        Ok(out) if out.success() => {}
        Ok(out) => warn!("docker kill {}: {}", name, out.stderr.text().trim()),
        Err(e) => warn!("docker kill {}: {}", name, e),
    }
}

pub fn run(ctx: &mut StepContext<'_>, params: &ContainerParams) -> Result<PipeResult> {
    let mut pipe = ctx.new_pipe();
    let name = container_name();
    let args = docker_args(ctx, params, &name);
    let timeout = container_timeout(ctx.limits().wall_time);

    info!("running image {}", params.image);
    debug!("{} {:?}", ctx.engine.docker_bin.display(), args);
    let mut cmd = Command::new(&ctx.engine.docker_bin);
    cmd.args(&args);
    let output = run_captured(
        &mut cmd,
        CaptureLimits {
            stream_limit: DEFAULT_CAPTURE_LIMIT,
            timeout: Some(timeout),
        },
    )
    .map_err(|e| EvalError::Container(format!("cannot run {}: {}", params.image, e)))?;
    if output.timed_out {
        kill_container(&ctx.engine.docker_bin, &name);
    }

    let stdout = output.stdout.text();
    let stderr = output.stderr.text();
    let mut combined = stdout.clone();
    combined.push_str(&stderr);

    let count = diagnostics::attach(&mut pipe, &combined, &params.image);
    debug!("{}: {} diagnostics", params.image, count);

    let exit_code = output.status.code().unwrap_or(-1);
    pipe.html = html::command_block(&format!("docker run {}", params.image), Some(&combined), exit_code);
    if output.timed_out {
        pipe.html.push_str(&html::error(&format!(
            "Container exceeded {} seconds",
            timeout.as_secs()
        )));
    }
    pipe.failed = !output.success();
    Ok(pipe)
}
