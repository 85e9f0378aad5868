/// Generated tests: a task-supplied generator writes stdin for each iteration,
/// an optional reference solution produces the expected stdout.
use super::run_tests::{evaluate_test, TestInvocation};
use super::runner::StepContext;
use crate::config::catalog::{Direction, FileRole, FileSource, Test, TestFile};
use crate::config::types::{EvalError, Result};
use crate::results::{html, PipeResult};
use crate::sandbox::{RunRequest, RunStatus};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Workspace directory holding the generator, the reference and their outputs
const GEN_DIR: &str = ".kelvin-gen";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputGeneratorParams {
    /// Generator program, relative to the task directory
    pub generator: String,
    pub iterations: u32,
    /// Reference solution, relative to the task directory
    pub reference: Option<String>,
    pub executable: String,
    pub args: Vec<String>,
    pub filters: Option<Vec<String>>,
}

impl Default for InputGeneratorParams {
    fn default() -> Self {
        Self {
            generator: String::new(),
            iterations: 10,
            reference: None,
            executable: "./main".to_string(),
            args: Vec::new(),
            filters: None,
        }
    }
}

/// argv running the workspace file `rel`, picking an interpreter by extension
pub fn launcher(rel: &str, python: &str) -> Vec<String> {
    match Path::new(rel).extension().and_then(|e| e.to_str()) {
        Some("py") => vec![python.to_string(), rel.to_string()],
        Some("sh") => vec!["/bin/sh".to_string(), rel.to_string()],
        _ => vec![format!("./{}", rel)],
    }
}

/// Copy a task file into the generator directory, returning its workspace path
fn stage_task_file(ctx: &StepContext<'_>, name: &str) -> Result<String> {
    let host = ctx.task.task_dir.join(name);
    if !host.is_file() {
        return Err(EvalError::Config(format!(
            "{} not found in task directory",
            name
        )));
    }
    let file_name = Path::new(name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let rel = format!("{}/{}", GEN_DIR, file_name);
    ctx.sandbox.copy(&host, &rel)?;
    Ok(rel)
}

/// Run a helper with stdout redirected into the workspace; returns an error
/// message when it did not exit cleanly
fn run_helper(
    ctx: &mut StepContext<'_>,
    command: Vec<String>,
    stdin: Option<String>,
    stdout: &str,
) -> Result<Option<String>> {
    let what = command.join(" ");
    let stderr = format!("{}.stderr", stdout);
    let request = RunRequest {
        command,
        stdin,
        stdout: Some(stdout.to_string()),
        stderr: Some(stderr.clone()),
        limits: ctx.build_limits(),
        ..Default::default()
    };
    let usage = ctx.sandbox.run(&request)?;
    if usage.status == RunStatus::Ok && usage.exit_code == Some(0) {
        return Ok(None);
    }
    let log = String::from_utf8_lossy(&ctx.sandbox.read(&stderr).unwrap_or_default()).into_owned();
    let mut message = format!("'{}' failed with exit code {}", what, usage.exit_code());
    for error in usage.errors() {
        message.push_str(&format!(" ({})", error));
    }
    if !log.trim().is_empty() {
        message.push('\n');
        message.push_str(log.trim_end());
    }
    Ok(Some(message))
}

/// One generated case: stdin plus the reference's stdout, if any
struct GeneratedCase {
    input: Vec<u8>,
    expected: Option<Vec<u8>>,
}

/// Produce every case up front. The submission never runs while the
/// generator or the reference sit in the workspace.
fn generate(
    ctx: &mut StepContext<'_>,
    params: &InputGeneratorParams,
    html_out: &mut String,
) -> Result<Vec<GeneratedCase>> {
    let python = ctx.engine.python_bin.to_string_lossy().into_owned();
    ctx.sandbox.remove_tree(GEN_DIR)?;
    let generator = stage_task_file(ctx, &params.generator)?;
    let reference = match &params.reference {
        Some(name) => Some(stage_task_file(ctx, name)?),
        None => None,
    };

    let mut cases = Vec::new();
    for iteration in 1..=params.iterations {
        let input = format!("{}/input-{}", GEN_DIR, iteration);
        let mut command = launcher(&generator, &python);
        command.push(iteration.to_string());
        if let Some(message) = run_helper(ctx, command, None, &input)? {
            warn!("generator failed at iteration {}", iteration);
            html_out.push_str(&html::error(&format!(
                "Input generator failed at iteration {}: {}",
                iteration, message
            )));
            break;
        }

        let expected = match &reference {
            Some(reference) => {
                let expected = format!("{}/expected-{}", GEN_DIR, iteration);
                let command = launcher(reference, &python);
                if let Some(message) = run_helper(ctx, command, Some(input.clone()), &expected)? {
                    html_out.push_str(&html::error(&format!(
                        "Reference solution failed at iteration {}: {}",
                        iteration, message
                    )));
                    break;
                }
                Some(ctx.sandbox.read(&expected)?)
            }
            None => None,
        };
        cases.push(GeneratedCase {
            input: ctx.sandbox.read(&input)?,
            expected,
        });
    }

    ctx.sandbox.remove_tree(GEN_DIR)?;
    Ok(cases)
}

pub fn run(ctx: &mut StepContext<'_>, params: &InputGeneratorParams) -> Result<PipeResult> {
    let mut pipe = ctx.new_pipe();
    let mut errors = String::new();
    let cases = generate(ctx, params, &mut errors)?;
    let incomplete = cases.len() < params.iterations as usize;

    for (index, case) in cases.into_iter().enumerate() {
        let iteration = index + 1;
        let mut test = Test::new(format!("gen{}", iteration));
        test.title = format!("Generated input #{}", iteration);
        test.args = params.args.clone();
        test.ordinal = iteration;
        test.files.insert(
            FileRole::Stdin,
            TestFile {
                source: FileSource::Buffer(case.input),
                direction: Direction::Input,
            },
        );
        if let Some(expected) = case.expected {
            test.files.insert(
                FileRole::Stdout,
                TestFile {
                    source: FileSource::Buffer(expected),
                    direction: Direction::Output,
                },
            );
        }
        debug!("generated test {}", test.name);

        let invocation = TestInvocation {
            test: &test,
            program: vec![params.executable.clone()],
            limits: ctx.test_limits(&test),
            env: Vec::new(),
            filters: ctx.filter_chain(params.filters.as_ref(), &test),
            label: test.name.clone(),
        };
        let result = evaluate_test(ctx, &invocation)?;
        pipe.tests.push(result);
    }

    info!(
        "{} of {} generated tests passed",
        pipe.passed_tests(),
        pipe.tests.len()
    );
    pipe.html = format!("{}{}", html::test_summary(&pipe.tests), errors);
    pipe.failed = incomplete || pipe.passed_tests() != pipe.tests.len();
    Ok(pipe)
}
