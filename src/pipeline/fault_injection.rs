/// Allocation failure injection.
///
/// The submission is rebuilt with `malloc` wrapped by a small shim that
/// returns `NULL` for the N-th allocation (N taken from the environment).
/// Every test is then run once per N in `1..=max_fails`; a run fails when the
/// program dies from a signal instead of handling the failure, unless the
/// death was an abort raised by an instrumentation tool on its own behalf.
use super::build::{compiler_for, discover_sources};
use super::run_tests::{artifact_part, stage_inputs};
use super::runner::StepContext;
use crate::config::catalog::Test;
use crate::config::types::Result;
use crate::results::{html, PipeResult, TestResult};
use crate::sandbox::{RunRequest, RunStatus};
use log::{debug, info};
use serde::{Deserialize, Serialize};

pub const FAIL_AT_ENV: &str = "KELVIN_MALLOC_FAIL_AT";
const WRAPPER_SOURCE_NAME: &str = ".kelvin-malloc-wrapper.c";

pub const WRAPPER_SOURCE: &str = r#"#include <stddef.h>
#include <stdlib.h>

void *__real_malloc(size_t size);

static long kelvin_calls = 0;
static long kelvin_fail_at = -1;

void *__wrap_malloc(size_t size)
{
    if (kelvin_fail_at < 0) {
        const char *env = getenv("KELVIN_MALLOC_FAIL_AT");
        kelvin_fail_at = env ? atol(env) : 0;
    }
    kelvin_calls++;
    if (kelvin_fail_at > 0 && kelvin_calls == kelvin_fail_at) {
        return NULL;
    }
    return __real_malloc(size);
}
"#;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FaultInjectionParams {
    pub max_fails: u32,
    pub compiler: Option<String>,
    pub flags: Vec<String>,
    pub ldflags: Vec<String>,
    pub sources: Vec<String>,
    pub output: String,
    /// stderr substrings identifying an instrumentation abort (`SIGABRT` only)
    pub markers: Vec<String>,
}

impl Default for FaultInjectionParams {
    fn default() -> Self {
        Self {
            max_fails: 5,
            compiler: None,
            flags: vec!["-g".to_string()],
            ldflags: vec!["-lm".to_string()],
            sources: Vec::new(),
            output: "main_malloc_fail".to_string(),
            markers: vec![
                "ERROR: AddressSanitizer: allocator is out of memory".to_string(),
                "ERROR: AddressSanitizer: requested allocation size".to_string(),
                "ERROR: LeakSanitizer: detected memory leaks".to_string(),
            ],
        }
    }
}

/// Sanitizer reports of a real crash; these never count as handled
const CRASH_REPORTS: &[&str] = &[
    "SEGV on unknown address",
    "BUS on unknown address",
    "stack-overflow on address",
    "attempting double-free",
    "heap-use-after-free",
];

/// Whether a signal death should count as handled
pub fn is_instrumentation_abort(signal: Option<i32>, stderr: &str, markers: &[String]) -> bool {
    signal == Some(libc::SIGABRT)
        && !CRASH_REPORTS.iter().any(|report| stderr.contains(report))
        && markers.iter().any(|m| !m.is_empty() && stderr.contains(m.as_str()))
}

fn run_once(
    ctx: &mut StepContext<'_>,
    params: &FaultInjectionParams,
    test: &Test,
    fail_at: u32,
) -> Result<TestResult> {
    let label = format!("{}.malloc{}", artifact_part(&test.name), fail_at);
    let mut result = TestResult::new(
        format!("{}#{}", test.name, fail_at),
        format!("{} (allocation {} fails)", test.title, fail_at),
    );

    let stdin = stage_inputs(ctx, test, &label)?;
    let (stdout_name, stderr_name) = ctx.sandbox.capture_names();
    let mut command = vec![format!("./{}", params.output)];
    command.extend(test.args.iter().cloned());
    let request = RunRequest {
        command: command.clone(),
        stdin,
        stdout: Some(stdout_name.clone()),
        stderr: Some(stderr_name.clone()),
        env: vec![(FAIL_AT_ENV.to_string(), fail_at.to_string())],
        limits: ctx.test_limits(test),
    };
    let usage = ctx.sandbox.run(&request)?;
    let stderr = String::from_utf8_lossy(&ctx.sandbox.read(&stderr_name).unwrap_or_default())
        .into_owned();

    let crashed = usage.signal.is_some() || usage.status == RunStatus::TimedOut;
    if crashed {
        if is_instrumentation_abort(usage.signal, &stderr, &params.markers) {
            debug!("{}: instrumentation abort, counted as handled", label);
        } else {
            for error in usage.errors() {
                result.error(error);
            }
            ctx.persist(&format!("{}.stderr", label), stderr.as_bytes())?;
        }
    }
    if usage.status == RunStatus::InternalError {
        result.errors.extend(usage.errors());
    }

    result.command = command;
    result.exit_code = usage.exit_code;
    result.usage = Some(usage);
    ctx.sandbox.remove(&stdout_name)?;
    ctx.sandbox.remove(&stderr_name)?;
    result.finalize();
    Ok(result)
}

pub fn run(ctx: &mut StepContext<'_>, params: &FaultInjectionParams) -> Result<PipeResult> {
    let mut pipe = ctx.new_pipe();

    let mut sources = if params.sources.is_empty() {
        discover_sources(ctx.sandbox.workspace())
    } else {
        params.sources.clone()
    };
    if sources.is_empty() {
        pipe.html = html::error("No source files found");
        pipe.failed = true;
        return Ok(pipe);
    }
    let compiler = compiler_for(
        &super::BuildParams {
            compiler: params.compiler.clone(),
            ..Default::default()
        },
        &sources,
    );

    ctx.sandbox.write(WRAPPER_SOURCE_NAME, WRAPPER_SOURCE.as_bytes())?;
    sources.push(WRAPPER_SOURCE_NAME.to_string());
    let mut flags = params.flags.clone();
    flags.push("-Wl,--wrap=malloc".to_string());
    flags.extend(params.ldflags.iter().cloned());

    let limits = ctx.build_limits();
    let build = ctx
        .sandbox
        .compile(&compiler, &flags, &sources, &params.output, limits)?;
    if !build.success() {
        pipe.html = html::command_block(
            &format!("{} ... -Wl,--wrap=malloc", compiler),
            Some(&build.combined()),
            build.exit_code(),
        );
        pipe.html
            .push_str(&html::error("Build with allocation wrapper failed"));
        pipe.failed = true;
        return Ok(pipe);
    }

    let task = ctx.task;
    for test in &task.catalog {
        for fail_at in 1..=params.max_fails {
            let result = run_once(ctx, params, test, fail_at)?;
            pipe.tests.push(result);
        }
    }

    info!(
        "allocation failure runs: {} of {} handled",
        pipe.passed_tests(),
        pipe.tests.len()
    );
    pipe.html = html::test_summary(&pipe.tests);
    pipe.failed = pipe.passed_tests() != pipe.tests.len();
    Ok(pipe)
}
