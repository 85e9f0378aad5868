/// Sequential pipeline execution and the evaluation entry point
use super::progress::JobStatus;
use super::registry::StepRegistry;
use super::{build, commands, container, fault_injection, input_generator, run_tests};
use super::{PipeKind, PipeSpec};
use crate::compare::FilterChain;
use crate::config::catalog::Test;
use crate::config::types::{EngineConfig, ExecutionLimits, Result};
use crate::config::workflow::{load_task, TaskDefinition};
use crate::results::{html, EvaluationResult, Metadata, PipeResult, ResultStore};
use crate::sandbox::Sandbox;
use crate::script::{enrich_catalog, ScriptHost};
use log::{error, info, warn};
use std::path::{Path, PathBuf};

/// What the job layer hands to the engine
#[derive(Clone, Debug)]
pub struct EvaluationRequest {
    pub task_dir: PathBuf,
    pub submission_dir: PathBuf,
    pub result_dir: PathBuf,
    pub metadata: Metadata,
}

/// Everything a step may touch while it runs
pub struct StepContext<'a> {
    pub spec: &'a PipeSpec,
    pub task: &'a TaskDefinition,
    pub engine: &'a EngineConfig,
    pub metadata: &'a Metadata,
    pub submission_dir: &'a Path,
    pub sandbox: &'a mut Sandbox,
    pub store: &'a ResultStore,
    pub script: &'a mut ScriptHost,
    /// Collected into the manifest after the step
    pub warnings: Vec<String>,
}

impl StepContext<'_> {
    /// Empty result carrying this step's identity
    pub fn new_pipe(&self) -> PipeResult {
        PipeResult::new(self.spec.id, &self.spec.type_name, &self.spec.title)
    }

    /// Limits for student programs: engine default, workflow `limits`, step `limits`
    pub fn limits(&self) -> ExecutionLimits {
        let mut limits = self.engine.default_limits.overlay(&self.task.config.limits);
        if let Some(step) = &self.spec.limits {
            limits = limits.overlay(step);
        }
        limits
    }

    /// Step limits with the test's own override on top
    pub fn test_limits(&self, test: &Test) -> ExecutionLimits {
        self.limits().overlay(&test.limits)
    }

    /// Limits for toolchain runs; only the step's own `limits` apply
    pub fn build_limits(&self) -> ExecutionLimits {
        let limits = ExecutionLimits::build_defaults();
        match &self.spec.limits {
            Some(step) => limits.overlay(step),
            None => limits,
        }
    }

    /// Filters of the test, else of the step, else of the workflow
    pub fn filter_chain(&mut self, step_filters: Option<&Vec<String>>, test: &Test) -> FilterChain {
        let names = test
            .filters
            .as_ref()
            .or(step_filters)
            .unwrap_or(&self.task.config.filters);
        FilterChain::from_names(names, &mut self.warnings)
    }

    pub fn step_dir(&self) -> PathBuf {
        self.store.step_dir(self.spec.id)
    }

    pub fn persist(&self, name: &str, bytes: &[u8]) -> Result<String> {
        self.store.persist_artifact(self.spec.id, name, bytes)
    }
}

fn run_step(ctx: &mut StepContext<'_>) -> Result<PipeResult> {
    let spec = ctx.spec;
    match &spec.kind {
        PipeKind::Build(params) => build::run(ctx, params),
        PipeKind::RunTests(params) => run_tests::run(ctx, params),
        PipeKind::RunCommands(params) => commands::run(ctx, params),
        PipeKind::FaultInjection(params) => fault_injection::run(ctx, params),
        PipeKind::InputGenerator(params) => input_generator::run(ctx, params),
        PipeKind::ContainerDelegate(params) => container::run(ctx, params),
    }
}

/// Execute the pipeline in order, stopping after the first failed step.
///
/// The manifest is flushed after every executed step so a crash mid-run still
/// leaves a manifest describing every artifact written so far.
#[allow(clippy::too_many_arguments)]
pub fn run_pipeline(
    task: &TaskDefinition,
    engine: &EngineConfig,
    metadata: &Metadata,
    submission_dir: &Path,
    sandbox: &mut Sandbox,
    store: &mut ResultStore,
    script: &mut ScriptHost,
    status: &JobStatus,
) -> Result<()> {
    status.start(task.config.pipeline.len());

    for spec in &task.config.pipeline {
        if !spec.enabled.is_active(metadata) {
            info!("step {} ({}) disabled, skipping", spec.id, spec.type_name);
            status.step_completed();
            continue;
        }
        info!("step {}: {} ({})", spec.id, spec.title, spec.type_name);

        let mut ctx = StepContext {
            spec,
            task,
            engine,
            metadata,
            submission_dir,
            sandbox: &mut *sandbox,
            store: &*store,
            script: &mut *script,
            warnings: Vec::new(),
        };
        let mut pipe = match run_step(&mut ctx) {
            Ok(pipe) => pipe,
            Err(e) => {
                error!("step {} ({}) errored: {}", spec.id, spec.type_name, e);
                let mut pipe = ctx.new_pipe();
                pipe.html = html::error(&e.to_string());
                pipe.failed = true;
                pipe
            }
        };
        let warnings = std::mem::take(&mut ctx.warnings);

        pipe.failed = pipe.failed && spec.fail_on_error;
        let failed = pipe.failed;
        store.extend_warnings(warnings);
        store.extend_warnings(script.take_warnings());
        store.record_pipe(pipe);
        store.flush()?;
        status.step_completed();

        if failed {
            warn!("step {} ({}) failed, stopping pipeline", spec.id, spec.type_name);
            break;
        }
    }
    Ok(())
}

/// Evaluate a submission with the built-in step registry
pub fn evaluate(
    request: &EvaluationRequest,
    engine: &EngineConfig,
    status: &JobStatus,
) -> Result<EvaluationResult> {
    evaluate_with(request, engine, status, &StepRegistry::builtin())
}

/// Evaluate a submission.
///
/// Only catastrophic problems (unreadable task, sandbox or result directory
/// unusable) are returned as errors; everything else ends up in the result.
pub fn evaluate_with(
    request: &EvaluationRequest,
    engine: &EngineConfig,
    status: &JobStatus,
    registry: &StepRegistry,
) -> Result<EvaluationResult> {
    let mut store = ResultStore::create(&request.result_dir, request.metadata.clone())?;

    let mut task = load_task(&request.task_dir, registry)?;
    store.extend_warnings(std::mem::take(&mut task.warnings));

    let mut script = ScriptHost::load(&request.task_dir, &engine.python_bin);
    let generated = enrich_catalog(&mut script, &mut task.catalog, &request.task_dir);
    if generated > 0 {
        info!("script added or updated {} tests", generated);
    }
    store.extend_warnings(script.take_warnings());
    info!(
        "task {}: {} steps, {} tests",
        request.task_dir.display(),
        task.config.pipeline.len(),
        task.catalog.len()
    );

    let mut sandbox = Sandbox::create(engine)?;
    sandbox.copy_dir(&request.submission_dir, ".")?;
    store.flush()?;

    run_pipeline(
        &task,
        engine,
        &request.metadata,
        &request.submission_dir,
        &mut sandbox,
        &mut store,
        &mut script,
        status,
    )?;

    let result = store.finish()?;
    info!(
        "evaluation finished: {} steps recorded{}",
        result.pipes.len(),
        if result.failed() { ", failed" } else { "" }
    );
    Ok(result)
}
