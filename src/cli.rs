use crate::config::types::{EngineConfig, SandboxKind};
use crate::pipeline::runner::{evaluate, EvaluationRequest};
use crate::pipeline::JobStatus;
use crate::results::Metadata;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum SandboxArg {
    Isolate,
    Local,
}

impl From<SandboxArg> for SandboxKind {
    fn from(arg: SandboxArg) -> Self {
        match arg {
            SandboxArg::Isolate => SandboxKind::Isolate,
            SandboxArg::Local => SandboxKind::Local,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Evaluate a submission against a task", long_about = None)]
struct Cli {
    /// Task directory (config.yml, tests, script)
    #[arg(long)]
    task: PathBuf,
    /// Directory with the submitted files
    #[arg(long)]
    submission: PathBuf,
    /// Result directory; purged before the run
    #[arg(long)]
    result: PathBuf,
    /// Run metadata entry (repeatable)
    #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
    meta: Vec<(String, String)>,
    /// Isolation backend
    #[arg(long, value_enum, default_value_t = SandboxArg::Isolate)]
    sandbox: SandboxArg,
    /// Isolate box id owned by this worker
    #[arg(long, default_value_t = 0)]
    box_id: u32,
    #[arg(long)]
    isolate_bin: Option<PathBuf>,
    #[arg(long)]
    docker_bin: Option<PathBuf>,
    /// Interpreter for script.py and python generators
    #[arg(long)]
    python_bin: Option<PathBuf>,
    /// Workspace root for the local backend
    #[arg(long)]
    scratch_root: Option<PathBuf>,
}

fn parse_meta(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            sandbox: self.sandbox.into(),
            box_id: self.box_id,
            ..Default::default()
        };
        if let Some(bin) = &self.isolate_bin {
            config.isolate_bin = bin.clone();
        }
        if let Some(bin) = &self.docker_bin {
            config.docker_bin = bin.clone();
        }
        if let Some(bin) = &self.python_bin {
            config.python_bin = bin.clone();
        }
        if let Some(root) = &self.scratch_root {
            config.scratch_root = root.clone();
        }
        config
    }

    fn request(&self) -> EvaluationRequest {
        EvaluationRequest {
            task_dir: self.task.clone(),
            submission_dir: self.submission.clone(),
            result_dir: self.result.clone(),
            metadata: self.meta.iter().cloned().collect::<Metadata>(),
        }
    }
}

extern "C" fn signal_handler(sig: libc::c_int) {
    // Only async-signal-safe calls here. A leftover box is purged by the
    // next run's init.
    let msg = b"kelvin-eval: signal received, exiting\n";
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

pub fn run() -> Result<()> {
    setup_signal_handlers();
    env_logger::init();

    let cli = Cli::parse();
    if !cli.task.is_dir() {
        anyhow::bail!("task directory {} does not exist", cli.task.display());
    }
    if !cli.submission.is_dir() {
        anyhow::bail!(
            "submission directory {} does not exist",
            cli.submission.display()
        );
    }

    let engine = cli.engine_config();
    let request = cli.request();
    let status = JobStatus::new();
    let result = evaluate(&request, &engine, &status)
        .with_context(|| format!("evaluation of {} failed", cli.submission.display()))?;

    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }
    let manifest = request.result_dir.join(crate::results::MANIFEST_FILE);
    println!("{}", manifest.display());
    Ok(())
}
