/// Translation of [`ExecutionLimits`] into `isolate` command-line flags
use crate::config::types::{ExecutionLimits, NetworkMode};

/// The only place limits become isolate arguments.
///
/// Sizes are converted to KiB as isolate expects; `processes: Some(0)` maps to
/// the bare `--processes` flag (unlimited).
pub fn isolate_args(limits: &ExecutionLimits) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(time) = limits.time {
        args.push(format!("--time={}", time));
    }
    if let Some(wall) = limits.wall_time {
        args.push(format!("--wall-time={}", wall));
    }
    if let Some(memory) = limits.memory {
        args.push(format!("--cg-mem={}", memory.div_ceil(1024)));
    }
    if let Some(fsize) = limits.fsize {
        args.push(format!("--fsize={}", fsize.div_ceil(1024)));
    }
    match limits.processes {
        Some(0) => args.push("--processes".to_string()),
        Some(n) => args.push(format!("--processes={}", n)),
        None => {}
    }
    if limits.network == Some(NetworkMode::Shared) {
        args.push("--share-net".to_string());
    }

    args
}
