/// Backend running commands as plain child processes in a scratch directory.
///
/// Limits are applied with `setrlimit` in a `pre_exec` hook and the wall
/// limit by a polling watchdog that kills the whole process group. This gives
/// no filesystem or network isolation; it exists for hosts without `isolate`
/// and for the test suite.
use super::{IsolationBackend, ResourceUsage, RunRequest, RunStatus};
use crate::config::types::{EvalError, ExecutionLimits, NetworkMode, Result};
use crate::safety::confined;
use crate::safety::safe_cleanup::{remove_tree_secure, reset_dir};
use log::{debug, warn};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const LOCAL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct LocalBackend {
    root: PathBuf,
    network_warned: bool,
}

impl LocalBackend {
    pub fn new(scratch_root: &Path, box_id: u32) -> Self {
        Self {
            root: scratch_root.join(format!("box-{}", box_id)),
            network_warned: false,
        }
    }
}

fn redirect(workspace: &Path, rel: Option<&String>, write: bool) -> Result<Stdio> {
    let Some(rel) = rel else {
        return Ok(Stdio::null());
    };
    let file = if write {
        confined::open_write(workspace, Path::new(rel), 0o644)?
    } else {
        confined::open_read(workspace, Path::new(rel))
            .map_err(|e| EvalError::Sandbox(format!("cannot open stdin {}: {}", rel, e)))?
    };
    Ok(Stdio::from(file))
}

fn apply_rlimits(limits: &ExecutionLimits) -> nix::Result<()> {
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    if let Some(time) = limits.time {
        let soft = time.ceil().max(1.0) as u64;
        setrlimit(Resource::RLIMIT_CPU, soft, soft + 1)?;
    }
    if let Some(memory) = limits.memory {
        setrlimit(Resource::RLIMIT_AS, memory, memory)?;
    }
    if let Some(fsize) = limits.fsize {
        setrlimit(Resource::RLIMIT_FSIZE, fsize, fsize)?;
    }
    if let Some(n) = limits.processes.filter(|n| *n > 0) {
        setrlimit(Resource::RLIMIT_NPROC, n as u64, n as u64)?;
    }
    Ok(())
}

/// Non-blocking (`WNOHANG`) or blocking reap with resource usage
fn wait4(pid: libc::pid_t, block: bool) -> Result<Option<(libc::c_int, libc::rusage)>> {
    let flags = if block { 0 } else { libc::WNOHANG };
    loop {
        let mut status: libc::c_int = 0;
        let mut usage = unsafe { std::mem::zeroed::<libc::rusage>() };
        let rc = unsafe { libc::wait4(pid, &mut status, flags, &mut usage) };
        if rc == pid {
            return Ok(Some((status, usage)));
        }
        if rc == 0 {
            return Ok(None);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(EvalError::Sandbox(format!("wait4({}) failed: {}", pid, err)));
        }
    }
}

fn seconds(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

fn classify(
    status: libc::c_int,
    rusage: &libc::rusage,
    wall_time: f64,
    watchdog_fired: bool,
    limits: &ExecutionLimits,
) -> ResourceUsage {
    let cpu_time = seconds(rusage.ru_utime) + seconds(rusage.ru_stime);
    let mut usage = ResourceUsage {
        cpu_time,
        wall_time,
        memory_kb: Some(rusage.ru_maxrss as u64),
        ..Default::default()
    };

    if libc::WIFEXITED(status) {
        let code = libc::WEXITSTATUS(status);
        usage.exit_code = Some(code);
        usage.status = if code == 0 {
            RunStatus::Ok
        } else {
            RunStatus::RuntimeError
        };
    } else if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        usage.signal = Some(signal);
        let cpu_exhausted = limits.time.is_some_and(|t| cpu_time >= t);
        usage.status = if watchdog_fired
            || signal == libc::SIGXCPU
            || (signal == libc::SIGKILL && cpu_exhausted)
        {
            usage.message = Some(if watchdog_fired {
                "Wall time limit exceeded".to_string()
            } else {
                "CPU time limit exceeded".to_string()
            });
            RunStatus::TimedOut
        } else {
            RunStatus::Signaled
        };
    }
    usage
}

impl IsolationBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn init(&mut self) -> Result<PathBuf> {
        reset_dir(&self.root)?;
        let workspace = self.root.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&workspace)?;
        Ok(workspace)
    }

    fn execute(&mut self, workspace: &Path, request: &RunRequest) -> Result<ResourceUsage> {
        let limits = request.limits.clone();
        if limits.network != Some(NetworkMode::Shared) && !self.network_warned {
            warn!("local sandbox cannot restrict network access");
            self.network_warned = true;
        }

        let program = &request.command[0];
        let program = if program.contains('/') && !program.starts_with('/') {
            workspace.join(program)
        } else {
            PathBuf::from(program)
        };

        let mut cmd = Command::new(&program);
        cmd.args(&request.command[1..])
            .current_dir(workspace)
            .env_clear()
            .env("PATH", LOCAL_PATH)
            .env("HOME", workspace)
            .stdin(redirect(workspace, request.stdin.as_ref(), false)?)
            .stdout(redirect(workspace, request.stdout.as_ref(), true)?)
            .stderr(redirect(workspace, request.stderr.as_ref(), true)?);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child_limits = limits.clone();
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                apply_rlimits(&child_limits).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("setrlimit failed: {}", e),
                    )
                })
            });
        }

        let start = Instant::now();
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!("spawn of {} failed: {}", program.display(), e);
                return Ok(ResourceUsage {
                    status: RunStatus::InternalError,
                    message: Some(format!("cannot execute {}: {}", program.display(), e)),
                    ..Default::default()
                });
            }
        };
        let pid = child.id() as libc::pid_t;
        let wall_limit = limits
            .wall_time
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

        let mut watchdog_fired = false;
        let (status, rusage) = loop {
            if let Some(done) = wait4(pid, false)? {
                break done;
            }
            if wall_limit.is_some_and(|limit| start.elapsed() >= limit) {
                debug!("wall limit hit for pid {}, killing group", pid);
                let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
                watchdog_fired = true;
                match wait4(pid, true)? {
                    Some(done) => break done,
                    None => continue,
                }
            }
            thread::sleep(POLL_INTERVAL);
        };
        // The group may still hold orphaned grandchildren
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);

        Ok(classify(
            status,
            &rusage,
            start.elapsed().as_secs_f64(),
            watchdog_fired,
            &limits,
        ))
    }

    fn cleanup(&mut self) -> Result<()> {
        remove_tree_secure(&self.root)
    }
}
