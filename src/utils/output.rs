/// Bounded capture of helper process output (extension scripts, docker)
///
/// Each stream is drained by its own thread so a chatty child never blocks on
/// a full pipe; bytes past the limit are read and discarded. The child leads
/// its own process group, and the whole group is killed once the child is
/// done or past its deadline, so no descendant can keep a pipe open.
use crate::config::types::{EvalError, Result};
use log::warn;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_CAPTURE_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    /// Per-stream byte limit
    pub stream_limit: usize,
    /// Kill the child after this long; `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        CaptureLimits {
            stream_limit: DEFAULT_CAPTURE_LIMIT,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Stream {
    pub data: Vec<u8>,
    pub truncated: bool,
}

impl Stream {
    pub fn text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.truncated {
            text.push_str("\n[output truncated]\n");
        }
        text
    }
}

#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: Stream,
    pub stderr: Stream,
    pub timed_out: bool,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>, limit: usize) -> Option<JoinHandle<Stream>> {
    stream.map(|stream| {
        thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut out = Stream::default();
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let room = limit.saturating_sub(out.data.len());
                        if n > room {
                            out.data.extend_from_slice(&chunk[..room]);
                            out.truncated = true;
                        } else {
                            out.data.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
            out
        })
    })
}

fn join(handle: Option<JoinHandle<Stream>>) -> Stream {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn kill_group(child: &Child) {
    let _ = killpg(Pid::from_raw(child.id() as libc::pid_t), Signal::SIGKILL);
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Result<(ExitStatus, bool)> {
    let Some(timeout) = timeout else {
        return Ok((child.wait()?, false));
    };
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if start.elapsed() >= timeout {
            warn!("process {} exceeded {:?}, killing its group", child.id(), timeout);
            kill_group(child);
            return Ok((child.wait()?, true));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Spawn `cmd` with piped output and collect both streams within `limits`
pub fn run_captured(cmd: &mut Command, limits: CaptureLimits) -> Result<CapturedOutput> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| EvalError::Io(std::io::Error::new(e.kind(), format!("{}: {}", program, e))))?;

    let stdout = drain(child.stdout.take(), limits.stream_limit);
    let stderr = drain(child.stderr.take(), limits.stream_limit);
    let waited = wait_with_deadline(&mut child, limits.timeout);
    // Leftover descendants would hold the pipes open
    kill_group(&child);
    let (status, timed_out) = waited?;

    Ok(CapturedOutput {
        status,
        stdout: join(stdout),
        stderr: join(stderr),
        timed_out,
    })
}
