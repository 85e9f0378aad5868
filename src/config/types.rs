/// Core types shared across the evaluator: errors, limits and engine settings
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Error type for evaluator operations
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error in {location}: {message}")]
    Parse { location: String, message: String },

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Comparison error: {0}")]
    Compare(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EvalError {
    pub fn parse(location: impl Into<String>, message: impl Into<String>) -> Self {
        EvalError::Parse {
            location: location.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EvalError>;

/// Network access granted to a sandboxed process
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    None,
    Shared,
}

/// Resource limits applied to one sandboxed run.
///
/// Every field is optional so that limits can be layered: engine defaults,
/// then workflow `limits`, then step params, then per-test overrides.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// CPU time limit (seconds)
    pub time: Option<f64>,
    /// Wall clock limit (seconds)
    pub wall_time: Option<f64>,
    /// Address space / cgroup memory limit (bytes)
    pub memory: Option<u64>,
    /// Largest file the process may create (bytes)
    pub fsize: Option<u64>,
    /// Maximum number of processes; `Some(0)` means unlimited
    pub processes: Option<u32>,
    pub network: Option<NetworkMode>,
}

impl ExecutionLimits {
    /// Limits used for student programs when nothing else is configured
    pub fn test_defaults() -> Self {
        Self {
            time: Some(5.0),
            wall_time: Some(10.0),
            memory: Some(256 * 1024 * 1024),
            fsize: Some(16 * 1024 * 1024),
            processes: Some(1),
            network: Some(NetworkMode::None),
        }
    }

    /// Limits used for toolchain invocations (compilers spawn helpers)
    pub fn build_defaults() -> Self {
        Self {
            time: Some(60.0),
            wall_time: Some(120.0),
            memory: Some(1024 * 1024 * 1024),
            fsize: Some(256 * 1024 * 1024),
            processes: Some(0),
            network: Some(NetworkMode::None),
        }
    }

    /// Return a copy where every field set in `other` wins
    pub fn overlay(&self, other: &ExecutionLimits) -> ExecutionLimits {
        ExecutionLimits {
            time: other.time.or(self.time),
            wall_time: other.wall_time.or(self.wall_time),
            memory: other.memory.or(self.memory),
            fsize: other.fsize.or(self.fsize),
            processes: other.processes.or(self.processes),
            network: other.network.or(self.network),
        }
    }

    /// Parse a `limits:` mapping.
    ///
    /// Accepted keys: `time`, `wall_time`, `memory`, `fsize`, `processes`,
    /// `network`. Sizes accept plain byte counts or suffixed strings
    /// (`"128M"`, `"4k"`, `"1G"`).
    pub fn from_yaml(value: &Value, location: &str) -> Result<Self> {
        let map = value
            .as_mapping()
            .ok_or_else(|| EvalError::parse(location, "limits must be a mapping"))?;

        let mut limits = ExecutionLimits::default();
        for (key, val) in map {
            let key = key
                .as_str()
                .ok_or_else(|| EvalError::parse(location, "limit keys must be strings"))?;
            match key {
                "time" => limits.time = Some(parse_seconds(val, location, key)?),
                "wall_time" | "wall-time" => {
                    limits.wall_time = Some(parse_seconds(val, location, key)?)
                }
                "memory" => limits.memory = Some(parse_size(val, location, key)?),
                "fsize" => limits.fsize = Some(parse_size(val, location, key)?),
                "processes" => {
                    let n = val.as_u64().ok_or_else(|| {
                        EvalError::parse(location, "processes must be a non-negative integer")
                    })?;
                    let n = u32::try_from(n).map_err(|_| {
                        EvalError::parse(location, format!("processes out of range: {}", n))
                    })?;
                    limits.processes = Some(n);
                }
                "network" => {
                    let mode = match val {
                        Value::Bool(true) => NetworkMode::Shared,
                        Value::Bool(false) => NetworkMode::None,
                        Value::String(s) if s == "shared" || s == "full" => NetworkMode::Shared,
                        Value::String(s) if s == "none" || s == "disabled" => NetworkMode::None,
                        _ => {
                            return Err(EvalError::parse(
                                location,
                                format!("unknown network mode: {:?}", val),
                            ))
                        }
                    };
                    limits.network = Some(mode);
                }
                other => {
                    return Err(EvalError::parse(
                        location,
                        format!("unknown limit '{}'", other),
                    ))
                }
            }
        }
        Ok(limits)
    }
}

fn parse_seconds(value: &Value, location: &str, key: &str) -> Result<f64> {
    let secs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('s').parse::<f64>().ok(),
        _ => None,
    };
    match secs {
        Some(s) if s >= 0.0 && Duration::try_from_secs_f64(s).is_ok() => Ok(s),
        _ => Err(EvalError::parse(
            location,
            format!("{} must be a finite non-negative number of seconds", key),
        )),
    }
}

fn parse_size(value: &Value, location: &str, key: &str) -> Result<u64> {
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| {
            EvalError::parse(location, format!("{} must be a non-negative size", key))
        }),
        Value::String(s) => parse_size_str(s)
            .ok_or_else(|| EvalError::parse(location, format!("invalid size for {}: {}", key, s))),
        _ => Err(EvalError::parse(location, format!("{} must be a size", key))),
    }
}

/// Parse sizes like `"512"`, `"64k"`, `"128M"`, `"1G"` into bytes
pub fn parse_size_str(raw: &str) -> Option<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, multiplier) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1024),
        'm' | 'M' => (&s[..s.len() - 1], 1024 * 1024),
        'g' | 'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

/// Which isolation backend drives sandboxed runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// External `isolate` tool (production)
    Isolate,
    /// Plain processes with rlimits in a scratch directory
    Local,
}

/// Engine-level settings supplied by the caller, independent of any task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub sandbox: SandboxKind,
    /// Isolate box id owned by this worker
    pub box_id: u32,
    pub isolate_bin: PathBuf,
    pub docker_bin: PathBuf,
    pub python_bin: PathBuf,
    /// Root for `LocalBackend` workspaces
    pub scratch_root: PathBuf,
    /// Baseline limits for student programs
    pub default_limits: ExecutionLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxKind::Isolate,
            box_id: 0,
            isolate_bin: PathBuf::from("isolate"),
            docker_bin: PathBuf::from("docker"),
            python_bin: PathBuf::from("python3"),
            scratch_root: std::env::temp_dir().join("kelvin-eval"),
            default_limits: ExecutionLimits::test_defaults(),
        }
    }
}
