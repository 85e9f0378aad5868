/// Workflow configuration loading
///
/// A task directory holds `config.yml` (queue, timeout, limits, filters,
/// tests, pipeline), an optional `tests.yml` and fixture files. Problems in
/// any of them become warnings; the evaluation always gets *some* config.
use crate::config::catalog::{discover_fixtures, TestCatalog, TestDefinition};
use crate::config::types::{EvalError, ExecutionLimits, Result};
use crate::pipeline::registry::StepRegistry;
use crate::pipeline::PipeSpec;
use log::{info, warn};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.yml";
pub const TESTS_FILE: &str = "tests.yml";
pub const DEFAULT_QUEUE: &str = "evaluator";

/// Parsed `config.yml`
#[derive(Clone, Debug)]
pub struct WorkflowConfig {
    pub queue: String,
    /// Overall run timeout in seconds, enforced by the job layer
    pub timeout: Option<u64>,
    pub pipeline: Vec<PipeSpec>,
    pub tests: Vec<TestDefinition>,
    pub limits: ExecutionLimits,
    /// Default filter chain for text comparisons
    pub filters: Vec<String>,
    pub warnings: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            timeout: None,
            pipeline: Vec::new(),
            tests: Vec::new(),
            limits: ExecutionLimits::default(),
            filters: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl WorkflowConfig {
    /// Parse config text. Only a document that is not YAML at all is an error;
    /// everything else degrades into warnings.
    pub fn parse(source: &str, registry: &StepRegistry) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(source)?;
        let mut config = WorkflowConfig::default();

        let map = match doc {
            Value::Mapping(map) => map,
            Value::Null => return Ok(config),
            _ => {
                return Err(EvalError::parse(
                    CONFIG_FILE,
                    "top level must be a mapping",
                ))
            }
        };

        for (key, value) in &map {
            let Some(key) = key.as_str() else {
                config
                    .warnings
                    .push(format!("{}: ignoring non-string key {:?}", CONFIG_FILE, key));
                continue;
            };
            match key {
                "queue" => match value.as_str() {
                    Some(queue) => config.queue = queue.to_string(),
                    None => config
                        .warnings
                        .push("queue: expected a string, using default".to_string()),
                },
                "timeout" => match value.as_u64() {
                    Some(secs) => config.timeout = Some(secs),
                    None => config
                        .warnings
                        .push("timeout: expected whole seconds, ignoring".to_string()),
                },
                "limits" => match ExecutionLimits::from_yaml(value, "limits") {
                    Ok(limits) => config.limits = limits,
                    Err(e) => config.warnings.push(format!("{}; ignoring limits", e)),
                },
                "filters" => match parse_string_list(value) {
                    Some(filters) => config.filters = filters,
                    None => config
                        .warnings
                        .push("filters: expected a list of filter names".to_string()),
                },
                "tests" => {
                    config.tests = parse_test_list(value, "tests", &mut config.warnings);
                }
                "pipeline" => match parse_pipeline(value, registry) {
                    Ok(pipeline) => config.pipeline = pipeline,
                    Err(e) => {
                        warn!("pipeline rejected: {}", e);
                        config
                            .warnings
                            .push(format!("{}; pipeline is empty", e));
                    }
                },
                other => config
                    .warnings
                    .push(format!("unknown top-level key '{}' ignored", other)),
            }
        }

        Ok(config)
    }
}

fn parse_string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_sequence()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn parse_test_list(value: &Value, location: &str, warnings: &mut Vec<String>) -> Vec<TestDefinition> {
    let Some(entries) = value.as_sequence() else {
        warnings.push(format!("{}: expected a list of tests", location));
        return Vec::new();
    };

    let mut defs = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        let entry_location = format!("{}[{}]", location, idx);
        match TestDefinition::from_yaml(entry, &entry_location) {
            Ok(def) => defs.push(def),
            Err(e) => warnings.push(format!("{}; test skipped", e)),
        }
    }
    defs
}

/// All-or-nothing: one malformed entry rejects the whole pipeline
pub fn parse_pipeline(value: &Value, registry: &StepRegistry) -> Result<Vec<PipeSpec>> {
    let entries = value
        .as_sequence()
        .ok_or_else(|| EvalError::parse("pipeline", "expected a list of steps"))?;

    entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| registry.resolve(entry, idx + 1))
        .collect()
}

/// Everything loaded from a task directory before extension scripts run
#[derive(Debug)]
pub struct TaskDefinition {
    pub task_dir: PathBuf,
    pub config: WorkflowConfig,
    pub catalog: TestCatalog,
    pub warnings: Vec<String>,
}

/// Load config, supplementary tests and fixtures from `task_dir`.
///
/// Merge order (later wins per field): `config.yml` tests, `tests.yml`,
/// fixture files.
pub fn load_task(task_dir: &Path, registry: &StepRegistry) -> Result<TaskDefinition> {
    let mut warnings = Vec::new();

    let config_path = task_dir.join(CONFIG_FILE);
    let mut config = if config_path.is_file() {
        let source = fs::read_to_string(&config_path)?;
        match WorkflowConfig::parse(&source, registry) {
            Ok(config) => config,
            Err(e) => {
                warnings.push(format!("{}: {}; using empty configuration", CONFIG_FILE, e));
                WorkflowConfig::default()
            }
        }
    } else {
        info!("no {} in {}, using defaults", CONFIG_FILE, task_dir.display());
        WorkflowConfig::default()
    };
    warnings.append(&mut config.warnings);

    let mut catalog = TestCatalog::new();
    for def in config.tests.iter().cloned() {
        catalog.upsert(def, task_dir);
    }

    let tests_path = task_dir.join(TESTS_FILE);
    if tests_path.is_file() {
        let source = fs::read_to_string(&tests_path)?;
        match serde_yaml::from_str::<Value>(&source) {
            Ok(doc) => {
                let list = match &doc {
                    Value::Mapping(map) => map_get(map, "tests").cloned().unwrap_or(Value::Null),
                    other => other.clone(),
                };
                if !list.is_null() {
                    for def in parse_test_list(&list, TESTS_FILE, &mut warnings) {
                        catalog.upsert(def, task_dir);
                    }
                }
            }
            Err(e) => warnings.push(format!("{}: {}; file ignored", TESTS_FILE, e)),
        }
    }

    for def in discover_fixtures(task_dir, &mut warnings)? {
        catalog.upsert(def, task_dir);
    }
    catalog.renumber();

    for warning in &warnings {
        warn!("task {}: {}", task_dir.display(), warning);
    }

    Ok(TaskDefinition {
        task_dir: task_dir.to_path_buf(),
        config,
        catalog,
        warnings,
    })
}

fn map_get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(Value::String(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipeKind;

    #[test]
    fn unknown_top_level_key_is_only_a_warning() {
        let registry = StepRegistry::builtin();
        let config = WorkflowConfig::parse(
            "queue: cuda\ncolour: blue\ntimeout: 60\npipeline:\n  - type: tests\n",
            &registry,
        )
        .unwrap();
        assert_eq!(config.queue, "cuda");
        assert_eq!(config.timeout, Some(60));
        assert_eq!(config.pipeline.len(), 1);
        assert_eq!(config.warnings.len(), 1);
        assert!(config.warnings[0].contains("colour"));
    }

    #[test]
    fn malformed_pipeline_entry_empties_pipeline() {
        let registry = StepRegistry::builtin();
        let config = WorkflowConfig::parse(
            "pipeline:\n  - type: gcc\n  - title: no type here\ntests:\n  - name: a\n",
            &registry,
        )
        .unwrap();
        assert!(config.pipeline.is_empty());
        assert_eq!(config.tests.len(), 1);
        assert!(config.warnings.iter().any(|w| w.contains("pipeline is empty")));
    }

    #[test]
    fn unregistered_step_type_becomes_container_delegate() {
        let registry = StepRegistry::builtin();
        let config =
            WorkflowConfig::parse("pipeline:\n  - type: mytool\n", &registry).unwrap();
        assert!(config.warnings.is_empty());
        match &config.pipeline[0].kind {
            PipeKind::ContainerDelegate(params) => assert_eq!(params.image, "kelvin/mytool"),
            other => panic!("unexpected step kind: {:?}", other),
        }
    }

    #[test]
    fn empty_document_gives_defaults() {
        let registry = StepRegistry::builtin();
        let config = WorkflowConfig::parse("", &registry).unwrap();
        assert_eq!(config.queue, DEFAULT_QUEUE);
        assert!(config.pipeline.is_empty());
    }

    #[test]
    fn load_task_merges_sources_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "tests:\n  - name: echo\n    title: Echo\n    args: [a]\n",
        )
        .unwrap();
        fs::write(
            dir.path().join(TESTS_FILE),
            "- name: echo\n  args: [b]\n- name: extra\n",
        )
        .unwrap();
        fs::write(dir.path().join("echo.out"), "b\n").unwrap();
        fs::write(dir.path().join("aaa.in"), "").unwrap();

        let registry = StepRegistry::builtin();
        let task = load_task(dir.path(), &registry).unwrap();
        let names: Vec<&str> = task.catalog.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "extra", "aaa"]);

        let echo = task.catalog.get("echo").unwrap();
        assert_eq!(echo.title, "Echo");
        assert_eq!(echo.args, vec!["b"]);
        assert_eq!(echo.expected_outputs().count(), 1);
        assert_eq!(task.catalog.get("aaa").unwrap().ordinal, 3);
    }

    #[test]
    fn broken_yaml_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "pipeline: [unclosed").unwrap();
        let task = load_task(dir.path(), &StepRegistry::builtin()).unwrap();
        assert!(task.config.pipeline.is_empty());
        assert_eq!(task.warnings.len(), 1);
    }
}
