/// Explicit mapping from `type:` names to step constructors
use super::{
    BuildParams, CommandsParams, ContainerParams, Enabled, FaultInjectionParams,
    InputGeneratorParams, PipeKind, PipeSpec, RunTestsParams,
};
use crate::config::types::{EvalError, ExecutionLimits, Result};
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Builds a step from its type-specific parameters (common keys removed)
pub type StepConstructor = fn(type_name: &str, params: Value, location: &str) -> Result<PipeKind>;

/// Prefix of the image used for unregistered step types
pub const DEFAULT_IMAGE_PREFIX: &str = "kelvin/";

const COMMON_KEYS: &[&str] = &["type", "title", "enabled", "fail_on_error", "limits"];

fn params<T: DeserializeOwned>(value: Value, location: &str) -> Result<T> {
    serde_yaml::from_value(value).map_err(|e| EvalError::parse(location, e.to_string()))
}

fn build(_: &str, value: Value, location: &str) -> Result<PipeKind> {
    Ok(PipeKind::Build(params::<BuildParams>(value, location)?))
}

fn run_tests(_: &str, value: Value, location: &str) -> Result<PipeKind> {
    Ok(PipeKind::RunTests(params::<RunTestsParams>(value, location)?))
}

fn commands(_: &str, value: Value, location: &str) -> Result<PipeKind> {
    Ok(PipeKind::RunCommands(params::<CommandsParams>(value, location)?))
}

fn fault_injection(_: &str, value: Value, location: &str) -> Result<PipeKind> {
    Ok(PipeKind::FaultInjection(params::<FaultInjectionParams>(
        value, location,
    )?))
}

fn input_generator(_: &str, value: Value, location: &str) -> Result<PipeKind> {
    let params = params::<InputGeneratorParams>(value, location)?;
    if params.generator.trim().is_empty() {
        return Err(EvalError::parse(location, "input_generator step requires a generator"));
    }
    Ok(PipeKind::InputGenerator(params))
}

fn docker(_: &str, value: Value, location: &str) -> Result<PipeKind> {
    let params = params::<ContainerParams>(value, location)?;
    if params.image.trim().is_empty() {
        return Err(EvalError::parse(location, "docker step requires an image"));
    }
    Ok(PipeKind::ContainerDelegate(params))
}

/// Any unregistered type: run `kelvin/{type}` and hand it the raw params
fn delegate(type_name: &str, value: Value, location: &str) -> Result<PipeKind> {
    let options = serde_json::to_value(&value)
        .map_err(|e| EvalError::parse(location, e.to_string()))?;
    Ok(PipeKind::ContainerDelegate(ContainerParams {
        image: format!("{}{}", DEFAULT_IMAGE_PREFIX, type_name),
        options,
        ..Default::default()
    }))
}

fn parse_enabled(value: &Value, location: &str) -> Result<Enabled> {
    match value {
        Value::Bool(true) => Ok(Enabled::Always),
        Value::Bool(false) => Ok(Enabled::Never),
        Value::String(s) if s == "announce" => Ok(Enabled::OnAnnouncement),
        other => Err(EvalError::parse(
            location,
            format!("enabled must be true, false or \"announce\", got {:?}", other),
        )),
    }
}

#[derive(Clone)]
pub struct StepRegistry {
    constructors: BTreeMap<String, StepConstructor>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with every built-in step type
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for name in ["gcc", "build", "make", "cmake"] {
            registry.register(name, build);
        }
        registry.register("tests", run_tests);
        registry.register("run", commands);
        registry.register("commands", commands);
        registry.register("malloc_fail", fault_injection);
        registry.register("fault_injection", fault_injection);
        registry.register("input_generator", input_generator);
        registry.register("docker", docker);
        registry
    }

    pub fn register(&mut self, name: &str, constructor: StepConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Resolve one `pipeline:` entry into a step with ordinal `id`
    pub fn resolve(&self, entry: &Value, id: usize) -> Result<PipeSpec> {
        let location = format!("pipeline step {}", id);
        let map = entry
            .as_mapping()
            .ok_or_else(|| EvalError::parse(&location, "step must be a mapping"))?;

        let type_name = map
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EvalError::parse(&location, "missing 'type'"))?
            .to_string();
        let location = format!("{} ({})", location, type_name);

        let title = match map.get("title") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(EvalError::parse(&location, "title must be a string")),
        };
        let enabled = match map.get("enabled") {
            None => Enabled::Always,
            Some(v) => parse_enabled(v, &location)?,
        };
        let fail_on_error = match map.get("fail_on_error") {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => return Err(EvalError::parse(&location, "fail_on_error must be a boolean")),
        };
        let limits = match map.get("limits") {
            None => None,
            Some(v) => Some(ExecutionLimits::from_yaml(v, &location)?),
        };

        let mut rest = map.clone();
        for key in COMMON_KEYS {
            rest.remove(*key);
        }

        let constructor = self
            .constructors
            .get(&type_name)
            .copied()
            .unwrap_or(delegate as StepConstructor);
        let kind = constructor(&type_name, Value::Mapping(rest), &location)?;

        Ok(PipeSpec {
            id,
            title: title.unwrap_or_else(|| kind.default_title(&type_name)),
            fail_on_error: fail_on_error.unwrap_or_else(|| kind.default_fail_on_error()),
            type_name,
            enabled,
            limits,
            kind,
        })
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
