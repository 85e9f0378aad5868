/// Test catalog: test definitions merged from config, fixtures and scripts
use crate::compare::ComparatorKind;
use crate::config::types::{EvalError, ExecutionLimits, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Directories (relative to the task) searched for fixture files
pub const FIXTURE_DIRS: &[&str] = &[".", "tests"];

/// Logical role of a file attached to a test
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileRole {
    Stdin,
    Stdout,
    Stderr,
    InputFile(String),
    OutputFile(String),
}

impl FileRole {
    pub fn is_input(&self) -> bool {
        matches!(self, FileRole::Stdin | FileRole::InputFile(_))
    }

    /// Name used in artifact file names and result maps
    pub fn name(&self) -> &str {
        match self {
            FileRole::Stdin => "stdin",
            FileRole::Stdout => "stdout",
            FileRole::Stderr => "stderr",
            FileRole::InputFile(label) | FileRole::OutputFile(label) => label,
        }
    }

    /// Error recorded when the program did not produce this output
    pub fn missing_message(&self) -> String {
        match self {
            FileRole::Stdout => "Missing standard output".to_string(),
            FileRole::Stderr => "Missing standard error output".to_string(),
            FileRole::OutputFile(label) => format!("Missing output file '{}'", label),
            FileRole::Stdin | FileRole::InputFile(_) => {
                format!("Missing input file '{}'", self.name())
            }
        }
    }
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the content of a test file comes from
#[derive(Clone, Debug, PartialEq)]
pub enum FileSource {
    Path(PathBuf),
    Buffer(Vec<u8>),
}

impl FileSource {
    pub fn read(&self) -> Result<Vec<u8>> {
        match self {
            FileSource::Path(path) => fs::read(path).map_err(|e| {
                EvalError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to read test file {}: {}", path.display(), e),
                ))
            }),
            FileSource::Buffer(data) => Ok(data.clone()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Copied into the sandbox before the run
    Input,
    /// Expected content compared after the run
    Output,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TestFile {
    pub source: FileSource,
    pub direction: Direction,
}

/// Serialized form of a file in YAML and in the script protocol
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileSpec {
    Path { path: PathBuf },
    Content(String),
}

impl FileSpec {
    fn into_source(self, base_dir: &Path) -> FileSource {
        match self {
            FileSpec::Path { path } if path.is_absolute() => FileSource::Path(path),
            FileSpec::Path { path } => FileSource::Path(base_dir.join(path)),
            FileSpec::Content(content) => FileSource::Buffer(content.into_bytes()),
        }
    }

    fn from_source(source: &FileSource) -> Self {
        match source {
            FileSource::Path(path) => FileSpec::Path { path: path.clone() },
            FileSource::Buffer(data) => FileSpec::Content(String::from_utf8_lossy(data).into_owned()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgSpec {
    List(Vec<String>),
    Line(String),
}

impl ArgSpec {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            ArgSpec::List(args) => args,
            ArgSpec::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// One test as declared by a source. Unset fields leave earlier values alone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ArgSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<FileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<FileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<FileSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files_in: BTreeMap<String, FileSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files_out: BTreeMap<String, FileSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub comparators: BTreeMap<String, ComparatorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ExecutionLimits>,
}

impl TestDefinition {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a YAML test record; `limits` uses the human-friendly limit syntax
    pub fn from_yaml(value: &serde_yaml::Value, location: &str) -> Result<Self> {
        let mut value = value.clone();
        let limits = match value.as_mapping_mut() {
            Some(map) => map.remove("limits"),
            None => return Err(EvalError::parse(location, "test entry must be a mapping")),
        };
        let mut def: TestDefinition = serde_yaml::from_value(value)
            .map_err(|e| EvalError::parse(location, e.to_string()))?;
        if let Some(limits) = limits {
            def.limits = Some(ExecutionLimits::from_yaml(&limits, location)?);
        }
        if def.name.trim().is_empty() {
            return Err(EvalError::parse(location, "test name must not be empty"));
        }
        Ok(def)
    }
}

/// A fully merged test ready for execution
#[derive(Clone, Debug, PartialEq)]
pub struct Test {
    pub name: String,
    pub title: String,
    pub args: Vec<String>,
    pub exit_code: i32,
    pub files: BTreeMap<FileRole, TestFile>,
    /// Per-role comparator overrides, keyed by role name
    pub comparators: BTreeMap<String, ComparatorKind>,
    pub filters: Option<Vec<String>>,
    pub limits: ExecutionLimits,
    /// Position in execution order, starting at 1
    pub ordinal: usize,
}

impl Test {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            name,
            args: Vec::new(),
            exit_code: 0,
            files: BTreeMap::new(),
            comparators: BTreeMap::new(),
            filters: None,
            limits: ExecutionLimits::default(),
            ordinal: 0,
        }
    }

    /// Merge a definition into this test; relative paths resolve against `base_dir`
    pub fn apply(&mut self, def: TestDefinition, base_dir: &Path) {
        if let Some(title) = def.title {
            self.title = title;
        }
        if let Some(args) = def.args {
            self.args = args.into_vec();
        }
        if let Some(exit_code) = def.exit_code {
            self.exit_code = exit_code;
        }

        let mut set = |role: FileRole, spec: FileSpec| {
            let direction = if role.is_input() {
                Direction::Input
            } else {
                Direction::Output
            };
            self.files.insert(
                role,
                TestFile {
                    source: spec.into_source(base_dir),
                    direction,
                },
            );
        };
        if let Some(spec) = def.stdin {
            set(FileRole::Stdin, spec);
        }
        if let Some(spec) = def.stdout {
            set(FileRole::Stdout, spec);
        }
        if let Some(spec) = def.stderr {
            set(FileRole::Stderr, spec);
        }
        for (label, spec) in def.files_in {
            set(FileRole::InputFile(label), spec);
        }
        for (label, spec) in def.files_out {
            set(FileRole::OutputFile(label), spec);
        }

        self.comparators.extend(def.comparators);
        if def.filters.is_some() {
            self.filters = def.filters;
        }
        if let Some(limits) = def.limits {
            self.limits = self.limits.overlay(&limits);
        }
    }

    /// Snapshot as a definition (used by the script protocol)
    pub fn to_definition(&self) -> TestDefinition {
        let mut def = TestDefinition::named(&self.name);
        def.title = Some(self.title.clone());
        def.args = Some(ArgSpec::List(self.args.clone()));
        def.exit_code = Some(self.exit_code);
        for (role, file) in &self.files {
            let spec = FileSpec::from_source(&file.source);
            match role {
                FileRole::Stdin => def.stdin = Some(spec),
                FileRole::Stdout => def.stdout = Some(spec),
                FileRole::Stderr => def.stderr = Some(spec),
                FileRole::InputFile(label) => {
                    def.files_in.insert(label.clone(), spec);
                }
                FileRole::OutputFile(label) => {
                    def.files_out.insert(label.clone(), spec);
                }
            }
        }
        def.comparators = self.comparators.clone();
        def.filters = self.filters.clone();
        if self.limits != ExecutionLimits::default() {
            def.limits = Some(self.limits.clone());
        }
        def
    }

    pub fn stdin(&self) -> Option<&TestFile> {
        self.files.get(&FileRole::Stdin)
    }

    /// Named input files (not stdin)
    pub fn input_files(&self) -> impl Iterator<Item = (&str, &TestFile)> {
        self.files.iter().filter_map(|(role, file)| match role {
            FileRole::InputFile(label) => Some((label.as_str(), file)),
            _ => None,
        })
    }

    /// Every role with an expected counterpart
    pub fn expected_outputs(&self) -> impl Iterator<Item = (&FileRole, &TestFile)> {
        self.files
            .iter()
            .filter(|(_, file)| file.direction == Direction::Output)
    }

    pub fn comparator_for(&self, role: &FileRole) -> ComparatorKind {
        self.comparators
            .get(role.name())
            .copied()
            .unwrap_or_default()
    }
}

/// Ordered, name-keyed set of tests
#[derive(Clone, Debug, Default)]
pub struct TestCatalog {
    tests: Vec<Test>,
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a definition by name; new names are appended in order of arrival
    pub fn upsert(&mut self, def: TestDefinition, base_dir: &Path) {
        match self.tests.iter_mut().find(|t| t.name == def.name) {
            Some(existing) => existing.apply(def, base_dir),
            None => {
                let mut test = Test::new(def.name.clone());
                test.apply(def, base_dir);
                self.tests.push(test);
            }
        }
    }

    /// Assign execution ordinals in current order
    pub fn renumber(&mut self) {
        for (idx, test) in self.tests.iter_mut().enumerate() {
            test.ordinal = idx + 1;
        }
    }

    pub fn get(&self, name: &str) -> Option<&Test> {
        self.tests.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Test> {
        self.tests.iter()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn definitions(&self) -> Vec<TestDefinition> {
        self.tests.iter().map(Test::to_definition).collect()
    }
}

impl<'a> IntoIterator for &'a TestCatalog {
    type Item = &'a Test;
    type IntoIter = std::slice::Iter<'a, Test>;

    fn into_iter(self) -> Self::IntoIter {
        self.tests.iter()
    }
}

/// Kind of fixture encoded in a file name
#[derive(Debug, PartialEq)]
enum Fixture {
    Stdin,
    Stdout,
    Stderr,
    Args,
    ExitCode,
    FileIn(String),
    FileOut(String),
}

fn classify_fixture(file_name: &str) -> Option<(String, Fixture)> {
    for (marker, is_input) in [(".file_in.", true), (".file_out.", false)] {
        if let Some(idx) = file_name.find(marker) {
            let name = &file_name[..idx];
            let label = &file_name[idx + marker.len()..];
            if name.is_empty() || label.is_empty() {
                return None;
            }
            let fixture = if is_input {
                Fixture::FileIn(label.to_string())
            } else {
                Fixture::FileOut(label.to_string())
            };
            return Some((name.to_string(), fixture));
        }
    }

    let (name, ext) = file_name.rsplit_once('.')?;
    if name.is_empty() {
        return None;
    }
    let fixture = match ext {
        "in" => Fixture::Stdin,
        "out" => Fixture::Stdout,
        "err" => Fixture::Stderr,
        "args" => Fixture::Args,
        "exit" => Fixture::ExitCode,
        _ => return None,
    };
    Some((name.to_string(), fixture))
}

/// Discover tests from fixture files, sorted by test name.
///
/// Malformed `.exit` files are reported as warnings and ignored.
pub fn discover_fixtures(task_dir: &Path, warnings: &mut Vec<String>) -> Result<Vec<TestDefinition>> {
    let mut found: BTreeMap<String, TestDefinition> = BTreeMap::new();

    for sub in FIXTURE_DIRS {
        let dir = task_dir.join(sub);
        if !dir.is_dir() {
            continue;
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        for path in entries {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((name, fixture)) = classify_fixture(file_name) else {
                continue;
            };
            debug!("fixture {} -> test '{}' ({:?})", path.display(), name, fixture);

            let def = found
                .entry(name.clone())
                .or_insert_with(|| TestDefinition::named(&name));
            let spec = FileSpec::Path { path: path.clone() };
            match fixture {
                Fixture::Stdin => def.stdin = Some(spec),
                Fixture::Stdout => def.stdout = Some(spec),
                Fixture::Stderr => def.stderr = Some(spec),
                Fixture::FileIn(label) => {
                    def.files_in.insert(label, spec);
                }
                Fixture::FileOut(label) => {
                    def.files_out.insert(label, spec);
                }
                Fixture::Args => {
                    let line = fs::read_to_string(&path)?;
                    def.args = Some(ArgSpec::Line(line));
                }
                Fixture::ExitCode => {
                    let raw = fs::read_to_string(&path)?;
                    match raw.trim().parse::<i32>() {
                        Ok(code) => def.exit_code = Some(code),
                        Err(_) => warnings.push(format!(
                            "{}: expected an integer exit code, found '{}'",
                            path.display(),
                            raw.trim()
                        )),
                    }
                }
            }
        }
    }

    Ok(found.into_values().collect())
}
