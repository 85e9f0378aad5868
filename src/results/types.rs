/// Result tree of one evaluation run: run → pipe → test → file role
use crate::sandbox::ResourceUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Caller supplied key/value metadata (student, task, `announce`, ...)
pub type Metadata = BTreeMap<String, String>;

/// `true` unless the value is empty or one of the usual false spellings
pub fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

/// Outcome of one output role of a test. Artifact fields hold file names
/// relative to the step directory.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileResult {
    pub fn missing(message: String) -> Self {
        Self {
            success: false,
            error: Some(message),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub title: String,
    pub success: bool,
    pub errors: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub usage: Option<ResourceUsage>,
    /// Keyed by role name (`stdout`, `stderr`, or the output file label)
    #[serde(default)]
    pub files: BTreeMap<String, FileResult>,
}

impl TestResult {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn file(&self, role: &str) -> Option<&FileResult> {
        self.files.get(role)
    }

    pub fn set_file(&mut self, role: impl Into<String>, result: FileResult) {
        self.files.insert(role.into(), result);
    }

    /// Fix `success`: no errors and every compared file matched
    pub fn finalize(&mut self) -> bool {
        self.success = self.errors.is_empty() && self.files.values().all(|f| f.success);
        self.success
    }
}

/// Inline remark attached to a line of a submitted file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub line: u32,
    pub text: String,
    /// Tool that produced the remark (`gcc`, `clang-tidy`, ...)
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipeResult {
    pub id: usize,
    #[serde(rename = "type")]
    pub type_name: String,
    pub title: String,
    pub html: String,
    pub comments: BTreeMap<String, Vec<Comment>>,
    pub failed: bool,
    pub tests: Vec<TestResult>,
}

impl PipeResult {
    pub fn new(id: usize, type_name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn comment(&mut self, file: impl Into<String>, comment: Comment) {
        self.comments.entry(file.into()).or_default().push(comment);
    }

    pub fn passed_tests(&self) -> usize {
        self.tests.iter().filter(|t| t.success).count()
    }
}

/// Manifest of a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
    pub metadata: Metadata,
    pub pipes: Vec<PipeResult>,
}

impl EvaluationResult {
    pub fn new(run_id: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            warnings: Vec::new(),
            metadata,
            pipes: Vec::new(),
        }
    }

    pub fn pipe(&self, id: usize) -> Option<&PipeResult> {
        self.pipes.iter().find(|p| p.id == id)
    }

    /// Whether any recorded pipe reported failure
    pub fn failed(&self) -> bool {
        self.pipes.iter().any(|p| p.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_requires_clean_errors_and_files() {
        let mut result = TestResult::new("t1", "First");
        result.set_file(
            "stdout",
            FileResult {
                success: true,
                ..Default::default()
            },
        );
        assert!(result.finalize());

        result.set_file("stderr", FileResult::missing("Missing standard error output".into()));
        assert!(!result.finalize());

        let mut result = TestResult::new("t2", "Second");
        result.error("Expected exit code 0, got 1");
        assert!(!result.finalize());
    }

    #[test]
    fn pipe_serializes_type_key() {
        let pipe = PipeResult::new(1, "gcc", "Compile");
        let json = serde_json::to_value(&pipe).unwrap();
        assert_eq!(json["type"], "gcc");
        assert_eq!(json["failed"], false);
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy("1"));
        assert!(is_truthy("yes"));
        assert!(!is_truthy("False"));
        assert!(!is_truthy(""));
    }
}
