/// Tool diagnostics turned into inline comments.
///
/// Two formats are understood: compiler style lines
/// (`file:line[:col]: severity: message [check]`) and JSON lines
/// (`{"file", "line", "severity", "message", "url"}`).
use crate::results::{Comment, PipeResult};
use serde::Deserialize;

const SEVERITIES: &[&str] = &["error", "fatal error", "warning"];
const STRIPPED_PREFIXES: &[&str] = &["/work/", "/box/", "./"];

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub column: Option<u32>,
    #[serde(default = "default_severity")]
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub check: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_severity() -> String {
    "warning".to_string()
}

impl Diagnostic {
    pub fn to_comment(&self, source: &str) -> Comment {
        let mut text = format!("{}: {}", self.severity, self.message);
        if let Some(check) = &self.check {
            text.push_str(&format!(" [{}]", check));
        }
        Comment {
            line: self.line,
            text,
            source: source.to_string(),
            url: self.url.clone(),
        }
    }
}

/// Documentation page of a clang-tidy check
pub fn clang_tidy_url(check: &str) -> String {
    let (group, name) = match check.strip_prefix("clang-analyzer-") {
        Some(rest) => ("clang-analyzer", rest),
        None => check.split_once('-').unwrap_or(("", check)),
    };
    format!(
        "https://clang.llvm.org/extra/clang-tidy/checks/{}/{}.html",
        group, name
    )
}

fn normalize_file(file: &str) -> String {
    let mut file = file.trim();
    for prefix in STRIPPED_PREFIXES {
        if let Some(rest) = file.strip_prefix(prefix) {
            file = rest;
        }
    }
    file.to_string()
}

fn parse_compiler_line(line: &str) -> Option<Diagnostic> {
    let (file, rest) = line.split_once(':')?;
    if file.is_empty() || file.contains(' ') {
        return None;
    }
    let (line_no, rest) = rest.split_once(':')?;
    let line_no = line_no.trim().parse::<u32>().ok()?;
    let (column, rest) = match rest.split_once(':') {
        Some((col, after)) if col.trim().parse::<u32>().is_ok() => (col.trim().parse().ok(), after),
        _ => (None, rest),
    };
    let (severity, message) = rest.split_once(':')?;
    let severity = severity.trim();
    if !SEVERITIES.contains(&severity) {
        return None;
    }

    let mut message = message.trim().to_string();
    let mut check = None;
    if message.ends_with(']') {
        if let Some(idx) = message.rfind(" [") {
            check = Some(message[idx + 2..message.len() - 1].to_string());
            message.truncate(idx);
        }
    }
    let url = check
        .as_deref()
        .filter(|c| !c.starts_with("-W") && c.contains('-'))
        .map(clang_tidy_url);

    Some(Diagnostic {
        file: normalize_file(file),
        line: line_no,
        column,
        severity: severity.to_string(),
        message,
        check,
        url,
    })
}

/// Diagnostics found in mixed tool output, in order of appearance
pub fn parse(output: &str) -> Vec<Diagnostic> {
    output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.starts_with('{') {
                serde_json::from_str::<Diagnostic>(trimmed)
                    .ok()
                    .map(|mut d| {
                        d.file = normalize_file(&d.file);
                        d
                    })
            } else {
                parse_compiler_line(trimmed)
            }
        })
        .collect()
}

/// Parse `output` and attach every diagnostic to `pipe` as a comment
pub fn attach(pipe: &mut PipeResult, output: &str, source: &str) -> usize {
    let diagnostics = parse(output);
    for diag in &diagnostics {
        pipe.comment(diag.file.clone(), diag.to_comment(source));
    }
    diagnostics.len()
}
