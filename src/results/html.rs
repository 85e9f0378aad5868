/// HTML fragments embedded in pipe reports
use super::types::TestResult;
use std::fmt::Write;

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn pre(text: &str) -> String {
    format!("<pre>{}</pre>", escape(text))
}

/// Unified diff with added/removed lines wrapped in classed spans
pub fn diff(unified: &str) -> String {
    let mut out = String::from("<pre class=\"diff\">");
    for line in unified.lines() {
        let class = if line.starts_with("+++") || line.starts_with("---") {
            Some("diff-file")
        } else if line.starts_with("@@") {
            Some("diff-hunk")
        } else if line.starts_with('+') {
            Some("diff-add")
        } else if line.starts_with('-') {
            Some("diff-del")
        } else {
            None
        };
        match class {
            Some(class) => {
                let _ = writeln!(out, "<span class=\"{}\">{}</span>", class, escape(line));
            }
            None => {
                out.push_str(&escape(line));
                out.push('\n');
            }
        }
    }
    out.push_str("</pre>");
    out
}

/// A command and its (possibly suppressed) output
pub fn command_block(command: &str, output: Option<&str>, exit_code: i32) -> String {
    let mut out = format!("<div class=\"command\"><code>$ {}</code>", escape(command));
    if let Some(output) = output.filter(|o| !o.is_empty()) {
        out.push_str(&pre(output));
    }
    if exit_code != 0 {
        let _ = write!(out, "<p class=\"error\">Exit code {}</p>", exit_code);
    }
    out.push_str("</div>");
    out
}

pub fn error(message: &str) -> String {
    format!("<p class=\"error\">{}</p>", escape(message))
}

/// Pass/fail table of a test step
pub fn test_summary(tests: &[TestResult]) -> String {
    let passed = tests.iter().filter(|t| t.success).count();
    let mut out = format!(
        "<p>Passed {} of {} tests</p><table class=\"tests\">",
        passed,
        tests.len()
    );
    for test in tests {
        let _ = write!(
            out,
            "<tr class=\"{}\"><td>{}</td><td>{}</td></tr>",
            if test.success { "pass" } else { "fail" },
            escape(&test.title),
            escape(&test.errors.join("; "))
        );
    }
    out.push_str("</table>");
    out
}
