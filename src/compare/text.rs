/// Line-oriented text comparison through the system `diff` tool
use super::{filters::FilterChain, CompareOutcome};
use crate::config::types::{EvalError, Result};
use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

pub const DIFF_BIN: &str = "diff";

/// Run `diff -u` over two texts; returns the raw diff, empty when equal
pub fn unified_diff(expected: &str, actual: &str) -> Result<String> {
    let mut expected_file = NamedTempFile::new()?;
    expected_file.write_all(expected.as_bytes())?;
    expected_file.flush()?;
    let mut actual_file = NamedTempFile::new()?;
    actual_file.write_all(actual.as_bytes())?;
    actual_file.flush()?;

    let output = Command::new(DIFF_BIN)
        .arg("-u")
        .arg("--label")
        .arg("expected")
        .arg("--label")
        .arg("actual")
        .arg(expected_file.path())
        .arg(actual_file.path())
        .output()
        .map_err(|e| EvalError::Compare(format!("Failed to run {}: {}", DIFF_BIN, e)))?;

    // diff exits 0 when equal, 1 when different and 2 on trouble
    match output.status.code() {
        Some(0) | Some(1) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        _ => Err(EvalError::Compare(format!(
            "{} failed: {}",
            DIFF_BIN,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

pub fn text_compare(expected: &[u8], actual: &[u8], filters: &FilterChain) -> CompareOutcome {
    let expected = match std::str::from_utf8(expected) {
        Ok(text) => text,
        Err(e) => {
            return CompareOutcome::failed(format!("Expected output is not valid UTF-8: {}", e))
        }
    };
    let actual = match std::str::from_utf8(actual) {
        Ok(text) => text,
        Err(e) => return CompareOutcome::failed(format!("Output is not valid UTF-8 text: {}", e)),
    };

    let expected = filters.apply(expected);
    let actual = filters.apply(actual);
    if expected == actual {
        return CompareOutcome::passed();
    }

    match unified_diff(&expected, &actual) {
        Ok(diff) if diff.is_empty() => CompareOutcome::passed(),
        Ok(diff) => CompareOutcome::failed(diff),
        Err(e) => CompareOutcome::failed(e.to_string()),
    }
}
