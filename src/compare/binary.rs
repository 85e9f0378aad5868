/// Byte-exact comparison rendered as a hex dump diff
use super::{text::unified_diff, CompareOutcome};

const BYTES_PER_LINE: usize = 16;

/// `00000010: 48656c6c6f...` lines, 16 bytes each
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + data.len() / BYTES_PER_LINE * 11);
    for (idx, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        out.push_str(&format!(
            "{:08x}: {}\n",
            idx * BYTES_PER_LINE,
            hex::encode(chunk)
        ));
    }
    out
}

pub fn binary_compare(expected: &[u8], actual: &[u8]) -> CompareOutcome {
    if expected == actual {
        return CompareOutcome::passed();
    }

    match unified_diff(&hex_dump(expected), &hex_dump(actual)) {
        Ok(diff) if !diff.is_empty() => CompareOutcome::failed(diff),
        Ok(_) => CompareOutcome::failed("Binary content differs".to_string()),
        Err(e) => CompareOutcome::failed(format!("Binary content differs ({})", e)),
    }
}
