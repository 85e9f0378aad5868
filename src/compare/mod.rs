//! Output comparators and normalization filters.
//!
//! Every comparator returns a [`CompareOutcome`] and never fails: decode and
//! tool errors become a failed comparison carrying an explanatory message.

pub mod binary;
pub mod filters;
pub mod image;
pub mod text;

use serde::{Deserialize, Serialize};

pub use filters::{Filter, FilterChain};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparatorKind {
    #[default]
    Text,
    Binary,
    Image,
}

/// `(success, diff)` pair; `diff` is `None` on success
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompareOutcome {
    pub success: bool,
    pub diff: Option<String>,
}

impl CompareOutcome {
    pub fn passed() -> Self {
        Self {
            success: true,
            diff: None,
        }
    }

    pub fn failed(diff: String) -> Self {
        Self {
            success: false,
            diff: Some(diff),
        }
    }
}

/// Compare expected and actual content with the selected algorithm
pub fn compare(
    kind: ComparatorKind,
    expected: &[u8],
    actual: &[u8],
    filters: &FilterChain,
) -> CompareOutcome {
    match kind {
        ComparatorKind::Text => text::text_compare(expected, actual, filters),
        ComparatorKind::Binary => binary::binary_compare(expected, actual),
        ComparatorKind::Image => self::image::image_compare(expected, actual),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_by_kind() {
        let chain = FilterChain::new(vec![Filter::Lower]);
        assert!(compare(ComparatorKind::Text, b"ABC\n", b"abc\n", &chain).success);
        // binary ignores filters
        assert!(!compare(ComparatorKind::Binary, b"ABC\n", b"abc\n", &chain).success);
        assert!(!compare(ComparatorKind::Image, b"ABC", b"ABC", &chain).success);
    }

    #[test]
    fn kind_names_deserialize() {
        let kind: ComparatorKind = serde_json::from_str("\"image\"").unwrap();
        assert_eq!(kind, ComparatorKind::Image);
        assert_eq!(ComparatorKind::default(), ComparatorKind::Text);
    }
}
