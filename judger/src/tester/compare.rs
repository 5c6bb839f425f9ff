//! Pluggable output comparison.

use difference::{Changeset, Difference};
use serde::{Deserialize, Serialize};

use crate::runner::util::truncate_message;

/// Diffs longer than this are cut before being reported.
const MAX_DIFF_LEN: usize = 4096;

pub trait Comparator: Send + Sync {
    /// Returns `None` when `got` is acceptable, or a diff when it is not.
    fn compare(&self, got: &[u8], expected: &str) -> Option<String>;
}

/// Byte-for-byte equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exact;

/// Equal token sequences, whitespace of any kind and amount being a
/// separator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Whitespace;

/// Token-wise; numeric tokens match within an absolute or relative
/// tolerance, other tokens must be equal.
#[derive(Debug, Clone, Copy)]
pub struct Numeric {
    pub abs: f64,
    pub rel: f64,
}

impl Comparator for Exact {
    fn compare(&self, got: &[u8], expected: &str) -> Option<String> {
        if got == expected.as_bytes() {
            None
        } else {
            Some(diff(&String::from_utf8_lossy(got), expected))
        }
    }
}

impl Comparator for Whitespace {
    fn compare(&self, got: &[u8], expected: &str) -> Option<String> {
        let got = String::from_utf8_lossy(got);
        if got.split_whitespace().eq(expected.split_whitespace()) {
            None
        } else {
            Some(diff(&got, expected))
        }
    }
}

impl Numeric {
    fn token_matches(&self, got: &str, expected: &str) -> bool {
        if got == expected {
            return true;
        }
        match (got.parse::<f64>(), expected.parse::<f64>()) {
            (Ok(g), Ok(e)) if g.is_finite() && e.is_finite() => {
                let delta = (g - e).abs();
                delta <= self.abs || delta <= self.rel * e.abs()
            }
            _ => false,
        }
    }
}

impl Comparator for Numeric {
    fn compare(&self, got: &[u8], expected: &str) -> Option<String> {
        let got = String::from_utf8_lossy(got);
        let mut g = got.split_whitespace();
        let mut e = expected.split_whitespace();
        loop {
            match (g.next(), e.next()) {
                (None, None) => return None,
                (Some(a), Some(b)) if self.token_matches(a, b) => continue,
                _ => return Some(diff(&got, expected)),
            }
        }
    }
}

/// Comparator selection as written in a problem's policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ComparatorKind {
    Exact,
    Whitespace,
    Numeric {
        #[serde(default)]
        abs: f64,
        #[serde(default)]
        rel: f64,
    },
}

impl Default for ComparatorKind {
    fn default() -> Self {
        ComparatorKind::Whitespace
    }
}

impl ComparatorKind {
    pub fn build(&self) -> Box<dyn Comparator> {
        match *self {
            ComparatorKind::Exact => Box::new(Exact),
            ComparatorKind::Whitespace => Box::new(Whitespace),
            ComparatorKind::Numeric { abs, rel } => Box::new(Numeric { abs, rel }),
        }
    }
}

/// Line diff of two outputs, `-` marking lines only in `got` and `+` lines
/// only in `expected`.
pub fn diff(got: &str, expected: &str) -> String {
    let changeset = Changeset::new(got, expected, "\n");
    let mut out = String::new();
    let mut push = |mark: char, block: &str| {
        for line in block.lines() {
            out.push(mark);
            out.push(' ');
            out.push_str(line);
            out.push('\n');
        }
    };
    for d in &changeset.diffs {
        match d {
            Difference::Same(s) => push(' ', s),
            Difference::Rem(s) => push('-', s),
            Difference::Add(s) => push('+', s),
        }
    }
    truncate_message(&out, MAX_DIFF_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exact_is_strict() {
        assert_eq!(Exact.compare(b"0 1\n", "0 1\n"), None);
        assert!(Exact.compare(b"0 1", "0 1\n").is_some());
    }

    #[test]
    fn exact_does_not_decode() {
        // A truncated sequence decodes to U+FFFD.
        assert!(Exact.compare(b"caf\xc3", "caf\u{FFFD}").is_some());
        assert_eq!(Exact.compare(b"caf\xc3\xa9", "café"), None);
    }

    #[test]
    fn whitespace_ignores_layout() {
        assert_eq!(Whitespace.compare(b"0  1\n\n", "0 1"), None);
        assert_eq!(Whitespace.compare(b"0\n1\n", "0 1\n"), None);
        assert!(Whitespace.compare(b"0 1\n", "1 2\n").is_some());
        assert!(Whitespace.compare(b"0 1 2\n", "0 1\n").is_some());
    }

    #[test]
    fn numeric_tolerance() {
        let cmp = Numeric {
            abs: 1e-6,
            rel: 1e-9,
        };
        assert_eq!(cmp.compare(b"3.1415926\n", "3.14159260001"), None);
        assert!(cmp.compare(b"3.14\n", "3.1415926").is_some());
        assert_eq!(cmp.compare(b"yes 1.0", "yes 1"), None);
        assert!(cmp.compare(b"no 1.0", "yes 1").is_some());
        assert!(cmp.compare(b"1 2", "1").is_some());
        assert!(cmp.compare(b"nan", "nan").is_none());
        assert!(cmp.compare(b"nan", "1").is_some());
    }

    #[test]
    fn diff_marks_lines() {
        let d = diff("0 1\nx\n", "1 2\nx\n");
        assert!(d.contains("- 0 1"), "{}", d);
        assert!(d.contains("+ 1 2"), "{}", d);
        assert!(d.contains("  x"), "{}", d);
    }

    #[test]
    fn kind_from_json() {
        let k: ComparatorKind = serde_json::from_str(r#"{"kind":"numeric","abs":0.001}"#).unwrap();
        assert_eq!(k, ComparatorKind::Numeric { abs: 0.001, rel: 0.0 });
        assert_eq!(ComparatorKind::default(), ComparatorKind::Whitespace);
        assert!(k.build().compare(b"1.0005", "1").is_none());
    }
}
