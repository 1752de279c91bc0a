//! Classification code normalization
//!
//! Spreadsheet exports write codes with zero padding ("C01.01") while the
//! building model emits unpadded codes, often at the end of a longer
//! hierarchical path ("Level 2/Walls/C1.1"). Every comparison inside the
//! sync layer happens on the canonical form produced by [`normalize`].
//!
//! **Canonical form:** uppercase ASCII letter prefix, then one or two digit
//! groups with leading zeros stripped, joined by a single dot ("C1.1").
//! Strings that do not have that shape are returned trimmed and uppercased
//! only. Normalization never fails.

use std::fmt;

/// Separators that introduce a hierarchical path in model-side codes
const PATH_SEPARATORS: [char; 2] = ['/', '\\'];

/// Canonicalize a classification code
///
/// **Algorithm:**
/// 1. Trim and uppercase
/// 2. Strip internal whitespace
/// 3. Keep only the last path segment if a separator is present
/// 4. Match `LETTERS DIGITS [. DIGITS]`, stripping leading zeros per group
///    ("00" becomes "0", never empty)
/// 5. On no match, return the trimmed/uppercased input unchanged
///
/// `normalize(&normalize(x)) == normalize(x)` holds for every input.
///
/// # Examples
///
/// ```
/// use costlink_common::code::normalize;
///
/// assert_eq!(normalize("c01.01"), "C1.1");
/// assert_eq!(normalize("Level 2/Walls/C1.1"), "C1.1");
/// assert_eq!(normalize("  n/a "), "N/A");
/// ```
pub fn normalize(code: &str) -> String {
    let cleaned = code.trim().to_uppercase();
    let compact: String = cleaned.chars().filter(|c| !c.is_whitespace()).collect();
    let segment = compact
        .rsplit(|c: char| PATH_SEPARATORS.contains(&c))
        .next()
        .unwrap_or_default();

    match CodeParts::parse_canonical_shape(segment) {
        Some(parts) => parts.to_string(),
        None => cleaned,
    }
}

/// Parsed view of a code: letter prefix plus dot-separated digit groups
///
/// Digit groups are stored with leading zeros already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeParts {
    pub letters: String,
    pub groups: Vec<String>,
}

impl CodeParts {
    /// Parse a code of the canonical shape: letters, digits, optional `.digits`
    fn parse_canonical_shape(segment: &str) -> Option<Self> {
        let parts = Self::parse(segment)?;
        match parts.groups.len() {
            1 | 2 => Some(parts),
            _ => None,
        }
    }

    /// Parse letters followed by any number of dot-separated digit groups
    ///
    /// Accepts letter-only codes ("B") which the hierarchical helpers treat
    /// as the root of every code sharing that letter prefix.
    pub fn parse(segment: &str) -> Option<Self> {
        let letter_len = segment
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .count();
        if letter_len == 0 {
            return None;
        }

        let (letters, rest) = segment.split_at(letter_len);
        let mut groups = Vec::new();

        if !rest.is_empty() {
            for group in rest.split('.') {
                if group.is_empty() || !group.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                groups.push(strip_leading_zeros(group).to_string());
            }
        }

        Some(Self {
            letters: letters.to_ascii_uppercase(),
            groups,
        })
    }

    /// Letter prefix plus first digit group ("C2" for "C2.7")
    pub fn major(&self) -> Option<String> {
        self.groups
            .first()
            .map(|major| format!("{}{}", self.letters, major))
    }
}

impl fmt::Display for CodeParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.letters, self.groups.join("."))
    }
}

fn strip_leading_zeros(group: &str) -> &str {
    let stripped = group.trim_start_matches('0');
    if stripped.is_empty() {
        "0"
    } else {
        stripped
    }
}

/// Dot-free comparison key with leading zeros of the numeric tail removed
///
/// "C1.10" and "C11.0" both compact to "C110"; used as the first fuzzy tier.
pub fn compact_key(code: &str) -> String {
    let canonical = normalize(code);
    let without_dots: String = canonical.chars().filter(|c| *c != '.').collect();

    let letter_len = without_dots
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .count();
    let (letters, digits) = without_dots.split_at(letter_len);

    if !letters.is_empty() && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        format!("{}{}", letters, strip_leading_zeros(digits))
    } else {
        without_dots
    }
}

/// True when `coarse` is a hierarchical ancestor of (or equal to) `fine`
///
/// Parsed codes compare segment-wise so "C2" covers "C2.1" but not "C20".
/// Codes outside the letter/digit shape fall back to a plain string prefix.
pub fn is_code_prefix(coarse: &str, fine: &str) -> bool {
    let coarse = normalize(coarse);
    let fine = normalize(fine);

    match (CodeParts::parse(&coarse), CodeParts::parse(&fine)) {
        (Some(c), Some(f)) => c.letters == f.letters && f.groups.starts_with(&c.groups),
        _ => !coarse.is_empty() && fine.starts_with(&coarse),
    }
}

/// Letter prefix and first digit group of a code, if it has one
pub fn major_key(code: &str) -> Option<String> {
    CodeParts::parse(&normalize(code)).and_then(|parts| parts.major())
}
