// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error code registry.
//!
//! Maps codes to titles and categories. `C01xx` suspension placement,
//! `C02xx` captures, `C03xx` body structure, `C04xx` limits, `C09xx`
//! warnings.

use std::collections::HashMap;

pub struct ErrorCodeRegistry {
    codes: HashMap<&'static str, ErrorCodeInfo>,
}

pub struct ErrorCodeInfo {
    pub code: &'static str,
    pub title: &'static str,
    pub category: ErrorCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Placement,
    Capture,
    Structure,
    Limit,
    Lint,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Placement => write!(f, "Placement"),
            ErrorCategory::Capture => write!(f, "Capture"),
            ErrorCategory::Structure => write!(f, "Structure"),
            ErrorCategory::Limit => write!(f, "Limit"),
            ErrorCategory::Lint => write!(f, "Lint"),
        }
    }
}

macro_rules! register_codes {
    ($($code:literal => ($title:literal, $cat:expr)),* $(,)?) => {{
        let mut map = HashMap::new();
        $(
            map.insert($code, ErrorCodeInfo {
                code: $code,
                title: $title,
                category: $cat,
            });
        )*
        map
    }};
}

impl Default for ErrorCodeRegistry {
    fn default() -> Self {
        use ErrorCategory::*;

        Self {
            codes: register_codes! {
                // Suspension placement (C01xx)
                "C0101" => ("suspension inside a lock body", Placement),
                "C0102" => ("suspension inside an unsafe block", Placement),
                "C0103" => ("suspension inside an exception filter", Placement),
                "C0104" => ("suspension inside constructor chaining", Placement),
                "C0105" => ("suspension inside a finally body", Placement),
                "C0106" => ("suspension inside a closure", Placement),

                // Captures (C02xx)
                "C0201" => ("unstorable value live across a suspension", Capture),
                "C0202" => ("closure reads an uncaptured variable", Capture),

                // Structure (C03xx)
                "C0301" => ("generator returns a value", Structure),
                "C0302" => ("jump outside of a loop", Structure),
                "C0303" => ("jump out of a finally body", Structure),

                // Limits (C04xx)
                "C0401" => ("too many states", Limit),

                // Warnings (C09xx)
                "C0901" => ("async function without wait points", Lint),
            },
        }
    }
}

impl ErrorCodeRegistry {
    pub fn get(&self, code: &str) -> Option<&ErrorCodeInfo> {
        self.codes.get(code)
    }

    pub fn all(&self) -> impl Iterator<Item = &ErrorCodeInfo> {
        self.codes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_keyed_by_themselves() {
        let registry = ErrorCodeRegistry::default();
        for info in registry.all() {
            assert_eq!(registry.get(info.code).map(|i| i.code), Some(info.code));
        }
        assert_eq!(registry.get("C0401").map(|i| i.category), Some(ErrorCategory::Limit));
        assert!(registry.get("E0001").is_none());
    }
}
