//! Limit declarations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a limit or trigger selects the stat keys it observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMatch {
    Exact,
    Prefix,
}

/// A declarative rule halting execution once a tracked value strictly
/// exceeds `threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub mode: KeyMatch,
    pub key: String,
    pub threshold: f64,
}

impl Limit {
    pub fn exact(key: impl Into<String>, threshold: f64) -> Self {
        Self {
            mode: KeyMatch::Exact,
            key: key.into(),
            threshold,
        }
    }

    pub fn prefix(prefix: impl Into<String>, threshold: f64) -> Self {
        Self {
            mode: KeyMatch::Prefix,
            key: prefix.into(),
            threshold,
        }
    }

    /// Strictly greater than: a value equal to the threshold is still within
    /// the limit.
    pub fn is_exceeded_by(&self, value: f64) -> bool {
        value > self.threshold
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            KeyMatch::Exact => write!(f, "{} > {}", self.key, self.threshold),
            KeyMatch::Prefix => write!(f, "{}* > {}", self.key, self.threshold),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_exclusive() {
        let limit = Limit::exact("llm.calls", 10.0);
        assert!(!limit.is_exceeded_by(10.0));
        assert!(limit.is_exceeded_by(11.0));
    }

    #[test]
    fn limit_declarations_deserialize() {
        let limits: Vec<Limit> = serde_json::from_str(
            r#"[{"mode":"exact","key":"iterations","threshold":20},
                {"mode":"prefix","key":"llm.tokens.","threshold":50000}]"#,
        )
        .unwrap();
        assert_eq!(limits[0], Limit::exact("iterations", 20.0));
        assert_eq!(limits[1].mode, KeyMatch::Prefix);
        assert_eq!(limits[1].to_string(), "llm.tokens.* > 50000");
    }
}
