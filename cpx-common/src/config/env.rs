//! Environment variable parsing with type safety.
//!
//! The daemon is configured the way the build wrappers expect: `GOMA_*`
//! variables consulted once at startup. The parser collects every problem
//! it sees so all of them can be reported in one startup failure instead
//! of one per restart.

use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("path not found for {var}: {path}")]
    PathNotFound { var: String, path: PathBuf },

    #[error("value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the GOMA_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "GOMA_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> String {
        match env::var(self.var_name(name)) {
            Ok(value) => value,
            Err(_) => default.to_string(),
        }
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Option<String> {
        match env::var(self.var_name(name)) {
            Ok(value) if value.is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => None,
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "boolean (true/false/1/0/yes/no)".to_string(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> u64 {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.parse::<u64>() {
                Ok(n) if n >= min && n <= max => n,
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name,
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    default
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "unsigned 64-bit integer".to_string(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    /// Get a path value with ~ expansion.
    ///
    /// If `must_exist` is true, records an error if the path doesn't exist.
    pub fn get_path(&mut self, name: &str, default: &str, must_exist: bool) -> PathBuf {
        let var_name = self.var_name(name);
        let value = match env::var(&var_name) {
            Ok(v) => v,
            Err(_) => default.to_string(),
        };

        let expanded = if let Some(stripped) = value.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                home.join(stripped)
            } else {
                PathBuf::from(&value)
            }
        } else {
            PathBuf::from(&value)
        };

        if must_exist && !expanded.exists() {
            self.errors.push(EnvError::PathNotFound {
                var: var_name,
                path: expanded.clone(),
            });
        }

        expanded
    }

    /// Get an optional path (None if not set or empty), with ~ expansion.
    pub fn get_optional_path(&mut self, name: &str) -> Option<PathBuf> {
        let value = self.get_optional_string(name)?;
        if let Some(stripped) = value.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return Some(home.join(stripped));
            }
        }
        Some(PathBuf::from(value))
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: tests are serialized via env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: tests are serialized via env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_values() {
        let _guard = env_test_lock();
        let vars = ["GOMA_TEST_BOOL"];
        cleanup_env(&vars);

        for val in &["1", "true", "yes", "on", "TRUE"] {
            set_env("GOMA_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert!(parser.get_bool("TEST_BOOL", false), "expected true for '{val}'");
            assert!(!parser.has_errors());
        }
        for val in &["0", "false", "no", "off", ""] {
            set_env("GOMA_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert!(!parser.get_bool("TEST_BOOL", true), "expected false for '{val}'");
            assert!(!parser.has_errors());
        }

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_bool_invalid_uses_default() {
        let _guard = env_test_lock();
        let vars = ["GOMA_BAD_BOOL"];
        cleanup_env(&vars);

        set_env("GOMA_BAD_BOOL", "maybe");
        let mut parser = EnvParser::new();
        assert!(!parser.get_bool("BAD_BOOL", false));
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_u64_range() {
        let _guard = env_test_lock();
        let vars = ["GOMA_TEST_U64"];
        cleanup_env(&vars);

        set_env("GOMA_TEST_U64", "50");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_U64", 10, 0, 100), 50);
        assert!(!parser.has_errors());

        set_env("GOMA_TEST_U64", "200");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_U64", 10, 0, 100), 10);
        assert!(parser.has_errors());

        set_env("GOMA_TEST_U64", "nope");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_U64", 10, 0, 100), 10);
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_optional_string_empty_is_none() {
        let _guard = env_test_lock();
        let vars = ["GOMA_TEST_OPT"];
        cleanup_env(&vars);

        let mut parser = EnvParser::new();
        assert!(parser.get_optional_string("TEST_OPT").is_none());

        set_env("GOMA_TEST_OPT", "");
        let mut parser = EnvParser::new();
        assert!(parser.get_optional_string("TEST_OPT").is_none());

        set_env("GOMA_TEST_OPT", "value");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_optional_string("TEST_OPT").as_deref(), Some("value"));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_path_tilde_expansion() {
        let _guard = env_test_lock();
        let vars = ["GOMA_TEST_PATH"];
        cleanup_env(&vars);

        set_env("GOMA_TEST_PATH", "~/cache");
        let mut parser = EnvParser::new();
        let path = parser.get_path("TEST_PATH", "/tmp/default", false);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(path, home.join("cache"));
        }

        cleanup_env(&vars);
    }

    mod proptest_env_parsing {
        use super::*;
        use proptest::prelude::*;

        fn parse_bool_string(value: &str) -> Option<bool> {
            match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" | "" => Some(false),
                _ => None,
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            // Arbitrary strings never panic the boolean grammar.
            #[test]
            fn bool_grammar_total(s in ".*") {
                let _ = parse_bool_string(&s);
            }

            // The parser accepts exactly the documented spellings.
            #[test]
            fn bool_grammar_accepts_known_spellings(s in "[a-zA-Z0-9_-]{0,12}") {
                let valid_true = ["1", "true", "yes", "on"];
                let valid_false = ["0", "false", "no", "off", ""];
                let is_valid = valid_true.iter().chain(&valid_false)
                    .any(|v| s.eq_ignore_ascii_case(v));
                prop_assert_eq!(parse_bool_string(&s).is_some(), is_valid);
            }

            // EnvParser numeric parsing never panics and clamps to default
            // on anything out of range or malformed.
            #[test]
            fn u64_parsing_total(value in "[-0-9a-zA-Z. ]{0,24}") {
                let _guard = env_test_lock();
                let var = "GOMA_PROPTEST_U64";
                set_env(var, &value);
                let mut parser = EnvParser::new();
                let out = parser.get_u64_range("PROPTEST_U64", 7, 0, 1000);
                match value.parse::<u64>() {
                    Ok(n) if n <= 1000 => prop_assert_eq!(out, n),
                    _ => prop_assert_eq!(out, 7),
                }
                cleanup_env(&[var]);
            }
        }
    }
}
