//! Settings read once, while the tracker is wiring itself to the real allocator.
//!
//! Reading the environment allocates, so these functions must only run during the
//! initialization window, when allocations are served by the bootstrap pool.

use std::{env, ffi::OsString, path::PathBuf};

use crate::error::Error;

/// Mandatory: path of the leak report, opened in append mode at exit.
pub const REPORT_PATH_VAR: &str = "LEAK_REPORT_PATH";
/// Optional: when enabled, every observed `malloc`/`free` is traced to stderr.
pub const PRINT_VAR: &str = "LEAK_REPORT_PRINT";
/// Optional: `env_logger` filter for the tracker's own diagnostics.
pub const LOG_VAR: &str = "LEAK_REPORT_LOG";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub report_path: PathBuf,
    pub debug_print: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| env::var_os(name))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let report_path = match lookup(REPORT_PATH_VAR) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => return Err(Error::MissingConfig(REPORT_PATH_VAR)),
        };
        let debug_print = lookup(PRINT_VAR)
            .map(|value| parse_flag(&value.to_string_lossy()))
            .unwrap_or(false);

        Ok(Config {
            report_path,
            debug_print,
        })
    }
}

fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    ["1", "true", "yes", "on"]
        .iter()
        .any(|on| value.eq_ignore_ascii_case(on))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_in<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<OsString> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| OsString::from(value))
        }
    }

    #[test]
    fn missing_report_path_is_an_error() {
        let err = Config::from_lookup(lookup_in(&[(PRINT_VAR, "1")])).unwrap_err();
        assert!(matches!(err, Error::MissingConfig(REPORT_PATH_VAR)));
        assert_eq!(err.exit_code(), Some(crate::error::EXIT_MISSING_CONFIG));
    }

    #[test]
    fn empty_report_path_counts_as_missing() {
        let err = Config::from_lookup(lookup_in(&[(REPORT_PATH_VAR, "")])).unwrap_err();
        assert!(matches!(err, Error::MissingConfig(_)));
    }

    #[test]
    fn debug_print_defaults_to_off() {
        let config = Config::from_lookup(lookup_in(&[(REPORT_PATH_VAR, "/tmp/leaks")])).unwrap();
        assert_eq!(
            config,
            Config {
                report_path: PathBuf::from("/tmp/leaks"),
                debug_print: false,
            }
        );
    }

    #[test]
    fn debug_print_accepts_boolean_like_values() {
        for value in &["1", "true", " YES ", "On"] {
            let vars = [(REPORT_PATH_VAR, "/tmp/leaks"), (PRINT_VAR, *value)];
            assert!(Config::from_lookup(lookup_in(&vars)).unwrap().debug_print, "{}", value);
        }
        for value in &["0", "", "false", "2"] {
            let vars = [(REPORT_PATH_VAR, "/tmp/leaks"), (PRINT_VAR, *value)];
            assert!(!Config::from_lookup(lookup_in(&vars)).unwrap().debug_print, "{}", value);
        }
    }
}
