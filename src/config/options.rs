//! Key/value option store for matrices, solvers and preconditioners.
//!
//! Options are set programmatically or parsed from command-line style
//! arguments (`-ksp_type cgs -ksp_rtol 1e-8 -mat_use_hash_table`). Keys are
//! stored without the leading dash. Consumers only ever ask "value of X, or
//! default Y"; a value that does not parse is an [`KError::InvalidOption`].

use crate::error::KError;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Default)]
pub struct Options {
    values: HashMap<String, String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `-key value` pairs; a key followed by another key (or nothing) is a flag.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut opts = Self::new();
        let mut pending: Option<String> = None;
        for arg in args {
            let arg = arg.as_ref();
            match arg.strip_prefix('-').filter(|k| !k.is_empty() && f64::from_str(arg).is_err()) {
                Some(key) => {
                    if let Some(flag) = pending.replace(key.to_string()) {
                        opts.set(&flag, "true");
                    }
                }
                None => {
                    if let Some(key) = pending.take() {
                        opts.set(&key, arg);
                    }
                }
            }
        }
        if let Some(flag) = pending {
            opts.set(&flag, "true");
        }
        opts
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.trim_start_matches('-').to_string(), value.into());
        self
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parsed value of `key`, or `default` if unset.
    pub fn get_or<V: FromStr>(&self, key: &str, default: V) -> Result<V, KError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(v) => v.trim().parse().map_err(|_| invalid(key, v)),
        }
    }

    /// Parsed value of `key` if set.
    pub fn get<V: FromStr>(&self, key: &str) -> Result<Option<V>, KError> {
        self.values
            .get(key)
            .map(|v| v.trim().parse().map_err(|_| invalid(key, v)))
            .transpose()
    }

    /// Boolean switch; a bare flag counts as `true`.
    pub fn get_flag(&self, key: &str) -> Result<bool, KError> {
        match self.values.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "" | "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(invalid(key, &v)),
            },
        }
    }

    /// Two comma-separated values, e.g. `-ksp_chebyshev_eigenvalues 0.5,2`.
    pub fn get_pair<V: FromStr>(&self, key: &str) -> Result<Option<(V, V)>, KError> {
        let Some(raw) = self.values.get(key) else {
            return Ok(None);
        };
        let mut parts = raw.split(',').map(str::trim);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), None) => match (a.parse(), b.parse()) {
                (Ok(a), Ok(b)) => Ok(Some((a, b))),
                _ => Err(invalid(key, raw)),
            },
            _ => Err(invalid(key, raw)),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

fn invalid(key: &str, value: &str) -> KError {
    KError::InvalidOption { key: key.to_string(), value: value.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_flags_and_negative_numbers() {
        let opts = Options::from_args([
            "-ksp_type", "cgs", "-mat_use_hash_table", "-ksp_rtol", "1e-8", "-shift", "-2.5", "-trailing",
        ]);
        assert_eq!(opts.get_str("ksp_type"), Some("cgs"));
        assert!(opts.get_flag("mat_use_hash_table").unwrap());
        assert_eq!(opts.get_or("ksp_rtol", 1e-5).unwrap(), 1e-8);
        assert_eq!(opts.get_or("shift", 0.0).unwrap(), -2.5);
        assert!(opts.get_flag("trailing").unwrap());
        assert!(!opts.get_flag("missing").unwrap());
        assert_eq!(opts.get_or("ksp_max_it", 10000usize).unwrap(), 10000);
    }

    #[test]
    fn bad_values_are_reported() {
        let mut opts = Options::new();
        opts.set("ksp_max_it", "many").set("ksp_chebyshev_eigenvalues", "0.5,2");
        assert!(matches!(
            opts.get_or("ksp_max_it", 1usize),
            Err(KError::InvalidOption { ref key, .. }) if key == "ksp_max_it"
        ));
        assert_eq!(opts.get_pair::<f64>("ksp_chebyshev_eigenvalues").unwrap(), Some((0.5, 2.0)));
        opts.set("ksp_chebyshev_eigenvalues", "1");
        assert!(opts.get_pair::<f64>("ksp_chebyshev_eigenvalues").is_err());
    }
}
