// Environment variable loading

use crate::normalize_key;
use std::collections::HashMap;
use std::env;

/// Loads environment variables whose names start with one of the prefixes.
///
/// Prefixes are kept in the resulting keys, so `BEACON_SESSION_TIMEOUT`
/// becomes `beacon_session_timeout`. An empty prefix list loads everything.
pub struct EnvLoader {
    prefixes: Vec<String>,
}

impl EnvLoader {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.into().trim_end_matches('_').to_uppercase())
                .collect(),
        }
    }

    fn accepts(&self, name: &str) -> bool {
        if self.prefixes.is_empty() {
            return true;
        }
        let upper = name.to_uppercase();
        self.prefixes.iter().any(|prefix| {
            upper
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('_'))
        })
    }

    /// Load matching variables from the process environment.
    pub fn load(&self) -> HashMap<String, String> {
        self.load_from(env::vars())
    }

    /// Load matching variables from an explicit list of pairs.
    pub fn load_from<I>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        vars.into_iter()
            .filter(|(name, _)| self.accepts(name))
            .map(|(name, value)| (normalize_key(&name), value))
            .collect()
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(["BEACON"])
    }
}
