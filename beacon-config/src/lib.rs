// Layered settings store for beacon
//
// Keys are case-insensitive and `.`/`-` are equivalent to `_`, so the same
// setting can come from a TOML table, a properties file or an environment
// variable. Later loads override earlier ones.

pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use validation::{ConfigValidator, Validate};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Canonical form of a settings key.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Main configuration manager
#[derive(Clone, Debug)]
pub struct ConfigManager {
    config: Arc<RwLock<HashMap<String, Value>>>,
    env_prefixes: Vec<String>,
}

impl ConfigManager {
    /// Create an empty configuration manager
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(HashMap::new())),
            env_prefixes: vec!["BEACON".to_string()],
        }
    }

    /// Create with the environment variable prefixes used by [`load_env`](Self::load_env)
    pub fn with_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            config: Arc::new(RwLock::new(HashMap::new())),
            env_prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from key/value pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let manager = Self::new();
        {
            let mut config = manager.config.write();
            for (key, value) in pairs {
                config.insert(normalize_key(key.as_ref()), Value::String(value.into()));
            }
        }
        manager
    }

    /// Load configuration from environment variables
    pub fn load_env(&self) {
        let loader = EnvLoader::new(self.env_prefixes.clone());
        let env_vars = loader.load();

        let mut config = self.config.write();
        for (key, value) in env_vars {
            config.insert(key, Value::String(value));
        }
    }

    /// Load a `.env` file into the process environment, then load the environment
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        if let Some(path) = path {
            dotenvy::from_path(path).map_err(|e| ConfigError::LoadError(e.to_string()))?;
        } else {
            dotenvy::dotenv().ok(); // Ignore if .env doesn't exist
        }
        self.load_env();
        Ok(())
    }

    /// Load configuration from file; nested tables are flattened
    pub fn load_file(&self, path: impl AsRef<Path>, format: FileFormat) -> Result<()> {
        let loader = ConfigLoader::new(format);
        let data = loader.load_file(path)?;
        self.merge_value(data)
    }

    /// Merge a parsed document; nested tables are flattened
    pub fn merge_value(&self, data: Value) -> Result<()> {
        let Value::Object(map) = data else {
            return Err(ConfigError::ParseError(
                "configuration root must be a table".to_string(),
            ));
        };

        let mut flat = Vec::new();
        for (key, value) in map {
            flatten(&key, value, &mut flat);
        }

        let mut config = self.config.write();
        for (key, value) in flat {
            config.insert(normalize_key(&key), value);
        }

        Ok(())
    }

    /// Set a configuration value
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value = serde_json::to_value(value)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        self.config.write().insert(normalize_key(key), json_value);

        Ok(())
    }

    /// Remove a configuration value
    pub fn remove(&self, key: &str) -> bool {
        self.config.write().remove(&normalize_key(key)).is_some()
    }

    /// Get a configuration value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .raw(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;

        decode(key, &value)
    }

    /// Get a configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Resolve a setting that has a legacy alias.
    ///
    /// The primary key wins when present; blank strings count as absent.
    /// A present value that cannot be decoded is an error.
    pub fn get_aliased<T: DeserializeOwned>(&self, primary: &str, alias: &str) -> Result<Option<T>> {
        for key in [primary, alias] {
            match self.raw(key) {
                Some(value) if !is_blank(&value) => return decode(key, &value).map(Some),
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Get a string value
    pub fn get_string(&self, key: &str) -> Result<String> {
        self.get(key)
    }

    /// Get an integer value
    pub fn get_int(&self, key: &str) -> Result<i64> {
        self.get(key)
    }

    /// Get a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.get(key)
    }

    /// Check if a key exists
    pub fn has(&self, key: &str) -> bool {
        self.config.read().contains_key(&normalize_key(key))
    }

    /// Get all configuration keys
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.config.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Merge configuration from another manager; `other` wins on conflicts
    pub fn merge(&self, other: &ConfigManager) {
        if Arc::ptr_eq(&self.config, &other.config) {
            return;
        }
        let other_config = other.config.read().clone();
        self.config.write().extend(other_config);
    }

    /// Deserialize the whole store into a typed value and validate it
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let json_value = Value::Object(
            self.config
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        let validated: T = serde_json::from_value(json_value).map_err(|e| {
            ConfigError::InvalidValue {
                key: "<root>".to_string(),
                message: e.to_string(),
            }
        })?;

        validated.validate()?;

        Ok(validated)
    }

    fn raw(&self, key: &str) -> Option<Value> {
        self.config.read().get(&normalize_key(key)).cloned()
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn flatten(prefix: &str, value: Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten(&format!("{}.{}", prefix, key), nested, out);
            }
        }
        other => out.push((prefix.to_string(), other)),
    }
}

// Values from env vars and properties files are always strings, so typed
// reads fall back to parsing the string as a JSON scalar.
fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    };

    match serde_json::from_value::<T>(value.clone()) {
        Ok(decoded) => Ok(decoded),
        Err(err) => match value {
            Value::String(s) => {
                serde_json::from_str::<T>(s.trim()).map_err(|_| invalid(err.to_string()))
            }
            Value::Number(_) | Value::Bool(_) => {
                serde_json::from_value::<T>(Value::String(value.to_string()))
                    .map_err(|_| invalid(err.to_string()))
            }
            _ => Err(invalid(err.to_string())),
        },
    }
}
