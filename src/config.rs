// jobsentry: configuration support

use crate::error::AgentError;
use serde::de::DeserializeOwned;
use serde_yaml::Value;

/// Read-only typed view over a YAML document loaded once at startup.
///
/// Mirrors the original agent's `Config` contract: dotted section/key
/// lookups with typed getters, plus a struct-array getter that accepts a
/// per-element parse function for sections like `indexs` or `collectors`
/// that are lists of small records rather than scalars.
#[derive(Debug, Clone)]
pub struct Config {
    root: Value,
}

impl Config {
    pub fn from_str(yaml: &str) -> Result<Self, AgentError> {
        let root: Value = serde_yaml::from_str(yaml).map_err(|e| AgentError::ConfigInvalid {
            path: "<root>".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { root })
    }

    pub fn from_file(path: &str) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigInvalid {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Self::from_str(&content)
    }

    fn section(&self, section: &str) -> Result<&Value, AgentError> {
        self.root.get(section).ok_or_else(|| AgentError::ConfigInvalid {
            path: section.to_string(),
            message: "missing section".to_string(),
        })
    }

    fn field(&self, section: &str, key: &str) -> Result<Value, AgentError> {
        let sect = self.section(section)?;
        sect.get(key)
            .cloned()
            .ok_or_else(|| AgentError::ConfigInvalid {
                path: format!("{section}.{key}"),
                message: "missing key".to_string(),
            })
    }

    pub fn get_int(&self, section: &str, key: &str) -> Result<i64, AgentError> {
        self.field(section, key)?
            .as_i64()
            .ok_or_else(|| type_error(section, key, "int"))
    }

    pub fn get_float(&self, section: &str, key: &str) -> Result<f64, AgentError> {
        self.field(section, key)?
            .as_f64()
            .ok_or_else(|| type_error(section, key, "float"))
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Result<bool, AgentError> {
        self.field(section, key)?
            .as_bool()
            .ok_or_else(|| type_error(section, key, "bool"))
    }

    pub fn get_string(&self, section: &str, key: &str) -> Result<String, AgentError> {
        self.field(section, key)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| type_error(section, key, "string"))
    }

    pub fn get_string_opt(&self, section: &str, key: &str) -> Option<String> {
        self.section(section)
            .ok()
            .and_then(|s| s.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Plain scalar array, e.g. `freq: [1, 2, 3]`.
    pub fn get_array<T: DeserializeOwned>(&self, section: &str, key: &str) -> Result<Vec<T>, AgentError> {
        let v = self.field(section, key)?;
        serde_yaml::from_value(v).map_err(|e| type_error(section, key, &e.to_string()))
    }

    /// Struct-array getter: deserializes each array element with `parse`,
    /// skipping (and logging) elements that do not match rather than
    /// failing the whole array — mirrors the tolerant per-element behavior
    /// the bulk HTTP sink and collector lookup tables rely on.
    pub fn get_array_with<T, F>(&self, section: &str, key: &str, parse: F) -> Result<Vec<T>, AgentError>
    where
        F: Fn(&Value) -> Option<T>,
    {
        let arr = self
            .field(section, key)?
            .as_sequence()
            .ok_or_else(|| type_error(section, key, "array"))?
            .clone();
        let mut out = Vec::with_capacity(arr.len());
        for (i, item) in arr.iter().enumerate() {
            match parse(item) {
                Some(parsed) => out.push(parsed),
                None => {
                    tracing::warn!(section, key, index = i, "skipping malformed array element");
                }
            }
        }
        Ok(out)
    }
}

fn type_error(section: &str, key: &str, want: &str) -> AgentError {
    AgentError::ConfigInvalid {
        path: format!("{section}.{key}"),
        message: format!("expected {want}"),
    }
}
