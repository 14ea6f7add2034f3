use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_CONTAINER: &str = "aws/codebuild/standard:5.0";
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("missing required config key '{0}'")]
    Missing(String),
    #[error("config key '{0}' is empty")]
    Empty(String),
    #[error("config key '{key}' must be {expected}, got {actual}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("config key '{0}' is out of range for a 64-bit signed integer")]
    OutOfRange(String),
}

/// The open-ended `buildConfig` object carried by a build message.
///
/// Values keep their JSON representation, so integers such as build ids stay
/// exact. Executors read fields through the typed accessors on [`Section`],
/// which fail with a [`ConfigError`] naming the full key path.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildConfig(Map<String, Value>);

impl BuildConfig {
    /// Config pre-seeded with the top-level defaults. Keys present in a
    /// decoded message overwrite these.
    pub fn with_defaults() -> Self {
        let mut map = Map::new();
        map.insert("container".to_string(), json!(DEFAULT_CONTAINER));
        map.insert(
            "serviceAccountName".to_string(),
            json!(DEFAULT_SERVICE_ACCOUNT),
        );
        BuildConfig(map)
    }

    #[cfg(test)]
    pub fn inner(&self) -> &Map<String, Value> {
        &self.0
    }

    #[cfg(test)]
    pub fn inner_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// Merge the given object into this one, overriding any existing keys
    pub fn merge(&mut self, other: Map<String, Value>) {
        self.0.extend(other);
    }

    /// Fill absent (or `null`) keys of the `provider` section. Keys already
    /// present are never touched.
    pub fn apply_provider_defaults(&mut self) -> Result<(), ConfigError> {
        let provider = self
            .0
            .entry("provider")
            .or_insert_with(|| Value::Object(Map::new()));
        if provider.is_null() {
            *provider = Value::Object(Map::new());
        }
        let provider = match provider {
            Value::Object(map) => map,
            other => {
                return Err(ConfigError::WrongType {
                    key: "provider".to_string(),
                    expected: "an object",
                    actual: kind(other),
                })
            }
        };

        for (key, value) in provider_defaults() {
            let slot = provider.entry(key).or_insert(Value::Null);
            if slot.is_null() {
                *slot = value;
            }
        }
        Ok(())
    }

    pub fn root(&self) -> Section<'_> {
        Section {
            path: String::new(),
            map: &self.0,
        }
    }

    pub fn provider(&self) -> Result<Section<'_>, ConfigError> {
        self.root().section("provider")
    }

    /// Region executors for this build are instantiated in: `buildRegion`
    /// when set, else the provider's home `region`.
    pub fn build_region(&self) -> Result<String, ConfigError> {
        let provider = self.provider()?;
        match provider.opt_str("buildRegion")? {
            Some(region) if !region.is_empty() => Ok(region.to_string()),
            _ => provider.str("region").map(str::to_string),
        }
    }

    pub fn str(&self, key: &str) -> Result<&str, ConfigError> {
        self.root().str(key)
    }

    #[cfg(test)]
    pub fn opt_str(&self, key: &str) -> Result<Option<&str>, ConfigError> {
        self.root().opt_str(key)
    }

    pub fn int(&self, key: &str) -> Result<i64, ConfigError> {
        self.root().int(key)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        self.root().bool_or(key, default)
    }
}

fn provider_defaults() -> Vec<(&'static str, Value)> {
    vec![
        ("executorLogs", json!(false)),
        ("dlc", json!(false)),
        ("privilegedMode", json!(false)),
        ("prune", json!(true)),
        ("imagePullCredentialsType", json!("SERVICE_ROLE")),
        ("environmentType", json!("LINUX_CONTAINER")),
        ("computeType", json!("BUILD_GENERAL1_SMALL")),
        ("queuedTimeout", json!(5)),
        ("launcherComputeType", json!("BUILD_GENERAL1_SMALL")),
        ("buildRegion", json!("")),
        ("debugSession", json!(false)),
    ]
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_f64() => "a float",
        Value::Number(_) => "an integer",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A borrowed view on one object level of a [`BuildConfig`].
#[derive(Debug, Clone)]
pub struct Section<'a> {
    path: String,
    map: &'a Map<String, Value>,
}

impl<'a> Section<'a> {
    fn key_path(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }

    fn wrong_type(&self, key: &str, expected: &'static str, value: &Value) -> ConfigError {
        ConfigError::WrongType {
            key: self.key_path(key),
            expected,
            actual: kind(value),
        }
    }

    /// `null` counts as absent.
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn require(&self, key: &str) -> Result<&'a Value, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::Missing(self.key_path(key)))
    }

    /// Required, non-empty string.
    pub fn str(&self, key: &str) -> Result<&'a str, ConfigError> {
        match self.require(key)? {
            Value::String(s) if s.is_empty() => Err(ConfigError::Empty(self.key_path(key))),
            Value::String(s) => Ok(s.as_str()),
            other => Err(self.wrong_type(key, "a string", other)),
        }
    }

    pub fn opt_str(&self, key: &str) -> Result<Option<&'a str>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.wrong_type(key, "a string", other)),
        }
    }

    /// Required JSON integer. Floats are rejected rather than truncated.
    pub fn int(&self, key: &str) -> Result<i64, ConfigError> {
        let value = self.require(key)?;
        match value {
            Value::Number(n) if n.is_u64() && n.as_i64().is_none() => {
                Err(ConfigError::OutOfRange(self.key_path(key)))
            }
            _ => value
                .as_i64()
                .ok_or_else(|| self.wrong_type(key, "an integer", value)),
        }
    }

    pub fn bool(&self, key: &str) -> Result<bool, ConfigError> {
        let value = self.require(key)?;
        value
            .as_bool()
            .ok_or_else(|| self.wrong_type(key, "a boolean", value))
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(_) => self.bool(key),
        }
    }

    pub fn str_list(&self, key: &str) -> Result<Vec<&'a str>, ConfigError> {
        let value = self.require(key)?;
        let Value::Array(items) = value else {
            return Err(self.wrong_type(key, "an array of strings", value));
        };
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| self.wrong_type(key, "an array of strings", item))
            })
            .collect()
    }

    pub fn section(&self, key: &str) -> Result<Section<'a>, ConfigError> {
        match self.require(key)? {
            Value::Object(map) => Ok(Section {
                path: self.key_path(key),
                map,
            }),
            other => Err(self.wrong_type(key, "an object", other)),
        }
    }
}
