use crate::build_config::{BuildConfig, ConfigError};

/// Ordered environment variables handed to a build, in the order the
/// launcher expects them.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct EnvVars(Vec<(String, String)>);

impl EnvVars {
    pub fn new() -> Self {
        EnvVars(Vec::new())
    }

    /// Variables every launcher needs to reach the build-tracking API, the
    /// store and the UI for this build.
    pub fn for_launcher(config: &BuildConfig) -> Result<Self, ConfigError> {
        let mut env = EnvVars::new();
        env.push("TOKEN", config.str("token")?);
        env.push("API", config.str("apiUri")?);
        env.push("STORE", config.str("storeUri")?);
        env.push("UI", config.str("uiUri")?);
        env.push("TIMEOUT", config.int("buildTimeout")?.to_string());
        env.push("SDBUILDID", config.int("buildId")?.to_string());
        Ok(env)
    }

    /// Append a variable, replacing the value if the name is already set
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl From<EnvVars> for Vec<String> {
    /// Convert EnvVars to Vec<String> where each string is formatted as "Key=Value"
    fn from(env_vars: EnvVars) -> Self {
        env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}
