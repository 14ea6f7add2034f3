use std::{env, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const CONFIG_FILE_NAME: &str = "build-dispatcher.toml";

/// Legacy variable names read by earlier deployments, mapped onto settings keys.
const LEGACY_OVERRIDES: [(&str, &str); 4] = [
    ("SDAPI_TIMEOUT_SECS", "tracking.timeout_secs"),
    ("SDAPI_MAXRETRIES", "tracking.max_retries"),
    ("SD_SLS_BUILD_BUCKET", "serverless.build_bucket"),
    (
        "SD_SLS_BUILD_ENCRYPTION_KEY_ALIAS",
        "serverless.encryption_key_alias",
    ),
];

#[derive(Debug, Clone, Deserialize)]
pub struct Core {
    pub port: u16,
    pub log_level: String,
    /// Largest accepted `POST /events` body.
    pub max_body_bytes: usize,
    /// Where panic stack traces are written. Defaults to the system temp dir.
    pub stacktrace_dir: Option<PathBuf>,
}

impl Core {
    pub fn stacktrace_dir(&self) -> PathBuf {
        self.stacktrace_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tracking {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_wait_min_ms: u64,
    pub retry_wait_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Eks {
    pub node_wait_timeout_ms: u64,
    pub node_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Serverless {
    pub build_bucket: Option<String>,
    pub encryption_key_alias: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub core: Core,
    pub tracking: Tracking,
    pub eks: Eks,
    #[serde(default)]
    pub serverless: Serverless,
}

/// Settings file location: `BUILD_DISPATCHER_CONFIG` when set (and then it
/// must exist), else `./build-dispatcher.toml`, else the copy under
/// `~/.build-dispatcher/`. No file at all is fine.
fn config_path() -> Result<Option<String>, ConfigError> {
    if let Ok(path) = env::var("BUILD_DISPATCHER_CONFIG") {
        if Path::new(&path).exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::Message(format!(
            "file path defined in BUILD_DISPATCHER_CONFIG does not exist: {}",
            path
        )));
    }

    if Path::new(CONFIG_FILE_NAME).exists() {
        return Ok(Some(CONFIG_FILE_NAME.to_string()));
    }

    Ok(dirs::home_dir()
        .map(|home| home.join(".build-dispatcher").join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
        .map(|path| format!("{}", path.display())))
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(config_path()?.as_deref(), |name| env::var(name).ok())
    }

    fn load(
        path: Option<&str>,
        legacy: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("core.port", 3000)?
            .set_default("core.log_level", "info")?
            .set_default("core.max_body_bytes", 6 * 1024 * 1024)?
            .set_default("tracking.timeout_secs", 10)?
            .set_default("tracking.max_retries", 5)?
            .set_default("tracking.retry_wait_min_ms", 100)?
            .set_default("tracking.retry_wait_max_ms", 300)?
            .set_default("eks.node_wait_timeout_ms", 90_000)?
            .set_default("eks.node_poll_interval_ms", 1_000)?;

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("dispatcher")
                .prefix_separator("_")
                .separator("__"),
        );

        for (variable, key) in LEGACY_OVERRIDES {
            builder = builder.set_override_option(key, legacy(variable))?;
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::load(None, |_| None).unwrap();
        assert_eq!(settings.core.port, 3000);
        assert_eq!(settings.core.log_level, "info");
        assert_eq!(settings.core.max_body_bytes, 6_291_456);
        assert_eq!(settings.tracking.max_retries, 5);
        assert_eq!(settings.tracking.timeout_secs, 10);
        assert_eq!(settings.eks.node_poll_interval_ms, 1_000);
        assert!(settings.serverless.build_bucket.is_none());
        assert_eq!(settings.core.stacktrace_dir(), env::temp_dir());
    }

    #[test]
    fn test_file_then_legacy_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[core]\nport = 8080\nstacktrace_dir = \"/var/tmp\"\n\n[tracking]\nmax_retries = 2\n\n[serverless]\nbuild_bucket = \"from-file\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let settings = Settings::load(Some(&path), |name| match name {
            "SDAPI_MAXRETRIES" => Some("9".to_string()),
            "SD_SLS_BUILD_BUCKET" => Some("sd-sls-builds-usw2".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(settings.core.port, 8080);
        assert_eq!(settings.core.stacktrace_dir(), PathBuf::from("/var/tmp"));
        assert_eq!(settings.tracking.max_retries, 9);
        assert_eq!(
            settings.serverless.build_bucket.as_deref(),
            Some("sd-sls-builds-usw2")
        );
        assert!(settings.serverless.encryption_key_alias.is_none());
    }
}
