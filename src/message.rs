use base64::{engine::general_purpose, Engine as _};
use log::warn;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::build_config::{BuildConfig, ConfigError};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid build message json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid build config: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Start,
    Stop,
}

impl Job {
    /// `None` for job values this service does not act on.
    pub fn parse(s: &str) -> Option<Job> {
        match s {
            "start" => Some(Job::Start),
            "stop" => Some(Job::Stop),
            _ => None,
        }
    }
}

/// Wire shape of a build message. Fields the producer left out decode as
/// empty so the processor can decide to skip the message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBuildMessage {
    #[serde(default)]
    job: String,
    #[serde(default)]
    executor_type: String,
    #[serde(default)]
    build_config: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildMessage {
    pub job: String,
    pub executor_type: String,
    pub build_config: BuildConfig,
}

impl BuildMessage {
    /// Decode a base64 encoded JSON build message and apply config defaults.
    ///
    /// A payload that is not valid base64 is logged and decoded as empty,
    /// which then fails as invalid JSON.
    pub fn decode(value: &str) -> Result<Self, DecodeError> {
        let bytes = general_purpose::STANDARD
            .decode(value.trim())
            .unwrap_or_else(|e| {
                warn!("Base64 decode error: {}", e);
                Vec::new()
            });

        let raw: RawBuildMessage = serde_json::from_slice(&bytes)?;

        let mut build_config = BuildConfig::with_defaults();
        build_config.merge(raw.build_config);
        build_config.apply_provider_defaults()?;

        Ok(BuildMessage {
            job: raw.job,
            executor_type: raw.executor_type,
            build_config,
        })
    }

    pub fn is_actionable(&self) -> bool {
        !self.job.is_empty() && !self.executor_type.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;

    pub(crate) fn encode(message: &Value) -> String {
        general_purpose::STANDARD.encode(message.to_string())
    }

    #[test]
    fn test_decode_build_message() {
        let value = encode(&json!({
            "job": "start",
            "executorType": "eks",
            "buildConfig": {
                "jobId": 41766,
                "jobName": "deployappeks",
                "buildId": 126675,
                "buildTimeout": 60,
                "isPR": false,
                "apiUri": "https://beta.api.screwdriver.cd",
                "blockedBy": [41766],
                "pipeline": { "id": 9668, "scmContext": "github:github.com" },
                "provider": { "region": "us-west-2", "computeType": "BUILD_GENERAL1_MEDIUM" }
            }
        }));

        let message = BuildMessage::decode(&value).unwrap();
        let cfg = &message.build_config;

        assert_eq!(message.job, "start");
        assert_eq!(message.executor_type, "eks");
        assert_eq!(Job::parse(&message.job), Some(Job::Start));
        assert!(message.is_actionable());
        assert_eq!(cfg.int("buildId").unwrap(), 126675);
        assert_eq!(cfg.int("jobId").unwrap(), 41766);
        assert_eq!(cfg.int("buildTimeout").unwrap(), 60);
        assert_eq!(cfg.str("container").unwrap(), "aws/codebuild/standard:5.0");
        assert_eq!(cfg.str("serviceAccountName").unwrap(), "default");
        assert_eq!(cfg.inner()["pipeline"], json!({ "id": 9668, "scmContext": "github:github.com" }));

        let provider = cfg.provider().unwrap();
        assert_eq!(provider.str("computeType").unwrap(), "BUILD_GENERAL1_MEDIUM");
        assert_eq!(provider.str("launcherComputeType").unwrap(), "BUILD_GENERAL1_SMALL");
        assert_eq!(cfg.build_region().unwrap(), "us-west-2");
    }

    #[test]
    fn test_decode_preserves_integer_precision() {
        let value = encode(&json!({
            "job": "stop",
            "executorType": "sls",
            "buildConfig": { "buildId": 353239, "eventId": 9007199254740993_i64 }
        }));

        let message = BuildMessage::decode(&value).unwrap();
        assert_eq!(message.build_config.int("buildId").unwrap(), 353239);
        assert_eq!(message.build_config.int("eventId").unwrap(), 9007199254740993);
        assert!(message.build_config.inner()["buildId"].is_i64());
    }

    #[test]
    fn test_decode_missing_fields_is_not_actionable() {
        let message = BuildMessage::decode(&encode(&json!({ "job": "start" }))).unwrap();
        assert!(!message.is_actionable());
        assert_eq!(message.executor_type, "");
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(matches!(
            BuildMessage::decode("not base64 at all!"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            BuildMessage::decode(&general_purpose::STANDARD.encode("{\"job\": ")),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            BuildMessage::decode(&encode(&json!({
                "job": "start",
                "executorType": "eks",
                "buildConfig": { "provider": [] }
            }))),
            Err(DecodeError::Config(_))
        ));
    }

    #[test]
    fn test_parse_job() {
        assert_eq!(Job::parse("stop"), Some(Job::Stop));
        assert_eq!(Job::parse("Start"), None);
        assert_eq!(Job::parse("restart"), None);
    }
}
