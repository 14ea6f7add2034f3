mod aws;
mod codebuild;
mod eks;
mod kube;
mod serverless;

pub use aws::*;
pub use eks::*;
pub use serverless::*;

use std::{fmt::Display, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use thiserror::Error;

use crate::{build_config::BuildConfig, build_config::ConfigError, once_map::OnceMap};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("invalid build config: {0}")]
    Config(#[from] ConfigError),
    #[error("executor is not configured: {0} is not set")]
    NotConfigured(&'static str),
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    pub fn api(operation: &'static str, err: impl Display) -> Self {
        ExecutorError::Api {
            operation,
            message: err.to_string(),
        }
    }
}

/// Provisions or tears down build compute on one target platform.
///
/// `start` returns an opaque location handle for the build (a node hostname,
/// a project ARN, ...) which is reported back to the build-tracking API.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self, config: &BuildConfig) -> Result<String, ExecutorError>;
    async fn stop(&self, config: &BuildConfig) -> Result<(), ExecutorError>;
}

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("an executor named '{0}' is already registered")]
    Duplicate(String),
}

/// Executors available for one region, looked up by exact name.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Vec<Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        ExecutorRegistry {
            executors: Vec::new(),
        }
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) -> Result<(), RegistryError> {
        if self.executors.iter().any(|e| e.name() == executor.name()) {
            return Err(RegistryError::Duplicate(executor.name().to_string()));
        }
        self.executors.push(executor);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.iter().find(|e| e.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.executors.iter().map(|e| e.name()).collect()
    }
}

/// Builds the executors for a region.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn build(&self, region: &str) -> Result<ExecutorRegistry>;
}

/// Region to registry cache. Each region's executors are constructed at
/// most once and then shared by every worker that needs them.
pub struct RegionalExecutors {
    factory: Box<dyn ExecutorFactory>,
    registries: OnceMap<Arc<ExecutorRegistry>>,
}

impl RegionalExecutors {
    pub fn new(factory: impl ExecutorFactory + 'static) -> Self {
        RegionalExecutors {
            factory: Box::new(factory),
            registries: OnceMap::new(),
        }
    }

    pub async fn for_region(&self, region: &str) -> Result<Arc<ExecutorRegistry>> {
        self.registries
            .get_or_try_init(region, || async {
                let registry = self.factory.build(region).await?;
                info!(
                    "Initialized executors {:?} for region {}",
                    registry.names(),
                    region
                );
                Ok(Arc::new(registry))
            })
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Start(BuildConfig),
        Stop(BuildConfig),
    }

    /// Executor double that records calls and answers with a fixed handle.
    /// A `jobName` of `"panic"` makes it panic mid-call.
    pub(crate) struct RecordingExecutor {
        name: String,
        handle: String,
        fail: bool,
        pub(crate) calls: Mutex<Vec<Call>>,
    }

    impl RecordingExecutor {
        pub(crate) fn new(name: &str, handle: &str) -> Arc<Self> {
            Arc::new(RecordingExecutor {
                name: name.to_string(),
                handle: handle.to_string(),
                fail: false,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn failing(name: &str) -> Arc<Self> {
            Arc::new(RecordingExecutor {
                name: name.to_string(),
                handle: String::new(),
                fail: true,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call, config: &BuildConfig) -> Result<(), ExecutorError> {
            self.calls.lock().unwrap().push(call);
            if config.opt_str("jobName")? == Some("panic") {
                panic!("executor blew up");
            }
            if self.fail {
                return Err(ExecutorError::api("CreatePod", "connection refused"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self, config: &BuildConfig) -> Result<String, ExecutorError> {
            self.record(Call::Start(config.clone()), config)?;
            Ok(self.handle.clone())
        }

        async fn stop(&self, config: &BuildConfig) -> Result<(), ExecutorError> {
            self.record(Call::Stop(config.clone()), config)
        }
    }

    /// Hands out the same registry for every region and counts constructions.
    pub(crate) struct StaticFactory {
        registry: ExecutorRegistry,
        pub(crate) builds: Arc<AtomicUsize>,
    }

    impl StaticFactory {
        pub(crate) fn new(executors: Vec<Arc<dyn Executor>>) -> Self {
            let mut registry = ExecutorRegistry::new();
            for executor in executors {
                registry.register(executor).unwrap();
            }
            StaticFactory {
                registry,
                builds: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ExecutorFactory for StaticFactory {
        async fn build(&self, _region: &str) -> Result<ExecutorRegistry> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(self.registry.clone())
        }
    }

    #[test]
    fn test_resolve_by_exact_name() {
        let eks = RecordingExecutor::new("eks", "node123");
        let sls = RecordingExecutor::new("sls", "arn:proj");
        let mut registry = ExecutorRegistry::new();
        registry.register(sls.clone()).unwrap();
        registry.register(eks.clone()).unwrap();

        let resolved = registry.resolve("eks").expect("eks executor");
        assert_eq!(resolved.name(), "eks");
        assert_eq!(
            registry.resolve("sls").map(|e| e.name().to_string()),
            Some("sls".to_string())
        );
        assert!(registry.resolve("unknown").is_none());
        assert!(registry.resolve("EKS").is_none());
        assert_eq!(registry.names(), vec!["sls", "eks"]);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut registry = ExecutorRegistry::new();
        registry.register(RecordingExecutor::new("eks", "a")).unwrap();
        let err = registry
            .register(RecordingExecutor::new("eks", "b"))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("eks".to_string()));
    }

    #[tokio::test]
    async fn test_regional_registries_are_built_once_per_region() {
        let factory = StaticFactory::new(vec![RecordingExecutor::new("eks", "node")]);
        let builds = factory.builds.clone();
        let regional = RegionalExecutors::new(factory);

        let first = regional.for_region("us-west-2").await.unwrap();
        let again = regional.for_region("us-west-2").await.unwrap();
        regional.for_region("us-east-1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }
}
