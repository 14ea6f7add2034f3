use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use log::debug;

use super::{
    codebuild::{CodeBuildService, S3ArtifactStore},
    kube::EksConnector,
    EksExecutor, ExecutorFactory, ExecutorRegistry, ServerlessExecutor,
};
use crate::settings;

/// Builds the `eks` and `sls` executors against AWS for a region.
pub struct AwsExecutorFactory {
    eks: settings::Eks,
    serverless: settings::Serverless,
}

impl AwsExecutorFactory {
    pub fn new(eks: settings::Eks, serverless: settings::Serverless) -> Self {
        AwsExecutorFactory { eks, serverless }
    }
}

#[async_trait]
impl ExecutorFactory for AwsExecutorFactory {
    async fn build(&self, region: &str) -> Result<ExecutorRegistry> {
        debug!("Loading AWS configuration for region {}", region);
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(EksExecutor::new(
            EksConnector::new(&sdk_config, region),
            self.eks.clone(),
        )))?;
        registry.register(Arc::new(ServerlessExecutor::new(
            CodeBuildService::new(aws_sdk_codebuild::Client::new(&sdk_config)),
            S3ArtifactStore::new(aws_sdk_s3::Client::new(&sdk_config)),
            self.serverless.clone(),
        )))?;
        Ok(registry)
    }
}
