use async_trait::async_trait;
use aws_sdk_codebuild::{
    error::{BuildError, DisplayErrorContext},
    types as cb,
};
use log::{debug, info};

use super::{
    serverless::{
        ArtifactStore, BatchConfig, BuildRun, BuildService, BuildSummary, ProjectSource,
        ProjectSpec,
    },
    ExecutorError,
};
use crate::env::EnvVars;

/// [`BuildService`] backed by AWS CodeBuild.
pub struct CodeBuildService {
    client: aws_sdk_codebuild::Client,
}

/// [`ArtifactStore`] backed by S3.
pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
}

fn invalid(operation: &'static str) -> impl Fn(BuildError) -> ExecutorError {
    move |e| ExecutorError::api(operation, e)
}

/// Request parts shared by CreateProject and UpdateProject.
struct ProjectParts {
    source: cb::ProjectSource,
    artifacts: cb::ProjectArtifacts,
    environment: cb::ProjectEnvironment,
    vpc: cb::VpcConfig,
    logs: cb::LogsConfig,
    cache: cb::ProjectCache,
    batch: Option<cb::ProjectBuildBatchConfig>,
}

fn batch_config(config: &BatchConfig) -> cb::ProjectBuildBatchConfig {
    cb::ProjectBuildBatchConfig::builder()
        .combine_artifacts(false)
        .restrictions(
            cb::BatchRestrictions::builder()
                .maximum_builds_allowed(config.max_builds)
                .build(),
        )
        .service_role(&config.service_role)
        .timeout_in_mins(config.timeout_minutes)
        .build()
}

fn environment_variables(
    env: &EnvVars,
    operation: &'static str,
) -> Result<Vec<cb::EnvironmentVariable>, ExecutorError> {
    env.iter()
        .map(|(name, value)| {
            cb::EnvironmentVariable::builder()
                .name(name)
                .value(value)
                .build()
                .map_err(invalid(operation))
        })
        .collect()
}

fn cloudwatch_logs(operation: &'static str) -> Result<cb::LogsConfig, ExecutorError> {
    Ok(cb::LogsConfig::builder()
        .cloud_watch_logs(
            cb::CloudWatchLogsConfig::builder()
                .status(cb::LogsConfigStatusType::Enabled)
                .build()
                .map_err(invalid(operation))?,
        )
        .build())
}

impl ProjectParts {
    fn new(spec: &ProjectSpec, operation: &'static str) -> Result<Self, ExecutorError> {
        let source = match &spec.source {
            ProjectSource::S3 {
                location,
                buildspec,
            } => cb::ProjectSource::builder()
                .r#type(cb::SourceType::S3)
                .location(location)
                .buildspec(buildspec),
            ProjectSource::NoSource { buildspec } => cb::ProjectSource::builder()
                .r#type(cb::SourceType::NoSource)
                .buildspec(buildspec),
        }
        .build()
        .map_err(invalid(operation))?;

        let env = &spec.environment;
        let environment = cb::ProjectEnvironment::builder()
            .r#type(cb::EnvironmentType::from(env.environment_type.as_str()))
            .image(&env.image)
            .compute_type(cb::ComputeType::from(env.compute_type.as_str()))
            .image_pull_credentials_type(cb::ImagePullCredentialsType::from(
                env.image_pull_credentials_type.as_str(),
            ))
            .privileged_mode(env.privileged_mode)
            .build()
            .map_err(invalid(operation))?;

        let logs = cb::LogsConfig::builder()
            .cloud_watch_logs(
                cb::CloudWatchLogsConfig::builder()
                    .status(cb::LogsConfigStatusType::Disabled)
                    .build()
                    .map_err(invalid(operation))?,
            )
            .s3_logs(
                cb::S3LogsConfig::builder()
                    .status(cb::LogsConfigStatusType::Disabled)
                    .build()
                    .map_err(invalid(operation))?,
            )
            .build();

        let cache = if spec.docker_layer_cache {
            cb::ProjectCache::builder()
                .r#type(cb::CacheType::Local)
                .location("")
                .modes(cb::CacheMode::LocalDockerLayerCache)
        } else {
            cb::ProjectCache::builder().r#type(cb::CacheType::NoCache)
        }
        .build()
        .map_err(invalid(operation))?;

        Ok(ProjectParts {
            source,
            artifacts: cb::ProjectArtifacts::builder()
                .r#type(cb::ArtifactsType::NoArtifacts)
                .build()
                .map_err(invalid(operation))?,
            environment,
            vpc: cb::VpcConfig::builder()
                .vpc_id(&spec.vpc.vpc_id)
                .set_subnets(Some(spec.vpc.subnets.clone()))
                .set_security_group_ids(Some(spec.vpc.security_group_ids.clone()))
                .build(),
            logs,
            cache,
            batch: spec.batch.as_ref().map(batch_config),
        })
    }
}

impl CodeBuildService {
    pub fn new(client: aws_sdk_codebuild::Client) -> Self {
        CodeBuildService { client }
    }

    async fn latest_single_build(
        &self,
        project: &str,
    ) -> Result<Option<BuildSummary>, ExecutorError> {
        let ids = self
            .client
            .list_builds_for_project()
            .project_name(project)
            .sort_order(cb::SortOrderType::Descending)
            .send()
            .await
            .map_err(|e| ExecutorError::api("ListBuildsForProject", DisplayErrorContext(e)))?;
        debug!("Build ids for project {}: {:?}", project, ids.ids());
        let Some(id) = ids.ids().first() else {
            return Ok(None);
        };

        let builds = self
            .client
            .batch_get_builds()
            .ids(id)
            .send()
            .await
            .map_err(|e| ExecutorError::api("BatchGetBuilds", DisplayErrorContext(e)))?;
        Ok(builds.builds().first().map(|build| BuildSummary {
            id: id.clone(),
            in_progress: build.build_status() == Some(&cb::StatusType::InProgress),
        }))
    }

    async fn latest_build_batch(
        &self,
        project: &str,
    ) -> Result<Option<BuildSummary>, ExecutorError> {
        let ids = self
            .client
            .list_build_batches_for_project()
            .project_name(project)
            .sort_order(cb::SortOrderType::Descending)
            .max_results(5)
            .send()
            .await
            .map_err(|e| {
                ExecutorError::api("ListBuildBatchesForProject", DisplayErrorContext(e))
            })?;
        debug!("Build batch ids for project {}: {:?}", project, ids.ids());
        let Some(id) = ids.ids().first() else {
            return Ok(None);
        };

        let batches = self
            .client
            .batch_get_build_batches()
            .ids(id)
            .send()
            .await
            .map_err(|e| ExecutorError::api("BatchGetBuildBatches", DisplayErrorContext(e)))?;
        Ok(batches.build_batches().first().map(|batch| BuildSummary {
            id: id.clone(),
            in_progress: batch.build_batch_status() == Some(&cb::StatusType::InProgress),
        }))
    }
}

#[async_trait]
impl BuildService for CodeBuildService {
    async fn project_exists(&self, name: &str) -> Result<bool, ExecutorError> {
        let output = self
            .client
            .batch_get_projects()
            .names(name)
            .send()
            .await
            .map_err(|e| ExecutorError::api("BatchGetProjects", DisplayErrorContext(e)))?;
        Ok(!output.projects().is_empty())
    }

    async fn create_project(&self, spec: &ProjectSpec) -> Result<String, ExecutorError> {
        const OPERATION: &str = "CreateProject";
        let parts = ProjectParts::new(spec, OPERATION)?;
        let output = self
            .client
            .create_project()
            .name(&spec.name)
            .source(parts.source)
            .artifacts(parts.artifacts)
            .environment(parts.environment)
            .service_role(&spec.service_role)
            .timeout_in_minutes(spec.timeout_minutes)
            .queued_timeout_in_minutes(spec.queued_timeout_minutes)
            .concurrent_build_limit(spec.concurrent_build_limit)
            .vpc_config(parts.vpc)
            .logs_config(parts.logs)
            .cache(parts.cache)
            .set_encryption_key(spec.encryption_key.clone())
            .set_build_batch_config(parts.batch)
            .send()
            .await
            .map_err(|e| ExecutorError::api(OPERATION, DisplayErrorContext(e)))?;

        output
            .project()
            .and_then(|p| p.arn())
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::api(OPERATION, "response carried no project ARN"))
    }

    async fn update_project(&self, spec: &ProjectSpec) -> Result<String, ExecutorError> {
        const OPERATION: &str = "UpdateProject";
        let parts = ProjectParts::new(spec, OPERATION)?;
        let output = self
            .client
            .update_project()
            .name(&spec.name)
            .source(parts.source)
            .artifacts(parts.artifacts)
            .environment(parts.environment)
            .service_role(&spec.service_role)
            .timeout_in_minutes(spec.timeout_minutes)
            .queued_timeout_in_minutes(spec.queued_timeout_minutes)
            .concurrent_build_limit(spec.concurrent_build_limit)
            .vpc_config(parts.vpc)
            .logs_config(parts.logs)
            .cache(parts.cache)
            .set_encryption_key(spec.encryption_key.clone())
            .set_build_batch_config(parts.batch)
            .send()
            .await
            .map_err(|e| ExecutorError::api(OPERATION, DisplayErrorContext(e)))?;

        output
            .project()
            .and_then(|p| p.arn())
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::api(OPERATION, "response carried no project ARN"))
    }

    async fn delete_project(&self, name: &str) -> Result<(), ExecutorError> {
        self.client
            .delete_project()
            .name(name)
            .send()
            .await
            .map_err(|e| ExecutorError::api("DeleteProject", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn start_build(&self, run: &BuildRun) -> Result<(), ExecutorError> {
        match &run.batch {
            None => {
                const OPERATION: &str = "StartBuild";
                info!("Starting single build for project {}", run.project);
                let logs = if run.cloudwatch_logs {
                    Some(cloudwatch_logs(OPERATION)?)
                } else {
                    None
                };
                self.client
                    .start_build()
                    .project_name(&run.project)
                    .set_environment_variables_override(Some(environment_variables(
                        &run.env, OPERATION,
                    )?))
                    .service_role_override(&run.service_role)
                    .set_logs_config_override(logs)
                    .set_debug_session_enabled(run.debug_session.then_some(true))
                    .send()
                    .await
                    .map_err(|e| ExecutorError::api(OPERATION, DisplayErrorContext(e)))?;
            }
            Some(batch) => {
                const OPERATION: &str = "StartBuildBatch";
                info!("Starting batch build for project {}", run.project);
                let logs = if run.cloudwatch_logs {
                    Some(cloudwatch_logs(OPERATION)?)
                } else {
                    None
                };
                let artifacts = cb::ProjectArtifacts::builder()
                    .r#type(cb::ArtifactsType::S3)
                    .location(&batch.artifacts_bucket)
                    .name(&batch.artifact_name)
                    .packaging(cb::ArtifactPackaging::Zip)
                    .encryption_disabled(false)
                    .override_artifact_name(false)
                    .build()
                    .map_err(invalid(OPERATION))?;
                self.client
                    .start_build_batch()
                    .project_name(&run.project)
                    .set_environment_variables_override(Some(environment_variables(
                        &run.env, OPERATION,
                    )?))
                    .service_role_override(&run.service_role)
                    .artifacts_override(artifacts)
                    .build_batch_config_override(batch_config(&batch.config))
                    .buildspec_override(&batch.buildspec)
                    .source_type_override(cb::SourceType::NoSource)
                    .set_logs_config_override(logs)
                    .set_debug_session_enabled(run.debug_session.then_some(true))
                    .send()
                    .await
                    .map_err(|e| ExecutorError::api(OPERATION, DisplayErrorContext(e)))?;
            }
        }
        Ok(())
    }

    async fn latest_build(
        &self,
        project: &str,
        batch: bool,
    ) -> Result<Option<BuildSummary>, ExecutorError> {
        if batch {
            self.latest_build_batch(project).await
        } else {
            self.latest_single_build(project).await
        }
    }

    async fn stop_build(&self, id: &str, batch: bool) -> Result<(), ExecutorError> {
        if batch {
            self.client
                .stop_build_batch()
                .id(id)
                .send()
                .await
                .map_err(|e| ExecutorError::api("StopBuildBatch", DisplayErrorContext(e)))?;
        } else {
            self.client
                .stop_build()
                .id(id)
                .send()
                .await
                .map_err(|e| ExecutorError::api("StopBuild", DisplayErrorContext(e)))?;
        }
        Ok(())
    }
}

impl S3ArtifactStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        S3ArtifactStore { client }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn list_keys(&self, bucket: &str) -> Result<Vec<String>, ExecutorError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                ExecutorError::api("ListObjectsV2", aws_sdk_s3::error::DisplayErrorContext(e))
            })?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(str::to_string),
            );
        }
        Ok(keys)
    }
}
