use async_trait::async_trait;
use log::{info, warn};

use super::{Executor, ExecutorError};
use crate::{
    build_config::{BuildConfig, ConfigError},
    env::EnvVars,
    settings,
};

const EXECUTOR_NAME: &str = "sls";
const SD_INIT_PREFIX: &str = "sdinit-";
const CODEBUILD_IMAGE_PREFIX: &str = "aws/codebuild/";
const ARM_CONTAINER: &str = "ARM_CONTAINER";
const MAX_BATCH_BUILDS: i32 = 2;
const CONCURRENT_BUILD_LIMIT: i32 = 2;

const MAIN_BUILDSPEC: &str = "version: 0.2\\nphases:\\n  install:\\n    commands:\\n      - mkdir /opt/sd && cp -r $CODEBUILD_SRC_DIR_sdinit_sdinit/opt/sd/* /opt/sd/\\n  build:\\n    commands:\\n      - /opt/sd/launcher_entrypoint.sh /opt/sd/run.sh $TOKEN $API $STORE $TIMEOUT $SDBUILDID $UI";
const SINGLE_BUILDSPEC: &str = "version: 0.2\nphases:\n  install:\n    commands:\n       - mkdir /opt/sd && cp -r $CODEBUILD_SRC_DIR/opt/sd/* /opt/sd/\n  build:\n    commands:\n       - /opt/sd/launcher_entrypoint.sh /opt/sd/run.sh $TOKEN $API $STORE $TIMEOUT $SDBUILDID $UI\n";

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectSource {
    /// Launcher already staged in the bucket; plain single builds.
    S3 { location: String, buildspec: String },
    /// Launcher must be rebuilt first; builds run as a batch.
    NoSource { buildspec: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub service_role: String,
    pub timeout_minutes: i32,
    pub max_builds: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectEnvironment {
    pub environment_type: String,
    pub image: String,
    pub compute_type: String,
    pub image_pull_credentials_type: String,
    pub privileged_mode: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VpcConfig {
    pub vpc_id: String,
    pub subnets: Vec<String>,
    pub security_group_ids: Vec<String>,
}

/// Everything needed to create or update a build project.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSpec {
    pub name: String,
    pub source: ProjectSource,
    pub service_role: String,
    pub timeout_minutes: i32,
    pub queued_timeout_minutes: i32,
    pub concurrent_build_limit: i32,
    pub environment: ProjectEnvironment,
    pub vpc: VpcConfig,
    pub encryption_key: Option<String>,
    pub batch: Option<BatchConfig>,
    pub docker_layer_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun {
    pub buildspec: String,
    pub artifacts_bucket: String,
    pub artifact_name: String,
    pub config: BatchConfig,
}

/// One build (or build batch) of an existing project.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRun {
    pub project: String,
    pub env: EnvVars,
    pub service_role: String,
    pub cloudwatch_logs: bool,
    pub debug_session: bool,
    pub batch: Option<BatchRun>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildSummary {
    pub id: String,
    pub in_progress: bool,
}

/// Managed build service operations.
#[async_trait]
pub trait BuildService: Send + Sync {
    async fn project_exists(&self, name: &str) -> Result<bool, ExecutorError>;
    /// Returns the project ARN.
    async fn create_project(&self, spec: &ProjectSpec) -> Result<String, ExecutorError>;
    /// Returns the project ARN.
    async fn update_project(&self, spec: &ProjectSpec) -> Result<String, ExecutorError>;
    async fn delete_project(&self, name: &str) -> Result<(), ExecutorError>;
    async fn start_build(&self, run: &BuildRun) -> Result<(), ExecutorError>;
    /// Most recent build, or build batch when `batch` is set.
    async fn latest_build(
        &self,
        project: &str,
        batch: bool,
    ) -> Result<Option<BuildSummary>, ExecutorError>;
    async fn stop_build(&self, id: &str, batch: bool) -> Result<(), ExecutorError>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn list_keys(&self, bucket: &str) -> Result<Vec<String>, ExecutorError>;
}

/// Runs each build as a managed build-service project.
pub struct ServerlessExecutor {
    builds: Box<dyn BuildService>,
    artifacts: Box<dyn ArtifactStore>,
    settings: settings::Serverless,
}

fn region_abbreviation(word: &str) -> Option<&'static str> {
    Some(match word {
        "north" => "n",
        "west" => "w",
        "northeast" => "ne",
        "east" => "e",
        "south" => "s",
        "central" => "c",
        "southeast" => "se",
        _ => return None,
    })
}

/// `us-west-2` becomes `usw2`.
pub fn region_short_name(region: &str) -> Option<String> {
    let parts: Vec<&str> = region.split('-').collect();
    let [area, direction, number] = parts.as_slice() else {
        return None;
    };
    Some(format!("{}{}{}", area, region_abbreviation(direction)?, number))
}

/// Artifact bucket for a build. Cross-region builds use the sibling bucket
/// whose name carries the build region's short name instead.
pub fn bucket_name(bucket: &str, region: &str, build_region: &str) -> String {
    if build_region.is_empty() || region == build_region {
        return bucket.to_string();
    }
    match (region_short_name(region), region_short_name(build_region)) {
        (Some(home), Some(target)) => {
            let name = bucket.replacen(&home, &target, 1);
            info!("Regional bucket name: {}", name);
            name
        }
        _ => {
            warn!(
                "Unable to derive short names for regions {} and {}, using bucket {}",
                region, build_region, bucket
            );
            bucket.to_string()
        }
    }
}

/// `<jobName>-<jobId>`; PR job names (`PR-1:main`) lose their first colon.
pub fn project_name(config: &BuildConfig) -> Result<String, ConfigError> {
    let job_name = config.str("jobName")?;
    let job_name = if config.bool_or("isPR", false)? {
        job_name.replacen(':', "-", 1)
    } else {
        job_name.to_string()
    };
    Ok(format!("{}-{}", job_name, config.int("jobId")?))
}

fn to_minutes(key: &str, value: i64) -> Result<i32, ConfigError> {
    i32::try_from(value).map_err(|_| ConfigError::WrongType {
        key: key.to_string(),
        expected: "a timeout in minutes",
        actual: "an out of range integer",
    })
}

fn batch_buildspec(config: &BuildConfig) -> Result<String, ConfigError> {
    let provider = config.provider()?;
    let environment_type = if provider.str("environmentType")? == ARM_CONTAINER {
        ARM_CONTAINER
    } else {
        provider
            .opt_str("launcherEnvironmentType")?
            .filter(|t| !t.is_empty())
            .unwrap_or("LINUX_CONTAINER")
    };
    Ok(format!(
        "version: 0.2\nbatch:\n  fast-fail: false\n  build-graph:\n    - identifier: sdinit\n      env:\n        type: {}\n        image: {}\n        compute-type: {}\n        privileged-mode: false\n      ignore-failure: false\n    - identifier: main\n      buildspec: \"{}\"\n      depend-on:\n        - sdinit\nartifacts:\n  base-directory: /opt\n  files:  \n    - '/opt/**/*'",
        environment_type,
        provider.str("launcherImage")?,
        provider.str("launcherComputeType")?,
        MAIN_BUILDSPEC,
    ))
}

fn batch_config(config: &BuildConfig) -> Result<BatchConfig, ConfigError> {
    Ok(BatchConfig {
        service_role: config.provider()?.str("role")?.to_string(),
        timeout_minutes: to_minutes("buildTimeout", config.int("buildTimeout")?)?,
        max_builds: MAX_BATCH_BUILDS,
    })
}

/// Project definition for a build. With `launcher_update` the project has
/// no source and runs the launcher build ahead of the real one.
pub fn project_spec(
    config: &BuildConfig,
    project: &str,
    bucket: &str,
    launcher_update: bool,
    encryption_key: Option<&str>,
) -> Result<ProjectSpec, ConfigError> {
    let provider = config.provider()?;
    let vpc = provider.section("vpc")?;
    let container = config.str("container")?;
    let dlc = provider.bool("dlc")?;

    let image_pull_credentials_type = if container.starts_with(CODEBUILD_IMAGE_PREFIX) {
        "CODEBUILD"
    } else {
        provider.str("imagePullCredentialsType")?
    };

    let source = if launcher_update {
        ProjectSource::NoSource {
            buildspec: batch_buildspec(config)?,
        }
    } else {
        ProjectSource::S3 {
            location: format!(
                "{}/{}{}",
                bucket,
                SD_INIT_PREFIX,
                provider.str("launcherVersion")?
            ),
            buildspec: SINGLE_BUILDSPEC.to_string(),
        }
    };

    Ok(ProjectSpec {
        name: project.to_string(),
        source,
        service_role: provider.str("role")?.to_string(),
        timeout_minutes: to_minutes("buildTimeout", config.int("buildTimeout")?)?,
        queued_timeout_minutes: to_minutes(
            "provider.queuedTimeout",
            provider.int("queuedTimeout")?,
        )?,
        concurrent_build_limit: CONCURRENT_BUILD_LIMIT,
        environment: ProjectEnvironment {
            environment_type: provider.str("environmentType")?.to_string(),
            image: container.to_string(),
            compute_type: provider.str("computeType")?.to_string(),
            image_pull_credentials_type: image_pull_credentials_type.to_string(),
            privileged_mode: dlc || provider.bool("privilegedMode")?,
        },
        vpc: VpcConfig {
            vpc_id: vpc.str("vpcId")?.to_string(),
            subnets: vpc.str_list("subnetIds")?.into_iter().map(String::from).collect(),
            security_group_ids: vpc
                .str_list("securityGroupIds")?
                .into_iter()
                .map(String::from)
                .collect(),
        },
        encryption_key: encryption_key.filter(|k| !k.is_empty()).map(String::from),
        batch: if launcher_update {
            Some(batch_config(config)?)
        } else {
            None
        },
        docker_layer_cache: dlc,
    })
}

/// Build run for a project; a batch when the launcher has to be rebuilt.
pub fn build_run(
    config: &BuildConfig,
    project: &str,
    bucket: &str,
    launcher_update: bool,
) -> Result<BuildRun, ConfigError> {
    let provider = config.provider()?;
    let mut env = EnvVars::for_launcher(config)?;
    env.push("SD_HAB_ENABLED", "false");
    env.push("SD_AWS_INTEGRATION", "true");

    let batch = if launcher_update {
        Some(BatchRun {
            buildspec: batch_buildspec(config)?,
            artifacts_bucket: bucket.to_string(),
            artifact_name: provider.str("launcherVersion")?.to_string(),
            config: batch_config(config)?,
        })
    } else {
        None
    };

    Ok(BuildRun {
        project: project.to_string(),
        env,
        service_role: provider.str("role")?.to_string(),
        cloudwatch_logs: provider.bool("executorLogs")?,
        debug_session: provider.bool("debugSession")?,
        batch,
    })
}

impl ServerlessExecutor {
    pub fn new(
        builds: impl BuildService + 'static,
        artifacts: impl ArtifactStore + 'static,
        settings: settings::Serverless,
    ) -> Self {
        ServerlessExecutor {
            builds: Box::new(builds),
            artifacts: Box::new(artifacts),
            settings,
        }
    }

    fn bucket(&self, config: &BuildConfig) -> Result<String, ExecutorError> {
        let base = self
            .settings
            .build_bucket
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or(ExecutorError::NotConfigured("serverless.build_bucket"))?;
        let provider = config.provider()?;
        Ok(bucket_name(
            base,
            provider.str("region")?,
            provider.opt_str("buildRegion")?.unwrap_or_default(),
        ))
    }

    /// The launcher needs rebuilding unless its artifact is already in the
    /// bucket. A listing failure counts as "needs rebuilding".
    async fn launcher_update_required(&self, launcher_version: &str, bucket: &str) -> bool {
        let source_identifier = format!("{}{}", SD_INIT_PREFIX, launcher_version);
        match self.artifacts.list_keys(bucket).await {
            Ok(keys) => !keys.iter().any(|k| *k == source_identifier),
            Err(e) => {
                warn!("Failed to get launcher version: {}", e);
                true
            }
        }
    }
}

#[async_trait]
impl Executor for ServerlessExecutor {
    fn name(&self) -> &str {
        EXECUTOR_NAME
    }

    async fn start(&self, config: &BuildConfig) -> Result<String, ExecutorError> {
        let launcher_version = config.provider()?.str("launcherVersion")?;
        let bucket = self.bucket(config)?;
        let project = project_name(config)?;
        info!("Project name: {}", project);

        // Both project shapes must be buildable before any remote call.
        project_spec(config, &project, &bucket, true, None)?;
        build_run(config, &project, &bucket, false)?;

        let launcher_update = self.launcher_update_required(launcher_version, &bucket).await;
        info!("Launcher update required: {}", launcher_update);

        let spec = project_spec(
            config,
            &project,
            &bucket,
            launcher_update,
            self.settings.encryption_key_alias.as_deref(),
        )?;
        let exists = match self.builds.project_exists(&project).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Unable to look up project {}, creating it: {}", project, e);
                false
            }
        };

        let project_arn = if exists {
            info!("Project already exists, updating project");
            self.builds.update_project(&spec).await?
        } else {
            info!("Project does not exist, creating project");
            self.builds.create_project(&spec).await?
        };
        info!("Project Arn: {}", project_arn);

        let run = build_run(config, &project, &bucket, launcher_update)?;
        self.builds.start_build(&run).await?;
        info!("Started build for project {}", project);

        Ok(project_arn)
    }

    async fn stop(&self, config: &BuildConfig) -> Result<(), ExecutorError> {
        let provider = config.provider()?;
        let project = project_name(config)?;

        if provider.bool("prune")? {
            self.builds.delete_project(&project).await?;
            info!("Deleted project {}", project);
            return Ok(());
        }

        let bucket = self.bucket(config)?;
        let batch = self
            .launcher_update_required(provider.str("launcherVersion")?, &bucket)
            .await;
        match self.builds.latest_build(&project, batch).await? {
            Some(build) if build.in_progress => {
                self.builds.stop_build(&build.id, batch).await?;
                info!("Stopped build {} for project {}", build.id, project);
            }
            Some(build) => info!("Latest build {} of project {} is not running", build.id, project),
            None => info!("Project {} has no builds to stop", project),
        }
        Ok(())
    }
}
