use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{error, info};
use rand::Rng;
use serde_json::{json, Value};

use super::{Executor, ExecutorError};
use crate::{
    build_config::{BuildConfig, ConfigError},
    settings,
};

const EXECUTOR_NAME: &str = "eks";
const POD_SUFFIX_LEN: usize = 5;
// Same alphabet Kubernetes uses for generated name suffixes.
const POD_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const LAUNCHER_INIT_SCRIPT: &str = "echo launcher_start_ts:`date +%s` > /workspace/metrics && if ! [ -f /opt/launcher/launch ]; then TEMP_DIR=`mktemp -d -p /opt/launcher` && cp -a /opt/sd/* $TEMP_DIR && mkdir -p $TEMP_DIR/hab && cp -a /hab/* $TEMP_DIR/hab && mv $TEMP_DIR/* /opt/launcher && rm -rf $TEMP_DIR || true; else ls /opt/launcher; fi; echo launcher_end_ts:`date +%s` >> /workspace/metrics";

/// Pod operations the executor needs from a cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a pod and return its name.
    async fn create_pod(&self, namespace: &str, pod: &Value) -> Result<String, ExecutorError>;
    /// Node the pod was scheduled on, if any yet.
    async fn pod_node(&self, namespace: &str, name: &str) -> Result<Option<String>, ExecutorError>;
    async fn list_pods(&self, namespace: &str, label_selector: &str)
        -> Result<Vec<String>, ExecutorError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ExecutorError>;
}

#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, cluster_name: &str) -> Result<Arc<dyn ClusterApi>, ExecutorError>;
}

/// Runs each build as a pod on a Kubernetes cluster.
pub struct EksExecutor {
    connector: Box<dyn ClusterConnector>,
    settings: settings::Eks,
}

impl EksExecutor {
    pub fn new(connector: impl ClusterConnector + 'static, settings: settings::Eks) -> Self {
        EksExecutor {
            connector: Box::new(connector),
            settings,
        }
    }

    async fn wait_for_node(
        &self,
        api: &dyn ClusterApi,
        namespace: &str,
        pod_name: &str,
    ) -> Result<String, ExecutorError> {
        let timeout = self.settings.node_wait_timeout_ms;
        let interval = self.settings.node_poll_interval_ms.max(1);
        let mut ms_elapsed = 0;
        loop {
            if let Some(node) = api.pod_node(namespace, pod_name).await? {
                return Ok(node);
            }
            if ms_elapsed >= timeout {
                info!("Pod {} has no node assigned after {}ms", pod_name, ms_elapsed);
                return Ok(String::new());
            }
            info!("Waiting for pod {} to be scheduled...", pod_name);
            tokio::time::sleep(Duration::from_millis(interval)).await;
            ms_elapsed += interval;
        }
    }
}

/// `<prefix>-<buildId>`, the label value shared by every pod of a build.
pub fn build_label(config: &BuildConfig) -> Result<String, ConfigError> {
    Ok(format!(
        "{}-{}",
        config.str("prefix")?,
        config.int("buildId")?
    ))
}

fn pod_suffix() -> String {
    let mut rng = rand::rng();
    (0..POD_SUFFIX_LEN)
        .map(|_| POD_SUFFIX_ALPHABET[rng.random_range(0..POD_SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Pod definition for a build: a launcher init container that stages the
/// launcher binaries, then the build container running `run.sh`.
pub fn pod_manifest(
    config: &BuildConfig,
    namespace: &str,
    suffix: &str,
) -> Result<Value, ConfigError> {
    let build_id = config.int("buildId")?.to_string();
    let label = build_label(config)?;
    let pod_name = format!("{}-{}", label, suffix);
    let container = config.str("container")?;
    let provider = config.provider()?;

    let run_command = format!(
        "/opt/sd/run.sh {} {} {} {} {} {}",
        config.str("token")?,
        config.str("apiUri")?,
        config.str("storeUri")?,
        config.int("buildTimeout")?,
        build_id,
        config.str("uiUri")?,
    );

    Ok(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "namespace": namespace,
            "labels": { "app": "screwdriver", "tier": "builds", "sdbuild": label }
        },
        "spec": {
            "serviceAccountName": config.str("serviceAccountName")?,
            "automountServiceAccountToken": true,
            "terminationGracePeriodSeconds": 30,
            "restartPolicy": "Never",
            "dnsPolicy": "ClusterFirst",
            "containers": [{
                "name": label,
                "image": container,
                "imagePullPolicy": "Always",
                "ports": [{ "name": "http", "protocol": "TCP", "containerPort": 80 }],
                "securityContext": { "privileged": provider.bool_or("privilegedMode", false)? },
                "resources": {
                    "limits": {
                        "cpu": config.str("cpuLimit")?,
                        "memory": config.str("memoryLimit")?
                    }
                },
                "env": [
                    { "name": "SD_RUNTIME_CLASS", "value": "" },
                    { "name": "SD_PUSHGATEWAY_URL", "value": "" },
                    { "name": "SD_TERMINATION_GRACE_PERIOD_SECONDS", "value": "60" },
                    { "name": "CONTAINER_IMAGE", "value": container },
                    { "name": "SD_PIPELINE_ID", "value": config.int("pipelineId")?.to_string() },
                    { "name": "SD_BUILD_PREFIX", "value": config.str("prefix")? },
                    { "name": "NODE_ID", "valueFrom": { "fieldRef": { "fieldPath": "spec.nodeName" } } },
                    { "name": "SD_BASE_COMMAND_PATH", "value": "/sd/commands/" },
                    { "name": "SD_TEMP", "value": "/opt/sd_tmp" },
                    { "name": "DOCKER_HOST", "value": "tcp" }
                ],
                "command": ["/opt/sd/launcher_entrypoint.sh"],
                "args": [run_command],
                "volumeMounts": [
                    { "name": "podinfo", "mountPath": "/etc/podinfo", "readOnly": true },
                    { "name": "screwdriver", "mountPath": "/opt/sd", "readOnly": true },
                    { "name": "sdtemp", "mountPath": "/opt/sd_tmp" },
                    { "name": "workspace", "mountPath": "/workspace" }
                ]
            }],
            "initContainers": [{
                "name": format!("launcher-{}", label),
                "image": config.str("launcherImage")?,
                "command": ["/bin/sh", "-c", LAUNCHER_INIT_SCRIPT],
                "volumeMounts": [
                    { "name": "screwdriver", "mountPath": "/opt/launcher" },
                    { "name": "workspace", "mountPath": "/workspace" }
                ]
            }],
            "volumes": [
                {
                    "name": "screwdriver",
                    "hostPath": { "path": format!("/opt/screwdriver/sdlauncher/{}", config.str("launcherVersion")?) }
                },
                { "name": "sdtemp", "hostPath": { "path": format!("/opt/screwdriver/tmp_{}", build_id) } },
                { "name": "workspace", "emptyDir": {} },
                {
                    "name": "podinfo",
                    "downwardAPI": {
                        "items": [
                            { "path": "labels", "fieldRef": { "fieldPath": "metadata.labels" } },
                            { "path": "annotations", "fieldRef": { "fieldPath": "metadata.annotations" } }
                        ]
                    }
                }
            ]
        }
    }))
}

#[async_trait]
impl Executor for EksExecutor {
    fn name(&self) -> &str {
        EXECUTOR_NAME
    }

    async fn start(&self, config: &BuildConfig) -> Result<String, ExecutorError> {
        let cluster_name = config.str("clusterName")?;
        let namespace = config.str("namespace")?;
        let pod = pod_manifest(config, namespace, &pod_suffix())?;

        let api = self.connector.connect(cluster_name).await?;
        info!("Creating pod in namespace {} of cluster {}", namespace, cluster_name);
        let pod_name = api.create_pod(namespace, &pod).await?;
        info!("Created pod {}", pod_name);

        let node = self.wait_for_node(api.as_ref(), namespace, &pod_name).await?;
        info!("Pod {} scheduled on node: {}", pod_name, node);
        Ok(node)
    }

    async fn stop(&self, config: &BuildConfig) -> Result<(), ExecutorError> {
        let cluster_name = config.str("clusterName")?;
        let namespace = config.str("namespace")?;
        let selector = format!("sdbuild={}", build_label(config)?);

        let api = self.connector.connect(cluster_name).await?;
        let pods = api.list_pods(namespace, &selector).await?;
        for pod in pods {
            info!("Deleting pod {}", pod);
            match api.delete_pod(namespace, &pod).await {
                Ok(()) => info!("Deleted pod {}", pod),
                Err(e) => error!("Failed to delete pod {}: {}", pod, e),
            }
        }
        Ok(())
    }
}
