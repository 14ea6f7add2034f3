use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_credential_types::provider::ProvideCredentials;
use aws_sigv4::{
    http_request::{
        sign, SignableBody, SignableRequest, SignatureLocation, SigningParams, SigningSettings,
    },
    sign::v4,
};
use aws_smithy_runtime_api::client::identity::Identity;
use base64::{engine::general_purpose, Engine as _};
use log::info;
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use urlencoding::encode;

use super::{ClusterApi, ClusterConnector, ExecutorError};
use crate::once_map::OnceMap;

const TOKEN_PREFIX: &str = "k8s-aws-v1.";
const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";
const TOKEN_EXPIRY: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    node_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
}

#[derive(Debug, Deserialize)]
struct PodList {
    items: Vec<Pod>,
}

/// Minimal Kubernetes REST client for the pod calls the executor makes.
pub struct KubeClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl KubeClient {
    pub fn new(http: Client, endpoint: &str, token: String) -> Self {
        KubeClient {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.endpoint, encode(namespace))
    }

    fn pod_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.pods_url(namespace), encode(name))
    }

    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, ExecutorError> {
        request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ExecutorError::api(operation, e))
    }

    async fn check(operation: &'static str, response: Response) -> Result<Response, ExecutorError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutorError::api(
                operation,
                format!("received response {}: {}", status, body),
            ));
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T, ExecutorError> {
        let response = Self::check(operation, self.send(operation, request).await?).await?;
        response
            .json()
            .await
            .map_err(|e| ExecutorError::api(operation, e))
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn create_pod(&self, namespace: &str, pod: &Value) -> Result<String, ExecutorError> {
        let request = self.http.post(self.pods_url(namespace)).json(pod);
        let created: Pod = self.fetch("CreatePod", request).await?;
        Ok(created.metadata.name)
    }

    async fn pod_node(&self, namespace: &str, name: &str) -> Result<Option<String>, ExecutorError> {
        let request = self.http.get(self.pod_url(namespace, name));
        let pod: Pod = self.fetch("GetPod", request).await?;
        Ok(pod.spec.node_name.filter(|n| !n.is_empty()))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<String>, ExecutorError> {
        let request = self
            .http
            .get(self.pods_url(namespace))
            .query(&[("labelSelector", label_selector)]);
        let pods: PodList = self.fetch("ListPods", request).await?;
        Ok(pods.items.into_iter().map(|p| p.metadata.name).collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ExecutorError> {
        let request = self.http.delete(self.pod_url(namespace, name));
        let response = self.send("DeletePod", request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            info!("Pod {} is already gone", name);
            return Ok(());
        }
        Self::check("DeletePod", response).await?;
        Ok(())
    }
}

/// Where to reach a cluster's API server and how to trust it.
#[derive(Clone)]
struct ClusterEndpoint {
    endpoint: String,
    http: Client,
}

/// Connects to EKS clusters: endpoint and CA come from `DescribeCluster`
/// (cached per cluster), the bearer token is minted per connection.
pub struct EksConnector {
    eks: aws_sdk_eks::Client,
    sdk_config: SdkConfig,
    region: String,
    clusters: OnceMap<Arc<ClusterEndpoint>>,
}

impl EksConnector {
    pub fn new(sdk_config: &SdkConfig, region: &str) -> Self {
        EksConnector {
            eks: aws_sdk_eks::Client::new(sdk_config),
            sdk_config: sdk_config.clone(),
            region: region.to_string(),
            clusters: OnceMap::new(),
        }
    }

    async fn describe(&self, cluster_name: &str) -> Result<Arc<ClusterEndpoint>, ExecutorError> {
        let output = self
            .eks
            .describe_cluster()
            .name(cluster_name)
            .send()
            .await
            .map_err(|e| {
                ExecutorError::api("DescribeCluster", aws_sdk_eks::error::DisplayErrorContext(e))
            })?;
        let cluster = output
            .cluster()
            .ok_or_else(|| ExecutorError::api("DescribeCluster", "cluster does not exist"))?;
        info!("Cluster Arn: {}", cluster.arn().unwrap_or_default());

        let endpoint = cluster
            .endpoint()
            .ok_or_else(|| ExecutorError::api("DescribeCluster", "cluster has no endpoint"))?;
        let ca_data = cluster
            .certificate_authority()
            .and_then(|ca| ca.data())
            .ok_or_else(|| ExecutorError::api("DescribeCluster", "cluster has no CA data"))?;

        let ca_pem = general_purpose::STANDARD
            .decode(ca_data)
            .context("decoding cluster CA")?;
        let certificate = Certificate::from_pem(&ca_pem).context("parsing cluster CA")?;
        let http = Client::builder()
            .add_root_certificate(certificate)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building cluster http client")?;

        Ok(Arc::new(ClusterEndpoint {
            endpoint: endpoint.to_string(),
            http,
        }))
    }

    /// Bearer token accepted by the EKS authenticator: a presigned STS
    /// `GetCallerIdentity` URL bound to the cluster name.
    async fn token(&self, cluster_name: &str) -> anyhow::Result<String> {
        let credentials = self
            .sdk_config
            .credentials_provider()
            .ok_or_else(|| anyhow!("no AWS credentials provider configured"))?
            .provide_credentials()
            .await?;
        let identity = Identity::new(credentials.clone(), credentials.expiry());

        let mut settings = SigningSettings::default();
        settings.signature_location = SignatureLocation::QueryParams;
        settings.expires_in = Some(TOKEN_EXPIRY);
        let params: SigningParams<'_> = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name("sts")
            .time(SystemTime::now())
            .settings(settings)
            .build()?
            .into();

        let mut url = Url::parse(&format!(
            "https://sts.{}.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15",
            self.region
        ))?;
        let headers = [(CLUSTER_ID_HEADER, cluster_name)];
        let request = SignableRequest::new(
            "GET",
            url.as_str().to_string(),
            headers.iter().copied(),
            SignableBody::Bytes(&[]),
        )?;
        let (instructions, _signature) = sign(request, &params)?.into_parts();
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in instructions.params() {
                query.append_pair(name, value);
            }
        }

        Ok(format!(
            "{}{}",
            TOKEN_PREFIX,
            general_purpose::URL_SAFE_NO_PAD.encode(url.as_str())
        ))
    }
}

#[async_trait]
impl ClusterConnector for EksConnector {
    async fn connect(&self, cluster_name: &str) -> Result<Arc<dyn ClusterApi>, ExecutorError> {
        if cluster_name.is_empty() {
            return Err(ExecutorError::api("DescribeCluster", "cluster name is empty"));
        }
        let cluster = self
            .clusters
            .get_or_try_init(cluster_name, || self.describe(cluster_name))
            .await?;
        let token = self.token(cluster_name).await?;
        Ok(Arc::new(KubeClient::new(
            cluster.http.clone(),
            &cluster.endpoint,
            token,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Path, Query, State},
        http::HeaderMap,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Seen {
        auth: Vec<String>,
        selectors: Vec<String>,
        deleted: Vec<String>,
    }

    async fn serve(seen: Arc<Mutex<Seen>>) -> String {
        async fn create(
            State(seen): State<Arc<Mutex<Seen>>>,
            headers: HeaderMap,
            Json(pod): Json<Value>,
        ) -> Json<Value> {
            seen.lock().unwrap().auth.push(
                headers["authorization"].to_str().unwrap().to_string(),
            );
            Json(json!({ "metadata": pod["metadata"].clone(), "spec": {} }))
        }

        async fn list(
            State(seen): State<Arc<Mutex<Seen>>>,
            Query(query): Query<std::collections::HashMap<String, String>>,
        ) -> Json<Value> {
            seen.lock()
                .unwrap()
                .selectors
                .push(query["labelSelector"].clone());
            Json(json!({ "items": [
                { "metadata": { "name": "beta-1-aaaaa" } },
                { "metadata": { "name": "beta-1-bbbbb" }, "spec": { "nodeName": "node-a" } }
            ] }))
        }

        async fn get_pod(Path((_ns, name)): Path<(String, String)>) -> Json<Value> {
            Json(json!({ "metadata": { "name": name }, "spec": { "nodeName": "node-a" } }))
        }

        async fn delete_pod(
            State(seen): State<Arc<Mutex<Seen>>>,
            Path((_ns, name)): Path<(String, String)>,
        ) -> (axum::http::StatusCode, Json<Value>) {
            if name == "gone" {
                return (axum::http::StatusCode::NOT_FOUND, Json(json!({})));
            }
            seen.lock().unwrap().deleted.push(name);
            (axum::http::StatusCode::OK, Json(json!({})))
        }

        let app = Router::new()
            .route("/api/v1/namespaces/:ns/pods", post(create).get(list))
            .route(
                "/api/v1/namespaces/:ns/pods/:name",
                get(get_pod).delete(delete_pod),
            )
            .with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_pod_calls_against_api_server() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let endpoint = serve(seen.clone()).await;
        let client = KubeClient::new(Client::new(), &endpoint, "k8s-aws-v1.abc".to_string());

        let name = client
            .create_pod("sd-builds", &json!({ "metadata": { "name": "beta-1-ccccc" } }))
            .await
            .unwrap();
        assert_eq!(name, "beta-1-ccccc");

        let node = client.pod_node("sd-builds", &name).await.unwrap();
        assert_eq!(node.as_deref(), Some("node-a"));

        let pods = client.list_pods("sd-builds", "sdbuild=beta-1").await.unwrap();
        assert_eq!(pods, vec!["beta-1-aaaaa", "beta-1-bbbbb"]);

        client.delete_pod("sd-builds", "beta-1-aaaaa").await.unwrap();
        client.delete_pod("sd-builds", "gone").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.auth, vec!["Bearer k8s-aws-v1.abc"]);
        assert_eq!(seen.selectors, vec!["sdbuild=beta-1"]);
        assert_eq!(seen.deleted, vec!["beta-1-aaaaa"]);
    }

    #[tokio::test]
    async fn test_api_errors_name_the_operation() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let endpoint = serve(seen).await;
        let client = KubeClient::new(Client::new(), &endpoint, "t".to_string());

        let err = client
            .create_pod("sd-builds", &json!({ "metadata": {} }))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("CreatePod failed"), "{}", err);
    }
}
