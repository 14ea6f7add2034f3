use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rand::Rng;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{settings, USER_AGENT};

const API_VERSION: &str = "v4";

/// Where a build ended up running, as reported to the build-tracking API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStats {
    pub hostname: String,
    pub image_pull_start_time: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildUpdate<'a> {
    stats: &'a BuildStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_message: Option<&'a str>,
}

/// Error body returned by the build-tracking API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub status_code: u16,
    pub error: String,
    pub message: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.status_code, self.error, self.message)
    }
}

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("hostname value is empty")]
    EmptyHostname,
    #[error("invalid build-tracking API url '{0}'")]
    InvalidUrl(String),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("received response {status} from {url}: {error}")]
    Api {
        status: StatusCode,
        url: String,
        error: ApiError,
    },
    #[error("unparseable error response {status} from {url}: {source}")]
    Unparseable {
        status: StatusCode,
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait BuildTracker: Send + Sync {
    async fn update_build(
        &self,
        stats: &BuildStats,
        build_id: i64,
        status_message: Option<&str>,
    ) -> Result<(), TrackingError>;
}

/// Hands out a tracker bound to one API endpoint and build token.
pub trait TrackerFactory: Send + Sync {
    fn connect(&self, api_uri: &str, token: &str) -> Result<Box<dyn BuildTracker>, TrackingError>;
}

#[derive(Debug, Clone)]
struct RetryPolicy {
    max_retries: u32,
    wait_min: Duration,
    wait_max: Duration,
}

impl RetryPolicy {
    /// Linear backoff with jitter: `attempt * random(wait_min..=wait_max)`.
    fn backoff(&self, attempt: u32) -> Duration {
        let (lo, hi) = if self.wait_min <= self.wait_max {
            (self.wait_min, self.wait_max)
        } else {
            (self.wait_max, self.wait_min)
        };
        let jitter = rand::rng().random_range(lo.as_millis()..=hi.as_millis());
        Duration::from_millis(jitter as u64) * attempt
    }

    fn should_retry(result: &Result<Response, reqwest::Error>) -> bool {
        match result {
            Ok(response) => {
                response.status() == StatusCode::TOO_MANY_REQUESTS
                    || response.status().is_server_error()
            }
            Err(e) => e.is_connect() || e.is_timeout(),
        }
    }
}

/// [`TrackerFactory`] over HTTP. All trackers share one connection pool.
pub struct HttpTrackerFactory {
    http: Client,
    retry: RetryPolicy,
}

impl HttpTrackerFactory {
    pub fn new(settings: &settings::Tracking) -> anyhow::Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(&*USER_AGENT)
            .build()?;
        Ok(HttpTrackerFactory {
            http,
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                wait_min: Duration::from_millis(settings.retry_wait_min_ms),
                wait_max: Duration::from_millis(settings.retry_wait_max_ms),
            },
        })
    }
}

impl TrackerFactory for HttpTrackerFactory {
    fn connect(&self, api_uri: &str, token: &str) -> Result<Box<dyn BuildTracker>, TrackingError> {
        let base_url = api_uri.trim_end_matches('/');
        if reqwest::Url::parse(base_url).is_err() {
            return Err(TrackingError::InvalidUrl(api_uri.to_string()));
        }
        Ok(Box::new(BuildApiClient {
            http: self.http.clone(),
            retry: self.retry.clone(),
            base_url: base_url.to_string(),
            token: token.to_string(),
        }))
    }
}

pub struct BuildApiClient {
    http: Client,
    retry: RetryPolicy,
    base_url: String,
    token: String,
}

impl BuildApiClient {
    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, API_VERSION, path)
    }

    async fn put<T: Serialize + Sync>(&self, url: &str, body: &T) -> Result<(), TrackingError> {
        let mut attempt = 0;
        loop {
            let result = self
                .http
                .put(url)
                .bearer_auth(&self.token)
                .json(body)
                .send()
                .await;

            if attempt < self.retry.max_retries && RetryPolicy::should_retry(&result) {
                attempt += 1;
                let wait = self.retry.backoff(attempt);
                match &result {
                    Ok(response) => warn!(
                        "PUT {} returned {}, retrying in {:?} ({}/{})",
                        url,
                        response.status(),
                        wait,
                        attempt,
                        self.retry.max_retries
                    ),
                    Err(e) => warn!(
                        "PUT {} failed: {}, retrying in {:?} ({}/{})",
                        url, e, wait, attempt, self.retry.max_retries
                    ),
                }
                tokio::time::sleep(wait).await;
                continue;
            }

            let response = result.map_err(|source| TrackingError::Request {
                url: url.to_string(),
                source,
            })?;
            return Self::check(url, response).await;
        }
    }

    async fn check(url: &str, response: Response) -> Result<(), TrackingError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .bytes()
            .await
            .map_err(|source| TrackingError::Request {
                url: url.to_string(),
                source,
            })?;
        match serde_json::from_slice::<ApiError>(&body) {
            Ok(error) => Err(TrackingError::Api {
                status,
                url: url.to_string(),
                error,
            }),
            Err(source) => Err(TrackingError::Unparseable {
                status,
                url: url.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl BuildTracker for BuildApiClient {
    async fn update_build(
        &self,
        stats: &BuildStats,
        build_id: i64,
        status_message: Option<&str>,
    ) -> Result<(), TrackingError> {
        if stats.hostname.is_empty() {
            return Err(TrackingError::EmptyHostname);
        }
        let update = BuildUpdate {
            stats,
            status_message: status_message.filter(|m| !m.is_empty()),
        };
        let url = self.url(&format!("builds/{}", build_id));
        debug!("Updating build {} with hostname {}", build_id, stats.hostname);
        self.put(&url, &update).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::put,
        Json, Router,
    };
    use chrono::TimeZone;
    use serde_json::{json, Value};

    use super::*;

    #[derive(Default)]
    struct Server {
        hits: AtomicUsize,
        /// Statuses to answer with, in order; 200 once exhausted.
        script: Mutex<Vec<(u16, String)>>,
        seen: Mutex<Vec<(String, String, Value)>>,
    }

    async fn serve(server: Arc<Server>) -> String {
        async fn update(
            State(server): State<Arc<Server>>,
            Path(id): Path<String>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> (AxumStatus, String) {
            server.hits.fetch_add(1, Ordering::SeqCst);
            server.seen.lock().unwrap().push((
                id,
                headers["authorization"].to_str().unwrap().to_string(),
                body,
            ));
            let mut script = server.script.lock().unwrap();
            if script.is_empty() {
                return (AxumStatus::OK, "{}".to_string());
            }
            let (status, body) = script.remove(0);
            (AxumStatus::from_u16(status).unwrap(), body)
        }

        let app = Router::new()
            .route("/v4/builds/:id", put(update))
            .with_state(server);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn factory(max_retries: u32) -> HttpTrackerFactory {
        HttpTrackerFactory::new(&settings::Tracking {
            timeout_secs: 5,
            max_retries,
            retry_wait_min_ms: 1,
            retry_wait_max_ms: 3,
        })
        .unwrap()
    }

    fn stats(hostname: &str) -> BuildStats {
        BuildStats {
            hostname: hostname.to_string(),
            image_pull_start_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_update_build_sends_stats() {
        let server = Arc::new(Server::default());
        let api = serve(server.clone()).await;
        let tracker = factory(0).connect(&format!("{}/", api), "jwt").unwrap();

        tracker
            .update_build(&stats("node123.example.com"), 127113, None)
            .await
            .unwrap();

        let seen = server.seen.lock().unwrap();
        let (id, auth, body) = &seen[0];
        assert_eq!(id, "127113");
        assert_eq!(auth, "Bearer jwt");
        assert_eq!(
            *body,
            json!({ "stats": {
                "hostname": "node123.example.com",
                "imagePullStartTime": "2024-03-01T12:00:00Z"
            } })
        );
    }

    #[tokio::test]
    async fn test_status_message_is_included_when_set() {
        let server = Arc::new(Server::default());
        let api = serve(server.clone()).await;
        let tracker = factory(0).connect(&api, "jwt").unwrap();

        tracker
            .update_build(&stats("node"), 1, Some("Waiting for node"))
            .await
            .unwrap();

        assert_eq!(
            server.seen.lock().unwrap()[0].2["statusMessage"],
            "Waiting for node"
        );
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let server = Arc::new(Server::default());
        *server.script.lock().unwrap() = vec![
            (503, "unavailable".to_string()),
            (429, "slow down".to_string()),
        ];
        let api = serve(server.clone()).await;
        let tracker = factory(3).connect(&api, "jwt").unwrap();

        tracker.update_build(&stats("node"), 1, None).await.unwrap();
        assert_eq!(server.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = Arc::new(Server::default());
        *server.script.lock().unwrap() = vec![(500, "boom".to_string()); 5];
        let api = serve(server.clone()).await;
        let tracker = factory(1).connect(&api, "jwt").unwrap();

        let err = tracker.update_build(&stats("node"), 1, None).await.unwrap_err();
        assert!(matches!(err, TrackingError::Unparseable { status, .. } if status == 500));
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_client_errors_are_decoded_and_not_retried() {
        let server = Arc::new(Server::default());
        *server.script.lock().unwrap() = vec![(
            404,
            json!({ "statusCode": 404, "error": "Not Found", "message": "Build does not exist" })
                .to_string(),
        )];
        let api = serve(server.clone()).await;
        let tracker = factory(5).connect(&api, "jwt").unwrap();

        let err = tracker.update_build(&stats("node"), 9, None).await.unwrap_err();
        match err {
            TrackingError::Api { status, error, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(error.to_string(), "404 Not Found: Build does not exist");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_hostname_is_rejected_before_sending() {
        let server = Arc::new(Server::default());
        let api = serve(server.clone()).await;
        let tracker = factory(0).connect(&api, "jwt").unwrap();

        let err = tracker.update_build(&stats(""), 1, None).await.unwrap_err();
        assert!(matches!(err, TrackingError::EmptyHostname));
        assert_eq!(server.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_rejects_bad_url() {
        assert!(matches!(
            factory(0).connect("not a url", "jwt"),
            Err(TrackingError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_backoff_grows_linearly() {
        let policy = RetryPolicy {
            max_retries: 5,
            wait_min: Duration::from_millis(100),
            wait_max: Duration::from_millis(300),
        };
        for attempt in 1..=3 {
            let wait = policy.backoff(attempt);
            assert!(wait >= Duration::from_millis(100) * attempt);
            assert!(wait <= Duration::from_millis(300) * attempt);
        }
    }
}
