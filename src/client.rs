//! Client for Humio's asynchronous query job API.
//!
//! Jobs are created live against a repository, polled for their current
//! aggregate and deleted on shutdown.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Request, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::models::{JobResult, QueryJob, QuerySpec, StartQueryPayload, StartQueryResponse};
use crate::{ExporterError, Result};

#[async_trait]
pub trait JobClient: Send + Sync {
    /// Starts a live query job for `spec`.
    async fn submit(&self, spec: &QuerySpec) -> Result<QueryJob>;

    /// Fetches the job's current result. A job the service no longer knows
    /// about is reported as `JobNotFound`.
    async fn poll(&self, job: &QueryJob) -> Result<JobResult>;

    /// Best-effort delete; failures are logged and swallowed.
    async fn cancel(&self, job: &QueryJob);
}

pub struct HttpJobClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpJobClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpJobClient")
            .field("base_url", &self.base_url.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HttpJobClient {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            ExporterError::Configuration(format!("invalid Humio url {}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ExporterError::Configuration(format!(
                "Humio url {} cannot be used as a base url",
                base_url
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    fn jobs_url(&self, repo: &str, id: Option<&str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ExporterError::Internal(format!("cannot extend url {}", self.base_url))
            })?;
            segments
                .pop_if_empty()
                .extend(["api", "v1", "repositories", repo, "queryjobs"]);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.token)
    }

    /// Sends the request and turns any non-success status into
    /// `ExporterError::Remote` carrying the response body.
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let request = builder.build()?;
        let dump = request.try_clone();

        let response = self.http.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                error!("Read body failed: {}", e);
                "failed to read body".to_string()
            }
        };

        if let Some(request) = dump {
            debug!("Failed request dump: {}", dump_request(&request));
        }

        Err(ExporterError::Remote { status, body })
    }
}

#[async_trait]
impl JobClient for HttpJobClient {
    async fn submit(&self, spec: &QuerySpec) -> Result<QueryJob> {
        let payload = StartQueryPayload {
            query_string: &spec.query,
            start: &spec.window.start,
            end: &spec.window.end,
            is_live: spec.window.live,
        };
        let url = self.jobs_url(&spec.repo, None)?;

        let response = self
            .send(self.request(Method::POST, url).json(&payload))
            .await?;
        let started: StartQueryResponse = response.json().await?;

        info!(
            job_id = %started.id,
            repo = %spec.repo,
            metric = %spec.metric_name,
            "Started query job"
        );
        Ok(QueryJob {
            id: started.id,
            spec: spec.clone(),
        })
    }

    async fn poll(&self, job: &QueryJob) -> Result<JobResult> {
        let url = self.jobs_url(job.repo(), Some(&job.id))?;
        let response = self
            .send(self.request(Method::GET, url))
            .await
            .map_err(|e| match e {
                ExporterError::Remote { status, .. } if status == StatusCode::NOT_FOUND => {
                    ExporterError::JobNotFound(job.id.clone())
                }
                other => other,
            })?;
        Ok(response.json().await?)
    }

    async fn cancel(&self, job: &QueryJob) {
        let url = match self.jobs_url(job.repo(), Some(&job.id)) {
            Ok(url) => url,
            Err(e) => {
                warn!(job_id = %job.id, "Failed to stop query job: {}", e);
                return;
            }
        };

        match self.send(self.request(Method::DELETE, url)).await {
            Ok(_) => info!(job_id = %job.id, repo = %job.repo(), "Stopped query job"),
            Err(e) => warn!(job_id = %job.id, repo = %job.repo(), "Failed to stop query job: {}", e),
        }
    }
}

/// Method, url, headers and body of a request, with the credential redacted.
fn dump_request(request: &Request) -> String {
    let mut out = format!("{} {}\n", request.method(), request.url());
    for (name, value) in request.headers() {
        if name == AUTHORIZATION {
            out.push_str(&format!("{}: Bearer <redacted>\n", name));
        } else {
            out.push_str(&format!("{}: {}\n", name, value.to_str().unwrap_or("<binary>")));
        }
    }
    if let Some(body) = request.body().and_then(|b| b.as_bytes()) {
        out.push('\n');
        out.push_str(&String::from_utf8_lossy(body));
    }
    out
}
