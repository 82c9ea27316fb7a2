//! HTTP transport to the remote site
//!
//! Session credentials (cookie, CSRF token) come from configuration; this
//! layer only attaches them. All traffic goes through one `LimitedTransport`
//! so the request window is shared by every component.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, LOCATION, REFERER, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{RemoteError, RemoteResult};
use crate::rate_limit::RateLimiter;

/// Status, body and redirect target of one response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub location: Option<String>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            location: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    /// Success status or the mapped error
    pub fn ensure_success(self) -> RemoteResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RemoteError::from_status(self.status))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> RemoteResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Opaque GET/POST client
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> RemoteResult<HttpResponse>;

    /// POST `application/x-www-form-urlencoded`; repeated keys allowed
    async fn post_form(&self, path: &str, form: &[(String, String)]) -> RemoteResult<HttpResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn get(&self, path: &str) -> RemoteResult<HttpResponse> {
        (**self).get(path).await
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> RemoteResult<HttpResponse> {
        (**self).post_form(path, form).await
    }
}

/// reqwest-backed transport carrying the session headers
pub struct ReqwestTransport {
    /// Follows redirects (page loads)
    client: Client,
    /// Leaves redirects to the caller (form posts)
    post_client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(cfg: &SessionConfig) -> anyhow::Result<Self> {
        let headers = Self::session_headers(cfg)?;
        let connect_timeout = Duration::from_secs(cfg.connect_timeout_secs);
        let timeout = Duration::from_secs(cfg.request_timeout_secs);

        let client = Client::builder()
            .default_headers(headers.clone())
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;

        let post_client = Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .redirect(Policy::none())
            .build()?;

        Ok(Self {
            client,
            post_client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn session_headers(cfg: &SessionConfig) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(&cfg.user_agent)?);
        headers.insert(REFERER, HeaderValue::from_str(&cfg.base_url)?);
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));

        if let Some(cookie) = cfg.cookie.as_deref().filter(|c| !c.is_empty()) {
            headers.insert(COOKIE, HeaderValue::from_str(cookie)?);
        }
        if let Some(token) = cfg.csrf_token.as_deref().filter(|t| !t.is_empty()) {
            headers.insert("X-CSRF-TOKEN", HeaderValue::from_str(token)?);
        }
        Ok(headers)
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn read(response: reqwest::Response) -> RemoteResult<HttpResponse> {
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;
        Ok(HttpResponse {
            status,
            body,
            location,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, path: &str) -> RemoteResult<HttpResponse> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;
        Self::read(response).await
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> RemoteResult<HttpResponse> {
        let url = self.url(path);
        debug!("POST {}", url);
        let response = self.post_client.post(&url).form(form).send().await?;
        Self::read(response).await
    }
}

/// Applies the shared rate limiter and transient retries to any transport
pub struct LimitedTransport<T> {
    inner: T,
    limiter: Arc<RateLimiter>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<T: Transport> LimitedTransport<T> {
    pub fn new(
        inner: T,
        limiter: Arc<RateLimiter>,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner,
            limiter,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// `form` selects POST; `None` means GET. Only GETs are retried, a POST
    /// may have taken effect before the failure was seen.
    async fn send(
        &self,
        path: &str,
        form: Option<&[(String, String)]>,
    ) -> RemoteResult<HttpResponse> {
        let mut attempt = 1;
        loop {
            self.limiter.acquire().await;

            let result = match form {
                Some(form) => self.inner.post_form(path, form).await,
                None => self.inner.get(path).await,
            };

            match result {
                Ok(response) => {
                    if response.status == 429 {
                        self.limiter.record_throttled();
                    }
                    return Ok(response);
                }
                Err(e) if form.is_none() && e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.retry_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        path,
                        e,
                        attempt,
                        self.max_attempts - 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for LimitedTransport<T> {
    async fn get(&self, path: &str) -> RemoteResult<HttpResponse> {
        self.send(path, None).await
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> RemoteResult<HttpResponse> {
        self.send(path, Some(form)).await
    }
}
