use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::error::{CacheError, ServiceRequestError};

const USER_AGENT: &str = concat!("layercache/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// JSON-over-HTTP access to one cache service endpoint.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: Client,
    service_url: String,
    auth_token: Option<String>,
    accept: Option<String>,
}

impl ServiceClient {
    pub fn new(http: Client, service_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            http,
            service_url: service_url.into(),
            auth_token,
            accept: None,
        }
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.service_url.trim_end_matches('/'), path)
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self.http.request(method, self.url(path));
        if let Some(accept) = &self.accept {
            request = request.header(reqwest::header::ACCEPT, accept.as_str());
        }
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        request
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B, success: &[u16]) -> Result<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(self.request(Method::POST, path).json(body), success)
            .await
    }

    /// Sends `request` and decodes the JSON body. An empty body is `None`.
    pub async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder, success: &[u16]) -> Result<Option<T>> {
        let response = request.send().await.context("Cache service request failed")?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .context("Failed to read cache service response")?;

        if !success.contains(&status.as_u16()) {
            let text = String::from_utf8_lossy(&body).into_owned();
            log::debug!("Cache service returned HTTP {}: {}", status, text);
            return Err(CacheError::from(ServiceRequestError::new(status.as_u16(), text)).into());
        }

        parse_json_body(&body)
    }
}

pub fn parse_json_body<T: DeserializeOwned>(body: &[u8]) -> Result<Option<T>> {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .context("Failed to parse cache service response")
}

/// Fails with a typed service error unless `response` has an accepted status.
pub async fn ensure_status(response: reqwest::Response, success: &[u16]) -> Result<reqwest::Response> {
    let status = response.status();
    if success.contains(&status.as_u16()) {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CacheError::from(ServiceRequestError::new(status.as_u16(), body)).into())
}
