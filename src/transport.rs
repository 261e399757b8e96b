//! HTTP access to the device.
//!
//! The client only needs four request shapes, so they sit behind a small trait
//! that tests replace with scripted responses.

use crate::error::{FritzError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, cookie::Jar, multipart};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One field of a `multipart/form-data` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub value: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

impl FormPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            file_name: None,
            content_type: None,
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            file_name: Some(file_name.into()),
            content_type: Some(content_type.into()),
        }
    }
}

/// Request primitives against one `host:port`.
///
/// `path` includes the query string. Every method returns the response body
/// and fails on a non-success status.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> Result<String>;

    /// POST an `application/x-www-form-urlencoded` body that is already encoded.
    async fn post_form(&self, path: &str, body: &str) -> Result<String>;

    async fn post_multipart(&self, path: &str, parts: Vec<FormPart>) -> Result<String>;

    /// POST a SOAP envelope with the given `SOAPACTION`.
    async fn soap(&self, path: &str, action: &str, envelope: &str) -> Result<String>;
}

/// `Transport` backed by reqwest.
///
/// Keeps a cookie jar across requests like a browser session would.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for `http://host:port`.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(jar)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: format!("http://{host}:{port}"),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{base}{path}", base = self.base_url)
    }

    async fn body(path: &str, response: Response) -> Result<String> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FritzError::not_found(path));
        }
        let response = response.error_for_status()?;
        let body = response.text().await?;
        debug!("{path}: {status}, {} bytes", body.len());
        Ok(body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str) -> Result<String> {
        let response = self.client.get(self.url(path)).send().await?;
        Self::body(path, response).await
    }

    async fn post_form(&self, path: &str, body: &str) -> Result<String> {
        let response = self
            .client
            .post(self.url(path))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body.to_string())
            .send()
            .await?;
        Self::body(path, response).await
    }

    async fn post_multipart(&self, path: &str, parts: Vec<FormPart>) -> Result<String> {
        let mut form = multipart::Form::new();
        for part in parts {
            let mut field = multipart::Part::text(part.value);
            if let Some(file_name) = part.file_name {
                field = field.file_name(file_name);
            }
            if let Some(content_type) = part.content_type {
                field = field.mime_str(&content_type)?;
            }
            form = form.part(part.name, field);
        }
        let response = self
            .client
            .post(self.url(path))
            .multipart(form)
            .send()
            .await?;
        Self::body(path, response).await
    }

    async fn soap(&self, path: &str, action: &str, envelope: &str) -> Result<String> {
        let response = self
            .client
            .post(self.url(path))
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .header("SOAPACTION", action)
            .body(envelope.to_string())
            .send()
            .await?;
        Self::body(path, response).await
    }
}
