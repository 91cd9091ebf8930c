//! Outbound HTTP client.
//!
//! One pooled client per process. Each call gets its cookies passed in
//! explicitly; the client keeps no jar of its own.
use bytes::Bytes;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::redirect;

use super::{RequestTemplate, SetCookie};
use crate::config::HttpConfig;
use crate::error::Error;
use crate::model::{Cookie, Header};

/// Everything the executors need from a response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// All response headers in wire order; repeated names (notably
    /// `Set-Cookie`) appear once per value.
    pub headers: Vec<Header>,
    pub body: Bytes,
    pub cookies: Vec<SetCookie>,
    pub content_type: Option<String>,
}

impl HttpResponse {
    /// Body as text, when it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// HTTP client with configured timeouts and redirect policy.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self, Error> {
        let inner = reqwest::Client::builder()
            .timeout(config.total_timeout())
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .redirect(redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { inner })
    }

    /// Execute one request. Any HTTP status is a successful execution;
    /// only transport failures (DNS, connect, TLS, timeout) are errors.
    pub async fn execute(
        &self,
        template: &RequestTemplate,
        cookies: &[Cookie],
    ) -> Result<HttpResponse, Error> {
        let method = match template.method {
            crate::model::HttpMethod::Get => reqwest::Method::GET,
            crate::model::HttpMethod::Post => reqwest::Method::POST,
            crate::model::HttpMethod::Put => reqwest::Method::PUT,
            crate::model::HttpMethod::Patch => reqwest::Method::PATCH,
            crate::model::HttpMethod::Delete => reqwest::Method::DELETE,
            crate::model::HttpMethod::Head => reqwest::Method::HEAD,
            crate::model::HttpMethod::Options => reqwest::Method::OPTIONS,
        };

        let mut request = self.inner.request(method, &template.url);

        for header in &template.headers {
            request = request.header(header.name.as_str(), header.value.as_str());
        }

        if !cookies.is_empty() {
            let jar = cookies
                .iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; ");
            request = request.header(COOKIE, jar);
        }

        if template.method.has_body() {
            if let Some(ref body) = template.body {
                request = request.body(body.clone());
            }
        }

        let response = request.send().await?;

        let status = response.status().as_u16();

        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                Header::new(name.as_str(), value.to_str().unwrap_or_default())
            })
            .collect::<Vec<_>>();

        let response_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(SetCookie::parse)
            .collect::<Vec<_>>();

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
            cookies: response_cookies,
            content_type,
        })
    }
}
