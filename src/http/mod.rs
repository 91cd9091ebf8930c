//! Outbound HTTP: the request client and Set-Cookie handling.
pub mod client;
pub mod cookie;

pub use client::{HttpClient, HttpResponse};
pub use cookie::SetCookie;

use crate::model::{Header, HttpMethod, Watcher};

/// The request portion of a watcher, ready to be executed. Workflow steps
/// substitute variables into a copy of this before sending.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<Header>,
    pub body: Option<Vec<u8>>,
}

impl From<&Watcher> for RequestTemplate {
    fn from(watcher: &Watcher) -> Self {
        Self {
            url: watcher.url.clone(),
            method: watcher.method,
            headers: watcher.headers.clone(),
            body: watcher.body.clone(),
        }
    }
}
