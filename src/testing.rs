//! Scripted transport shared by the unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use crate::error::Result;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

type Responder = dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync;

/// Answers every request from a closure and records what it was asked.
pub(crate) struct ScriptedTransport {
    responder: Box<Responder>,
    delay: Option<Duration>,
    /// Only URLs ending with this suffix are delayed; all of them when unset
    delayed_suffix: Option<String>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            delay: None,
            delayed_suffix: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Same as `new`, but every response arrives after `delay`.
    pub(crate) fn delayed<F>(delay: Duration, responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            delay: Some(delay),
            delayed_suffix: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Same as `delayed`, but only requests to URLs ending with `url_suffix`
    /// are held back.
    pub(crate) fn delayed_matching<F>(url_suffix: &str, delay: Duration, responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            delay: Some(delay),
            delayed_suffix: Some(url_suffix.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, method: &Method, url_suffix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| &r.method == method && r.url.ends_with(url_suffix))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let matches = self
            .delayed_suffix
            .as_deref()
            .is_none_or(|suffix| request.url.ends_with(suffix));
        if let (Some(delay), true) = (self.delay, matches) {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(&request)
    }
}
