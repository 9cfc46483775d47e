//! Command transport: request/response channel to the table.
//!
//! Commands go out as HTTP POSTs to `http://{host}/sisbot/{endpoint}`.
//! The body is form-encoded with a single `data` field whose value is the
//! JSON document `{"data": params}` — an awkward double wrapping the
//! table's firmware insists on. Every response is a JSON [`Envelope`]
//! with `err`/`resp` fields.
//!
//! The [`Commands`] trait is the seam between the synchronization core
//! and the wire: the table facade only depends on "send a command, get a
//! structured reply", which keeps the core testable without a device.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::{
    config::Config,
    error::Result,
    http::Client as HttpClient,
    protocol::Envelope,
};

/// The capability to send one command and receive its structured reply.
#[async_trait]
pub trait Commands: Send + Sync {
    /// Sends `params` to the named endpoint and returns the `resp`
    /// payload of the reply envelope.
    ///
    /// # Errors
    ///
    /// Fails on transport problems (connection refused, timeout) and on
    /// a truthy `err` in the reply envelope.
    async fn send(&self, endpoint: &str, params: Value) -> Result<Value>;
}

/// HTTP implementation of [`Commands`] for one table.
pub struct Transport {
    http_client: HttpClient,
    host: String,
    timeout: Duration,
}

impl Transport {
    /// Form-encoded bodies, as the firmware expects.
    const FORM_CONTENT: HeaderValue =
        HeaderValue::from_static("application/x-www-form-urlencoded");

    /// Creates a transport for the table at `host`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed.
    pub fn new(config: &Config, host: &str) -> Result<Self> {
        Ok(Self {
            http_client: HttpClient::new(config)?,
            host: host.to_owned(),
            timeout: config.command_timeout,
        })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<reqwest::Url> {
        let url = format!("http://{}/sisbot/{endpoint}", self.host);
        url.parse::<reqwest::Url>().map_err(Into::into)
    }
}

#[async_trait]
impl Commands for Transport {
    async fn send(&self, endpoint: &str, params: Value) -> Result<Value> {
        let url = self.endpoint_url(endpoint)?;

        let payload = serde_json::to_string(&json!({ "data": params }))?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("data", &payload)
            .finish();

        let mut request = self.http_client.post(url, body);
        request
            .headers_mut()
            .try_insert(CONTENT_TYPE, Self::FORM_CONTENT)?;

        trace!("POST {endpoint}");
        let response =
            tokio::time::timeout(self.timeout, self.http_client.execute(request)).await??;
        let envelope = response.json::<Envelope>().await?;

        envelope.into_result()
    }
}
