//! HTTP client with rate limiting for the table's embedded web server.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting, so a chatty caller cannot overwhelm the
//!   single-board computer inside the table
//! * Consistent timeouts and headers
//!
//! # Rate Limiting
//!
//! * 25 calls per 5-second interval
//! * Automatic request throttling, allowing bursts up to the maximum
//!   calls per interval
//! * Requests that would exceed the limit are delayed, not rejected

use std::{future::Future, num::NonZeroU32, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{self, Body, Method, Url};

use crate::{config::Config, error::Result};

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Unlimited request client for special cases.
    ///
    /// Direct access to the underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    /// Rate limiter protecting the table's embedded server.
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window during which a maximum number of calls can be made.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum allowed calls per interval.
    ///
    /// The table's web server runs on a Raspberry-Pi-class board; requests
    /// beyond this limit are automatically delayed.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 25;

    /// Duration to keep idle connections alive.
    ///
    /// Prevents frequent reconnection overhead for subsequent requests.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    const READ_TIMEOUT: Duration = Duration::from_secs(2);

    /// Creates a new client.
    ///
    /// # Arguments
    ///
    /// * `config` - Client configuration including the user agent
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client creation fails.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .user_agent(&config.user_agent);

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Builds a request with specified method, URL and body.
    ///
    /// Creates a raw request that can be executed with `execute()`.
    pub fn request<U, T>(&self, method: Method, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        let mut request = reqwest::Request::new(method, url.into());
        let body_mut = request.body_mut();
        *body_mut = Some(body.into());

        request
    }

    /// Builds a POST request.
    ///
    /// Convenience method for `request()` with POST method.
    pub fn post<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    /// Executes a request with rate limiting.
    ///
    /// Applies rate limiting before executing the request.
    ///
    /// # Errors
    ///
    /// Returns error if request execution fails or a network error occurs.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        // No need to await with jitter because the level of concurrency is low.
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }
}
