//! HTTP client with rate limiting and cookie management for the AdVouch APIs.
//!
//! Wraps `reqwest::Client` to add:
//! * Request rate limiting so a misbehaving refresh or retry loop cannot
//!   hammer the backends
//! * Cookie management for the HTTP-only refresh credential
//! * Consistent timeouts and headers
//!
//! Requests that would exceed the rate limit are delayed, with bursts allowed
//! up to the maximum calls per interval.

use std::{future::Future, num::NonZeroU32, sync::Arc, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    self,
    cookie::CookieStore,
    header::{HeaderValue, ACCEPT_LANGUAGE},
    Body, Method, Url,
};

use crate::config::Config;

pub type Result<T> = std::result::Result<T, reqwest::Error>;

/// Rate-limited HTTP client with optional cookie storage.
pub struct Client {
    /// Unlimited request client for special cases.
    ///
    /// Direct access to the underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    /// Rate limiter shared by all requests through [`execute`](Self::execute).
    rate_limiter: DefaultDirectRateLimiter,

    /// Cookie storage for the refresh credential.
    ///
    /// Optional to support unauthenticated endpoints.
    pub cookie_jar: Option<Arc<dyn CookieStore>>,

    /// Stable device id reported on every request.
    device_id: Option<HeaderValue>,

    /// Device name reported on every request.
    ///
    /// Skipped when the configured name is not a legal header value.
    device_name: Option<HeaderValue>,
}

impl Client {
    /// Header carrying the stable device id.
    const DEVICE_ID_HEADER: &'static str = "x-device-id";

    /// Header carrying the device name.
    const DEVICE_NAME_HEADER: &'static str = "x-device-name";

    /// Rolling window over which calls are counted.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum API calls per interval.
    ///
    /// The backends do not publish a quota; this is a self-imposed ceiling
    /// generous enough for the handshake, profile sync and refresh combined.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 30;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    const READ_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a new client with optional cookie storage.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client creation fails.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new<C>(config: &Config, cookie_jar: Option<C>) -> Result<Self>
    where
        C: CookieStore + 'static,
    {
        // Not having `Accept-Language` set is non-fatal.
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(lang) = HeaderValue::from_str(&config.app_lang) {
            headers.insert(ACCEPT_LANGUAGE, lang);
        }

        // Wrap `cookie_jar` in an `Arc` for asynchronous use.
        let cookie_jar = cookie_jar.map(|jar| Arc::new(jar));

        let mut http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent);

        if let Some(ref jar) = cookie_jar {
            http_client = http_client.cookie_provider(Arc::clone(jar));
        }

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
            cookie_jar: cookie_jar.map(|jar| jar as _), // coerce compiler to infer type
            device_id: HeaderValue::from_str(&config.device_id.to_string()).ok(),
            device_name: HeaderValue::from_str(&config.device_name).ok(),
        })
    }

    /// Creates a new client with cookie storage.
    ///
    /// For the identity endpoints, where the refresh credential lives in an
    /// HTTP-only cookie.
    ///
    /// # Errors
    ///
    /// Returns error if client creation fails.
    pub fn with_cookies<C>(config: &Config, cookie_jar: C) -> Result<Self>
    where
        C: CookieStore + 'static,
    {
        Self::new(config, Some(cookie_jar))
    }

    /// Creates a new client without cookie storage.
    ///
    /// # Errors
    ///
    /// Returns error if client creation fails.
    pub fn without_cookies(config: &Config) -> Result<Self> {
        // Need to specify a type that satisfies the trait bounds.
        Self::new(config, None::<reqwest::cookie::Jar>)
    }

    /// Builds a request with specified method, URL and body.
    ///
    /// Every request identifies the device through the device id and name
    /// headers.
    pub fn request<U, T>(&self, method: Method, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        let mut request = reqwest::Request::new(method, url.into());

        let headers = request.headers_mut();
        if let Some(ref device_id) = self.device_id {
            headers.insert(Self::DEVICE_ID_HEADER, device_id.clone());
        }
        if let Some(ref device_name) = self.device_name {
            headers.insert(Self::DEVICE_NAME_HEADER, device_name.clone());
        }

        let body_mut = request.body_mut();
        *body_mut = Some(body.into());

        request
    }

    /// Builds a POST request.
    pub fn post<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    /// Builds a GET request.
    pub fn get<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::GET, url, body)
    }

    /// Builds a DELETE request.
    pub fn delete<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::DELETE, url, body)
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if request execution or the network fails.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        // No need to await with jitter because the level of concurrency is low.
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }
}
