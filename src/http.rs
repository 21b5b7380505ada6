//! HTTP client with rate limiting, and the sync server API on top of it.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting so polling loops cannot flood a server
//! * Consistent timeouts and headers
//!
//! [`SyncServer`] speaks the sync server's routes:
//!
//! | Route                        | Method | Payload                     |
//! |------------------------------|--------|-----------------------------|
//! | `/host/create[/{uid}]`       | GET    | -> `{"token": "..."}`       |
//! | `/host/update/{room}`        | POST   | form field `json`: `Update` |
//! | `/update/{room}`             | GET    | -> `Instance`               |
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lockstep::{config::Config, http::{Client, SyncServer}};
//!
//! # async fn example() -> lockstep::error::Result<()> {
//! let config = Config::default();
//! let client = Arc::new(Client::new(&config)?);
//! let server = SyncServer::new(client, config.server.clone());
//!
//! let room = server.create_room(None).await?;
//! let instance = server.instance(&room).await?;
//! # Ok(())
//! # }
//! ```

use std::{future::Future, num::NonZeroU32, sync::Arc, time::Duration};

use futures_util::FutureExt;
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    self,
    header::{HeaderValue, ACCEPT, CONTENT_TYPE},
    Body, Method, Url,
};
use serde::Deserialize;

use crate::{
    config::Config,
    error::{Error, Result},
    playback::{Instance, Update},
};

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Direct access to the underlying client without rate limiting.
    ///
    /// Used for audio downloads, which are a single long request.
    pub unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window for the rate limit.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(1);

    /// Maximum calls per interval; bursts up to this are allowed.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 10;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    ///
    /// Keeps a stalled server from blocking a poll cycle for long.
    const READ_TIMEOUT: Duration = Duration::from_secs(2);

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .default_headers(headers)
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
    pub fn post<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    /// Builds a GET request without body.
    pub fn get<U>(&self, url: U) -> reqwest::Request
    where
        U: Into<Url>,
    {
        reqwest::Request::new(Method::GET, url.into())
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the server responds with an
    /// error status.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| {
            self.unlimited.execute(request).map(|result| {
                result
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(Into::into)
            })
        })
    }

    /// Executes a request and deserializes a JSON response body.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the body is not valid JSON for
    /// `T`.
    pub async fn json<T>(&self, request: reqwest::Request) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self.execute(request).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(Into::into)
    }

    /// Starts downloading `url` without rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the server responds with an
    /// error status.
    pub async fn download(&self, url: Url) -> Result<reqwest::Response> {
        let response = self.unlimited.get(url).send().await?;
        response.error_for_status().map_err(Into::into)
    }
}

/// Client for the sync server routes.
pub struct SyncServer {
    client: Arc<Client>,
    base: Url,
}

#[derive(Deserialize)]
struct Room {
    token: String,
}

impl SyncServer {
    #[must_use]
    pub fn new(client: Arc<Client>, base: Url) -> Self {
        Self { client, base }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Creates a room, or reclaims `uid` if given, and returns its token.
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot be reached or refuses.
    pub async fn create_room(&self, uid: Option<&str>) -> Result<String> {
        let url = match uid {
            Some(uid) => self.endpoint(&["host", "create", uid])?,
            None => self.endpoint(&["host", "create"])?,
        };

        let room: Room = self.client.json(self.client.get(url)).await?;
        if room.token.is_empty() {
            return Err(Error::internal("server returned an empty room token"));
        }

        Ok(room.token)
    }

    /// Publishes `update` to `room`.
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot be reached or refuses.
    pub async fn publish(&self, room: &str, update: &Update) -> Result<()> {
        let url = self.endpoint(&["host", "update", room])?;
        let json = serde_json::to_string(update)?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("json", &json)
            .finish();

        let mut request = self.client.post(url, body);
        request.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        self.client.execute(request).await?;
        Ok(())
    }

    /// Fetches what `room` is playing.
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot be reached, refuses or responds
    /// with something other than an instance.
    pub async fn instance(&self, room: &str) -> Result<Instance> {
        let url = self.endpoint(&["update", room])?;
        self.client.json(self.client.get(url)).await
    }

    /// Appends path segments to the base URL, percent-encoding each.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::invalid_argument(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(base: &str) -> SyncServer {
        let client = Client::new(&Config::default()).unwrap();
        SyncServer::new(Arc::new(client), Url::parse(base).unwrap())
    }

    #[test]
    fn endpoints_append_to_base() {
        let server = server("http://localhost:5400");
        assert_eq!(
            server.endpoint(&["host", "create"]).unwrap().as_str(),
            "http://localhost:5400/host/create"
        );

        let server = self::server("http://example.com/sync/");
        assert_eq!(
            server.endpoint(&["update", "a b/c"]).unwrap().as_str(),
            "http://example.com/sync/update/a%20b%2Fc"
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        let server = server("mailto:someone@example.com");
        assert!(server.endpoint(&["update", "room"]).is_err());
    }
}
