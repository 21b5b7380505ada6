//! Finding the audio of a track.
//!
//! The resolver asks an HTTP service where a track's audio can be
//! downloaded. The service answers with a [`DownloadInfo`]:
//!
//! ```json
//! { "url": "https://...", "decryption_key": "00112233445566778899aabbccddeeff" }
//! ```
//!
//! Only sources with a configured endpoint can be resolved.

use std::{collections::HashMap, sync::Arc};

use reqwest::header::{HeaderValue, AUTHORIZATION};
use url::Url;

use crate::{
    config::Endpoint,
    error::{Error, Result},
    http::Client,
    secrets::Token,
    track::{DownloadInfo, Source, Track},
};

pub struct Resolver {
    client: Arc<Client>,
    endpoints: HashMap<Source, Url>,
    token: Option<Token>,
}

impl Resolver {
    #[must_use]
    pub fn new(client: Arc<Client>, token: Option<Token>) -> Self {
        Self {
            client,
            endpoints: HashMap::new(),
            token,
        }
    }

    /// Resolves tracks of `endpoint.source` through `endpoint.endpoint`.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.insert(endpoint.source, endpoint.endpoint);
        self
    }

    #[must_use]
    pub fn supports(&self, source: Source) -> bool {
        self.endpoints.contains_key(&source)
    }

    /// Looks up where to download `track`.
    ///
    /// The track id is passed as the `id` query parameter.
    ///
    /// # Errors
    ///
    /// * `Unimplemented` when the track's source has no resolver
    /// * `NotFound` when the service returns no URL
    /// * any error of the request itself
    pub async fn resolve(&self, track: &Track) -> Result<DownloadInfo> {
        let Some(endpoint) = self.endpoints.get(&track.source) else {
            return Err(Error::unimplemented(format!(
                "{} tracks cannot be resolved",
                track.source
            )));
        };

        let mut url = endpoint.clone();
        url.query_pairs_mut().append_pair("id", &track.id);

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("OAuth {}", token.expose()))
                .map_err(|e| Error::invalid_argument(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let mut info: DownloadInfo = self.client.json(request).await?;
        if info.decryption_key.as_deref().is_some_and(str::is_empty) {
            info.decryption_key = None;
        }

        debug!(
            "resolved {track}: {}encrypted",
            if info.decryption_key.is_some() { "" } else { "not " }
        );
        Ok(info)
    }
}
