//! HTTP service backend.
//!
//! Drives a live deployment through a small REST surface rooted at a single
//! base URI:
//!
//! * `PUT {base}/users/{id}` registers a user
//! * `PUT {base}/users/{follower}/following/{user}` records that `follower`
//!   follows `user`
//! * `POST {base}/content/{author}` persists a content item
//! * `POST {base}/feed/{author}` fans a content item out
//!
//! Path segments are percent-encoded. Content is sent as JSON. Text values are
//! sent as-is, encrypted values are base64 encoded and tagged so the service
//! can tell the two apart.
//!
//! ## Metrics
//!
//! `requests_sent`: Requests issued, labeled by endpoint
//! `request_ok`: Requests answered with a success status
//! `request_failure`: Requests that errored or were refused
//!

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use http::Uri;
use metrics::counter;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use socialite_payload::{Content, User, Value};
use tracing::{debug, info};

use super::{ContentStore, Error, Feed, UserGraph};

fn default_request_timeout_millis() -> u64 {
    5_000
}

/// Configuration for [`Http`]
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base URI of the deployment, for example `http://localhost:8080`. Any
    /// path is kept as a prefix of every request path.
    #[serde(with = "http_serde::uri")]
    pub base_uri: Uri,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_millis")]
    pub request_timeout_millis: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum WireValue<'a> {
    Text(&'a str),
    Encrypted(String),
}

impl<'a> From<&'a Value> for WireValue<'a> {
    fn from(value: &'a Value) -> Self {
        match value {
            Value::Text(text) => WireValue::Text(text),
            Value::Encrypted(bytes) => WireValue::Encrypted(STANDARD.encode(bytes)),
        }
    }
}

#[derive(Serialize)]
struct WireContent<'a> {
    author: &'a str,
    body: WireValue<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<BTreeMap<&'a str, WireValue<'a>>>,
}

impl<'a> From<&'a Content> for WireContent<'a> {
    fn from(content: &'a Content) -> Self {
        WireContent {
            author: content.author().id(),
            body: content.body().into(),
            fields: content.fields().map(|fields| {
                fields
                    .iter()
                    .map(|(name, value)| (name.as_str(), WireValue::from(value)))
                    .collect()
            }),
        }
    }
}

/// HTTP implementation of every service trait.
#[derive(Debug, Clone)]
pub struct Http {
    client: reqwest::Client,
    base: Url,
}

impl Http {
    /// Create a new [`Http`] backend
    ///
    /// # Errors
    ///
    /// Function will error if the base URI is not an absolute `http` or
    /// `https` URI with a valid host and port, or if the client cannot be
    /// constructed.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let refuse = |reason| Error::BaseUri {
            uri: config.base_uri.to_string(),
            reason,
        };
        match config.base_uri.scheme_str() {
            Some("http" | "https") => {}
            _ => return Err(refuse("scheme must be http or https")),
        }
        if config.base_uri.authority().is_none_or(|a| a.host().is_empty()) {
            return Err(refuse("missing host"));
        }
        let base = Url::parse(&config.base_uri.to_string())
            .map_err(|_| refuse("host or port is malformed"))?;
        if base.cannot_be_a_base() || base.host_str().is_none_or(str::is_empty) {
            return Err(refuse("missing host"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_millis))
            .build()
            .map_err(|err| Error::Client(Box::new(err)))?;

        info!("HTTP services targeting {base}");
        Ok(Self { client, base })
    }

    /// The base URI extended by `segments`, each percent-encoded.
    fn uri(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(
        &self,
        endpoint: &'static str,
        uri: Url,
        request: reqwest::RequestBuilder,
    ) -> Result<(), Error> {
        let uri = uri.to_string();
        counter!("requests_sent", "endpoint" => endpoint).increment(1);
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                counter!("request_failure", "endpoint" => endpoint).increment(1);
                return Err(Error::Request {
                    uri,
                    source: Box::new(err),
                });
            }
        };
        let status = response.status();
        if !status.is_success() {
            counter!("request_failure", "endpoint" => endpoint).increment(1);
            return Err(Error::Status {
                uri,
                status: status.as_u16(),
            });
        }
        counter!("request_ok", "endpoint" => endpoint).increment(1);
        Ok(())
    }

    /// Verify the deployment is reachable. Any HTTP response counts.
    async fn reachable(&self) -> Result<(), Error> {
        let uri = self.base.clone();
        match self.client.get(uri.clone()).send().await {
            Ok(response) => {
                debug!("{uri} answered {status}", status = response.status());
                Ok(())
            }
            Err(err) => Err(Error::Request {
                uri: uri.to_string(),
                source: Box::new(err),
            }),
        }
    }
}

#[async_trait]
impl UserGraph for Http {
    async fn create_user(&self, user: &User) -> Result<(), Error> {
        let uri = self.uri(&["users", user.id()]);
        let request = self.client.put(uri.clone());
        self.send("create_user", uri, request).await
    }

    async fn follow(&self, user: &User, follower: &User) -> Result<(), Error> {
        let uri = self.uri(&["users", follower.id(), "following", user.id()]);
        let request = self.client.put(uri.clone());
        self.send("follow", uri, request).await
    }

    async fn check(&self) -> Result<(), Error> {
        self.reachable().await
    }
}

#[async_trait]
impl ContentStore for Http {
    async fn publish_content(&self, user: &User, content: &Content) -> Result<(), Error> {
        let uri = self.uri(&["content", user.id()]);
        let request = self.client.post(uri.clone()).json(&WireContent::from(content));
        self.send("publish_content", uri, request).await
    }
}

#[async_trait]
impl Feed for Http {
    async fn post(&self, user: &User, content: &Content) -> Result<(), Error> {
        let uri = self.uri(&["feed", user.id()]);
        let request = self.client.post(uri.clone()).json(&WireContent::from(content));
        self.send("post", uri, request).await
    }
}
