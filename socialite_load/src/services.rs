//! The services a workload drives.
//!
//! A run talks to three collaborators: the graph store that records users and
//! follow edges, the content store that persists published items and the feed
//! service that fans items out to followers. Each is a trait so that a run may
//! target a live deployment over HTTP or an in-process memory backend.

use std::sync::Arc;

use async_trait::async_trait;
use socialite_payload::{Content, User};

pub mod http;
pub mod memory;

/// Errors produced by service backends
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request could not be completed.
    #[error("Request to {uri} failed: {source}")]
    Request {
        /// Target of the request
        uri: String,
        /// Underlying client error
        #[source]
        source: Box<reqwest::Error>,
    },
    /// The service answered with a non-success status.
    #[error("Request to {uri} returned status {status}")]
    Status {
        /// Target of the request
        uri: String,
        /// Status code returned
        status: u16,
    },
    /// The HTTP client could not be constructed.
    #[error("Unable to build HTTP client: {0}")]
    Client(Box<reqwest::Error>),
    /// The configured base URI is not usable.
    #[error("Invalid base URI {uri}: {reason}")]
    BaseUri {
        /// Configured URI
        uri: String,
        /// Why it was refused
        reason: &'static str,
    },
    /// A user was created twice.
    #[error("User {0} already exists")]
    Duplicate(User),
}

/// Stores users and the follow relation between them.
#[async_trait]
pub trait UserGraph: Send + Sync {
    /// Register `user`.
    async fn create_user(&self, user: &User) -> Result<(), Error>;

    /// Record that `follower` follows `user`.
    ///
    /// `user` is the newly generated user of a graph mutation and `follower`
    /// one of the existing users attached to it. The edge points from
    /// `follower` to `user`, so a later post by `user` reaches `follower`.
    async fn follow(&self, user: &User, follower: &User) -> Result<(), Error>;

    /// Verify the service is reachable.
    async fn check(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Release any resources held by the client.
    async fn stop(&self) {}
}

/// Persists published content.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Persist `content` on behalf of `user`.
    async fn publish_content(&self, user: &User, content: &Content) -> Result<(), Error>;

    /// Verify the service is reachable.
    async fn check(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Release any resources held by the client.
    async fn stop(&self) {}
}

/// Fans content out to the feeds of a user's followers.
#[async_trait]
pub trait Feed: Send + Sync {
    /// Post `content` to the followers of `user`.
    async fn post(&self, user: &User, content: &Content) -> Result<(), Error>;

    /// Verify the service is reachable.
    async fn check(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Release any resources held by the client.
    async fn stop(&self) {}
}

/// The full set of services a workload drives.
#[derive(Clone)]
pub struct Services {
    /// Graph store
    pub graph: Arc<dyn UserGraph>,
    /// Content store
    pub content: Arc<dyn ContentStore>,
    /// Feed service
    pub feed: Arc<dyn Feed>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

impl Services {
    /// Use a single backend for all three services.
    #[must_use]
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UserGraph + ContentStore + Feed + 'static,
    {
        Self {
            graph: Arc::clone(&backend) as Arc<dyn UserGraph>,
            content: Arc::clone(&backend) as Arc<dyn ContentStore>,
            feed: backend as Arc<dyn Feed>,
        }
    }

    /// Verify every service is reachable.
    ///
    /// # Errors
    ///
    /// Returns the first failure encountered.
    pub async fn check(&self) -> Result<(), Error> {
        self.graph.check().await?;
        ContentStore::check(self.content.as_ref()).await?;
        Feed::check(self.feed.as_ref()).await?;
        Ok(())
    }

    /// Stop every service client.
    pub async fn stop(&self) {
        self.graph.stop().await;
        ContentStore::stop(self.content.as_ref()).await;
        Feed::stop(self.feed.as_ref()).await;
    }
}
