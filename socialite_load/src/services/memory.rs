//! In-process service backend.
//!
//! Holds the follow graph in memory and counts every call made against it.
//! Useful for dry runs that exercise generation and dispatch without a live
//! deployment, and as the reference backend in tests. Totals are logged when
//! the services are stopped.

use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use socialite_payload::{Content, User};
use tracing::info;

use super::{ContentStore, Error, Feed, UserGraph};

/// Configuration for [`Memory`]
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Fail the second creation of the same user
    #[serde(default)]
    pub strict: bool,
}

/// In-memory implementation of every service trait.
#[derive(Debug, Default)]
pub struct Memory {
    following: Mutex<FxHashMap<User, FxHashSet<User>>>,
    reject_duplicates: bool,
    create_calls: AtomicU64,
    follow_calls: AtomicU64,
    published: AtomicU64,
    posted: AtomicU64,
    delivered: AtomicU64,
}

impl Memory {
    /// Create an empty backend that accepts repeated user creation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty backend that fails a second creation of the same user.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            reject_duplicates: true,
            ..Self::default()
        }
    }

    /// Create an empty backend from `config`.
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        if config.strict {
            Self::strict()
        } else {
            Self::new()
        }
    }

    /// Number of distinct users known to the graph
    #[must_use]
    pub fn users(&self) -> usize {
        self.lock().len()
    }

    /// Number of follow edges recorded
    #[must_use]
    pub fn edges(&self) -> usize {
        self.lock().values().map(FxHashSet::len).sum()
    }

    /// Followers of `user`, sorted by identifier
    #[must_use]
    pub fn followers(&self, user: &User) -> Vec<User> {
        let mut followers: Vec<User> = self
            .lock()
            .get(user)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default();
        followers.sort();
        followers
    }

    /// Calls made to [`UserGraph::create_user`]
    #[must_use]
    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::Relaxed)
    }

    /// Calls made to [`UserGraph::follow`]
    #[must_use]
    pub fn follow_calls(&self) -> u64 {
        self.follow_calls.load(Ordering::Relaxed)
    }

    /// Content items persisted
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Feed posts made
    #[must_use]
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    /// Feed entries delivered to followers across all posts
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<User, FxHashSet<User>>> {
        self.following.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl UserGraph for Memory {
    async fn create_user(&self, user: &User) -> Result<(), Error> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);
        let mut graph = self.lock();
        if graph.contains_key(user) {
            if self.reject_duplicates {
                return Err(Error::Duplicate(user.clone()));
            }
            return Ok(());
        }
        graph.insert(user.clone(), FxHashSet::default());
        Ok(())
    }

    async fn follow(&self, user: &User, follower: &User) -> Result<(), Error> {
        self.follow_calls.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(user.clone())
            .or_default()
            .insert(follower.clone());
        Ok(())
    }

    async fn stop(&self) {
        info!(
            users = self.users(),
            edges = self.edges(),
            create_calls = self.create_calls(),
            follow_calls = self.follow_calls(),
            "Memory graph totals"
        );
    }
}

#[async_trait]
impl ContentStore for Memory {
    async fn publish_content(&self, _user: &User, _content: &Content) -> Result<(), Error> {
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Feed for Memory {
    async fn post(&self, user: &User, _content: &Content) -> Result<(), Error> {
        self.posted.fetch_add(1, Ordering::Relaxed);
        let fan_out = self.lock().get(user).map_or(0, FxHashSet::len);
        self.delivered.fetch_add(fan_out as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) {
        info!(
            published = self.published(),
            posted = self.posted(),
            delivered = self.delivered(),
            "Memory feed totals"
        );
    }
}

#[cfg(test)]
mod test {
    use socialite_payload::{Content, User, Value};

    use super::{Config, Memory};
    use crate::services::{ContentStore, Error, Feed, UserGraph};

    #[tokio::test]
    async fn follow_edges_are_recorded() {
        let memory = Memory::new();
        let alice = User::new("0");
        let bob = User::new("1");
        let carol = User::new("2");

        for user in [&alice, &bob, &carol] {
            memory.create_user(user).await.expect("create");
        }
        memory.follow(&carol, &alice).await.expect("follow");
        memory.follow(&carol, &bob).await.expect("follow");
        // Repeated edges are idempotent.
        memory.follow(&carol, &bob).await.expect("follow");

        assert_eq!(memory.users(), 3);
        assert_eq!(memory.edges(), 2);
        assert_eq!(memory.follow_calls(), 3);
        assert_eq!(memory.followers(&carol), vec![alice, bob]);
    }

    #[tokio::test]
    async fn strict_backend_rejects_duplicate_users() {
        let memory = Memory::strict();
        let user = User::new("7");
        memory.create_user(&user).await.expect("first create");
        let second = memory.create_user(&user).await;
        assert!(matches!(second, Err(Error::Duplicate(u)) if u == user));
        assert_eq!(memory.create_calls(), 2);
    }

    #[tokio::test]
    async fn config_selects_duplicate_handling() {
        let user = User::new("4");
        let lenient = Memory::from_config(Config::default());
        lenient.create_user(&user).await.expect("first create");
        lenient.create_user(&user).await.expect("repeat accepted");
        assert_eq!(lenient.users(), 1);

        let strict = Memory::from_config(Config { strict: true });
        strict.create_user(&user).await.expect("first create");
        assert!(strict.create_user(&user).await.is_err());
    }

    #[tokio::test]
    async fn posts_deliver_to_every_follower() {
        let memory = Memory::new();
        let author = User::new("0");
        memory.create_user(&author).await.expect("create");
        for i in 1..=4 {
            memory
                .follow(&author, &User::new(i.to_string()))
                .await
                .expect("follow");
        }
        let content = Content::new(author.clone(), Value::Text("hello".into()), None);
        memory
            .publish_content(&author, &content)
            .await
            .expect("publish");
        memory.post(&author, &content).await.expect("post");

        assert_eq!(memory.published(), 1);
        assert_eq!(memory.posted(), 1);
        assert_eq!(memory.delivered(), 4);
    }
}
