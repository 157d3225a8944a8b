//! The two-phase workload driver.
//!
//! Phase A builds the follow graph: one work item per generated user creates
//! the user and then attaches its followers, in order. Phase B drives
//! messaging: one work item per message round synthesizes a content item for
//! every user, passes it through the transform when enabled and publishes it
//! to the content store and the feed.
//!
//! Both phases submit into a single [`Dispatcher`]. By default messaging items
//! are queued as soon as the graph items are and the two may interleave;
//! `drain_between_phases` waits for every graph item first.
//!
//! ## Metrics
//!
//! `users_created`: Users registered with the graph store
//! `follows_created`: Follow edges recorded
//! `content_published`: Content items persisted
//! `feed_posts`: Content items fanned out
//! `socialite_load.running`: 1 while work is in progress, 0 once drained
//!

use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use metrics::{counter, gauge};
use rand::{
    Rng, SeedableRng,
    rngs::{SmallRng, StdRng},
};
use socialite_payload::{GraphMutation, Generator, Synthesizer, User, content};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    dispatcher::{self, Dispatcher, Handler, Report, Stats},
    services::{self, Services},
    transform::{self, Identity, Transform},
};

/// Errors produced by the workload
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Generation could not be set up.
    #[error(transparent)]
    Payload(#[from] socialite_payload::Error),
    /// A service call failed.
    #[error(transparent)]
    Services(#[from] services::Error),
    /// The content transform failed.
    #[error(transparent)]
    Transform(#[from] transform::Error),
}

/// The phase a work item belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Graph construction
    Graph,
    /// Content publication and feed fan-out
    Messages,
}

impl Kind {
    /// Label used in logs and metrics
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Kind::Graph => "graph",
            Kind::Messages => "messages",
        }
    }
}

/// A unit of work executed by one worker.
#[derive(Debug)]
pub enum WorkItem {
    /// Create a user and attach its followers
    BuildGraph(GraphMutation),
    /// Publish one content item per user
    Publish {
        /// Message round, starting at zero
        round: usize,
        /// Seed for this round's content synthesizer
        seed: u64,
    },
}

impl WorkItem {
    /// The phase this item belongs to
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            WorkItem::BuildGraph(_) => Kind::Graph,
            WorkItem::Publish { .. } => Kind::Messages,
        }
    }
}

/// The shape of a run, as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    /// Number of users to generate
    pub users: usize,
    /// Upper bound on followers per user
    pub max_follows: usize,
    /// Number of message rounds
    pub messages: usize,
    /// Number of workers
    pub threads: NonZeroUsize,
    /// Whether content passes through the transform
    pub csfle: bool,
}

/// Per-phase item outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Items that completed without error
    pub succeeded: u64,
    /// Items that returned an error
    pub failed: u64,
}

/// The result of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Graph construction outcomes
    pub graph: Outcome,
    /// Messaging outcomes
    pub messages: Outcome,
    /// Follow edges recorded
    pub follows: u64,
    /// Dispatcher totals, including items that panicked
    pub report: Report,
}

#[derive(Debug, Default)]
struct Tally {
    graph_succeeded: AtomicU64,
    graph_failed: AtomicU64,
    messages_succeeded: AtomicU64,
    messages_failed: AtomicU64,
    follows: AtomicU64,
}

impl Tally {
    fn record(&self, kind: Kind, success: bool) {
        let counter = match (kind, success) {
            (Kind::Graph, true) => &self.graph_succeeded,
            (Kind::Graph, false) => &self.graph_failed,
            (Kind::Messages, true) => &self.messages_succeeded,
            (Kind::Messages, false) => &self.messages_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn outcome(&self, kind: Kind) -> Outcome {
        let (succeeded, failed) = match kind {
            Kind::Graph => (&self.graph_succeeded, &self.graph_failed),
            Kind::Messages => (&self.messages_succeeded, &self.messages_failed),
        };
        Outcome {
            succeeded: succeeded.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        }
    }
}

struct Executor {
    services: Services,
    transform: Option<Arc<dyn Transform>>,
    users: usize,
    content: content::Config,
    tally: Arc<Tally>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("transform", &self.transform)
            .field("users", &self.users)
            .field("content", &self.content)
            .finish_non_exhaustive()
    }
}

impl Executor {
    async fn build_graph(&self, mutation: GraphMutation) -> Result<(), Error> {
        let (user, followers) = mutation.into_parts();
        self.services.graph.create_user(&user).await?;
        counter!("users_created").increment(1);

        for follower in &followers {
            self.services.graph.follow(&user, follower).await?;
            self.tally.follows.fetch_add(1, Ordering::Relaxed);
            counter!("follows_created").increment(1);
        }
        debug!("Added {} followers for user {}", followers.len(), user);
        Ok(())
    }

    async fn publish(&self, round: usize, seed: u64) -> Result<(), Error> {
        let mut synthesizer = Synthesizer::new(SmallRng::seed_from_u64(seed), &self.content)?;
        for id in 0..self.users {
            let user = User::new(id.to_string());
            let mut content = synthesizer.content(user.clone());
            if let Some(transform) = &self.transform {
                content = transform.transform(content).await?;
            }
            self.services.content.publish_content(&user, &content).await?;
            counter!("content_published").increment(1);
            self.services.feed.post(&user, &content).await?;
            counter!("feed_posts").increment(1);
        }
        debug!("Published message round {round} for {} users", self.users);
        Ok(())
    }
}

#[async_trait]
impl Handler for Executor {
    type Item = WorkItem;
    type Error = Error;

    fn kind(&self, item: &WorkItem) -> &'static str {
        item.kind().label()
    }

    async fn handle(&self, item: WorkItem) -> Result<(), Error> {
        let kind = item.kind();
        let res = match item {
            WorkItem::BuildGraph(mutation) => self.build_graph(mutation).await,
            WorkItem::Publish { round, seed } => self.publish(round, seed).await,
        };
        self.tally.record(kind, res.is_ok());
        res
    }
}

/// Runs a [`Workload`] against a set of [`Services`].
pub struct Driver {
    workload: Workload,
    config: Config,
    services: Services,
    transform: Arc<dyn Transform>,
    stop: CancellationToken,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("workload", &self.workload)
            .field("config", &self.config)
            .field("transform", &self.transform)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Create a new [`Driver`]
    ///
    /// # Errors
    ///
    /// Function will error if the graph or content settings in `config` are
    /// invalid for `workload`.
    pub fn new(workload: Workload, config: &Config, services: Services) -> Result<Self, Error> {
        socialite_payload::graph::FanOut::new(workload.max_follows, config.graph.exponent)?;
        config.content.validate()?;
        Ok(Self {
            workload,
            config: config.clone(),
            services,
            transform: Arc::new(Identity),
            stop: CancellationToken::new(),
        })
    }

    /// Use `transform` on content when the workload enables it.
    #[must_use]
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = transform;
        self
    }

    /// Stop queuing new work once `stop` is cancelled. Work already queued
    /// still runs to completion.
    #[must_use]
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Run both phases to completion.
    ///
    /// # Errors
    ///
    /// Function will error if any service fails its pre-flight check. Once
    /// work begins failures are per item and are reported in the [`Summary`].
    pub async fn run(self) -> Result<Summary, Error> {
        self.services.check().await?;

        let seed = if let Some(seed) = self.config.seed {
            seed
        } else {
            let seed: [u8; 32] = rand::random();
            info!("No seed configured, using {seed:?}");
            seed
        };
        let mut root = StdRng::from_seed(seed);
        let graph_rng = StdRng::from_rng(&mut root);
        let mut seeds = StdRng::from_rng(&mut root);
        let mut generator =
            Generator::new(graph_rng, self.workload.max_follows, &self.config.graph)?;

        let tally = Arc::new(Tally::default());
        let executor = Executor {
            services: self.services.clone(),
            transform: self
                .workload
                .csfle
                .then(|| Arc::clone(&self.transform)),
            users: self.workload.users,
            content: self.config.content,
            tally: Arc::clone(&tally),
        };
        let dispatcher =
            Dispatcher::new(executor, self.workload.threads, self.config.queue_capacity);
        gauge!("socialite_load.running").set(1.0);

        let progress_done = CancellationToken::new();
        let progress = spawn_progress(
            dispatcher.stats(),
            self.config.progress_interval_seconds,
            progress_done.clone(),
        );

        let queued = self.queue(&dispatcher, &mut generator, &mut seeds).await;
        if queued {
            info!("All actions queued, waiting for completion...");
        } else {
            warn!("Queuing halted early, waiting for completion of queued work...");
        }
        let report = dispatcher.shutdown_and_drain().await;

        progress_done.cancel();
        if let Some(handle) = progress {
            if let Err(err) = handle.await {
                warn!("Progress reporter did not shut down cleanly: {err}");
            }
        }
        gauge!("socialite_load.running").set(0.0);
        info!(
            submitted = report.submitted,
            succeeded = report.succeeded,
            failed = report.failed,
            rejected = report.rejected,
            "Done."
        );
        self.services.stop().await;

        Ok(Summary {
            graph: tally.outcome(Kind::Graph),
            messages: tally.outcome(Kind::Messages),
            follows: tally.follows.load(Ordering::Relaxed),
            report,
        })
    }

    /// Queue both phases. Returns false if queuing stopped early.
    async fn queue(
        &self,
        dispatcher: &Dispatcher<Executor>,
        generator: &mut Generator<StdRng>,
        seeds: &mut StdRng,
    ) -> bool {
        let Workload {
            users,
            messages,
            csfle,
            ..
        } = self.workload;

        info!("Queuing user graph actions for {users} users");
        for _ in 0..users {
            let item = WorkItem::BuildGraph(generator.generate());
            if !self.submit(dispatcher, item).await {
                return false;
            }
        }

        if self.config.drain_between_phases {
            info!("Waiting for graph construction to complete");
            tokio::select! {
                biased;
                () = self.stop.cancelled() => {
                    warn!("Stop requested, no further work will be queued");
                    return false;
                }
                () = dispatcher.wait_idle() => {}
            }
        }

        info!("Queuing {messages} messages for {users} users");
        if csfle {
            info!("CSFLE Enabled");
        } else {
            info!("CSFLE Disabled");
        }
        for round in 0..messages {
            let item = WorkItem::Publish {
                round,
                seed: seeds.random(),
            };
            if !self.submit(dispatcher, item).await {
                return false;
            }
        }
        true
    }

    async fn submit(&self, dispatcher: &Dispatcher<Executor>, item: WorkItem) -> bool {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => {
                warn!("Stop requested, no further work will be queued");
                false
            }
            res = dispatcher.submit(item) => match res {
                Ok(()) => true,
                Err(dispatcher::Error::RejectedSubmission) => {
                    warn!("Work item rejected, dispatcher is shutting down");
                    false
                }
            },
        }
    }
}

fn spawn_progress(
    stats: Stats,
    interval_seconds: u64,
    done: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval_seconds == 0 {
        return None;
    }
    let period = Duration::from_secs(interval_seconds);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = done.cancelled() => break,
                _ = ticker.tick() => {
                    let report = stats.snapshot();
                    info!(
                        "Progress: {} queued, {} completed, {} failed, {} in flight",
                        report.submitted,
                        report.completed(),
                        report.failed,
                        report.in_flight(),
                    );
                }
            }
        }
    }))
}
