//! Synthetic follow graph generation.
//!
//! The [`Generator`] produces one [`GraphMutation`] per call: a brand new user
//! and the set of already generated users it is attached to. The number of
//! edges per user is drawn from a discrete power-law over `[0, max_follows]`,
//! so most users get very few edges and a small number get many. Edge targets
//! are drawn uniformly, either from every user generated so far or from a
//! bounded window of the most recent ones.
//!
//! Nothing is precomputed. The generator holds only its counters and its
//! sampler, the graph itself lives in whatever service consumes the
//! mutations.

use std::num::NonZeroUsize;

use rand::{Rng, distr::Distribution, seq::index};
use rand_distr::Zipf;
use serde::{Deserialize, Serialize};

use crate::{Error, model::User};

fn default_exponent() -> f64 {
    1.5
}

/// Configuration for [`Generator`]
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Exponent `s` of the fan-out distribution, `P(k) ∝ (k + 1)^-s`. Larger
    /// values concentrate more mass on small fan-outs.
    #[serde(default = "default_exponent")]
    pub exponent: f64,
    /// How edge targets are chosen among existing users
    #[serde(default)]
    pub selection: Selection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exponent: default_exponent(),
            selection: Selection::default(),
        }
    }
}

/// Policy for choosing edge targets among previously generated users
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Selection {
    /// Uniformly among every user generated so far
    #[default]
    Uniform,
    /// Uniformly among the most recent `window` users
    Recent {
        /// Number of most recently generated users eligible as targets
        window: NonZeroUsize,
    },
}

/// Discrete power-law over `[0, max]`.
///
/// Weights are `(k + 1)^-s`, a Zipf distribution over `[1, max + 1]` shifted
/// down by one. Memory use does not depend on `max`. With the default exponent
/// and `max = 100` the mean draw sits around 7.
#[derive(Debug, Clone)]
pub struct FanOut {
    zipf: Zipf<f64>,
    max: usize,
}

impl FanOut {
    /// Create a new [`FanOut`] distribution
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exponent`] if `exponent` is not finite and positive.
    pub fn new(max: usize, exponent: f64) -> Result<Self, Error> {
        if !exponent.is_finite() || exponent <= 0.0 {
            return Err(Error::Exponent(exponent));
        }
        let zipf =
            Zipf::new(max as f64 + 1.0, exponent).map_err(|_| Error::Exponent(exponent))?;
        Ok(Self { zipf, max })
    }
}

impl Distribution<usize> for FanOut {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let rank = self.zipf.sample(rng);
        (rank as usize).saturating_sub(1).min(self.max)
    }
}

/// A new user and the existing users attached to it.
///
/// Produced once per generated user and consumed by exactly one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphMutation {
    user: User,
    followers: Vec<User>,
}

impl GraphMutation {
    /// The newly generated user
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// The existing users to attach to [`GraphMutation::user`], distinct and
    /// never including the new user itself
    #[must_use]
    pub fn followers(&self) -> &[User] {
        &self.followers
    }

    /// Decompose into the new user and its followers.
    #[must_use]
    pub fn into_parts(self) -> (User, Vec<User>) {
        (self.user, self.followers)
    }
}

/// Lazy, unbounded source of [`GraphMutation`] instances.
#[derive(Debug)]
pub struct Generator<R> {
    rng: R,
    fan_out: FanOut,
    selection: Selection,
    generated: usize,
}

impl<R> Generator<R>
where
    R: Rng,
{
    /// Create a new [`Generator`] bounded to `max_follows` edges per user
    ///
    /// # Errors
    ///
    /// Function will error if the fan-out distribution cannot be built from
    /// `config`.
    pub fn new(rng: R, max_follows: usize, config: &Config) -> Result<Self, Error> {
        Ok(Self {
            rng,
            fan_out: FanOut::new(max_follows, config.exponent)?,
            selection: config.selection,
            generated: 0,
        })
    }

    /// The number of users generated so far
    #[must_use]
    pub fn generated(&self) -> usize {
        self.generated
    }

    /// Generate the next [`GraphMutation`].
    ///
    /// Users are identified by their generation index. When fewer eligible
    /// users exist than the drawn fan-out the follower set is clamped to what
    /// is available.
    pub fn generate(&mut self) -> GraphMutation {
        let id = self.generated;
        self.generated += 1;

        let start = match self.selection {
            Selection::Uniform => 0,
            Selection::Recent { window } => id.saturating_sub(window.get()),
        };
        let eligible = id - start;
        let amount = self.fan_out.sample(&mut self.rng).min(eligible);

        let followers = index::sample(&mut self.rng, eligible, amount)
            .into_iter()
            .map(|offset| User::new((start + offset).to_string()))
            .collect();

        GraphMutation {
            user: User::new(id.to_string()),
            followers,
        }
    }
}

impl<R> Iterator for Generator<R>
where
    R: Rng,
{
    type Item = GraphMutation;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.generate())
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, num::NonZeroUsize};

    use proptest::prelude::*;
    use rand::{SeedableRng, distr::Distribution, rngs::SmallRng};

    use super::{Config, FanOut, Generator, Selection};
    use crate::Error;

    fn follower_ids(mutation: &super::GraphMutation) -> Vec<usize> {
        mutation
            .followers()
            .iter()
            .map(|u| u.id().parse::<usize>().expect("generated ids are numeric"))
            .collect()
    }

    // Every follower set is bounded, duplicate free and never names the new
    // user.
    proptest! {
        #[test]
        fn followers_bounded_distinct_and_not_self(seed: u64, max_follows in 0usize..64, users in 1usize..200) {
            let rng = SmallRng::seed_from_u64(seed);
            let mut generator = Generator::new(rng, max_follows, &Config::default())?;

            for _ in 0..users {
                let mutation = generator.generate();
                let ids = follower_ids(&mutation);
                prop_assert!(ids.len() <= max_follows);

                let unique: HashSet<usize> = ids.iter().copied().collect();
                prop_assert_eq!(unique.len(), ids.len());

                let own: usize = mutation.user().id().parse().expect("numeric id");
                prop_assert!(ids.iter().all(|id| *id < own));
            }
        }
    }

    // A recency window restricts targets to the last `window` users.
    proptest! {
        #[test]
        fn recent_selection_stays_in_window(seed: u64, max_follows in 0usize..32, window in 1usize..16) {
            let rng = SmallRng::seed_from_u64(seed);
            let config = Config {
                selection: Selection::Recent { window: NonZeroUsize::new(window).expect("non-zero") },
                ..Config::default()
            };
            let mut generator = Generator::new(rng, max_follows, &config)?;

            for own in 0..100usize {
                let mutation = generator.generate();
                for id in follower_ids(&mutation) {
                    prop_assert!(id < own);
                    prop_assert!(own - id <= window);
                }
            }
        }
    }

    // The same seed yields the same sequence of follower set sizes.
    proptest! {
        #[test]
        fn fixed_seed_is_reproducible(seed: u64, max_follows in 0usize..50) {
            let sizes = |seed: u64| -> Result<Vec<usize>, Error> {
                let generator = Generator::new(SmallRng::seed_from_u64(seed), max_follows, &Config::default())?;
                Ok(generator.take(100).map(|m| m.followers().len()).collect())
            };
            prop_assert_eq!(sizes(seed)?, sizes(seed)?);
        }
    }

    #[test]
    fn zero_max_follows_generates_isolated_users() {
        let rng = SmallRng::seed_from_u64(7);
        let generator = Generator::new(rng, 0, &Config::default()).expect("valid config");
        for mutation in generator.take(50) {
            assert!(mutation.followers().is_empty());
        }
    }

    #[test]
    fn first_user_has_nobody_to_follow() {
        let rng = SmallRng::seed_from_u64(11);
        let mut generator = Generator::new(rng, 1_000, &Config::default()).expect("valid config");
        let first = generator.generate();
        assert_eq!(first.user().id(), "0");
        assert!(first.followers().is_empty());
        assert_eq!(generator.generated(), 1);
    }

    #[test]
    fn identifiers_are_sequential() {
        let rng = SmallRng::seed_from_u64(3);
        let generator = Generator::new(rng, 5, &Config::default()).expect("valid config");
        let ids: Vec<String> = generator
            .take(4)
            .map(|m| m.user().id().to_string())
            .collect();
        assert_eq!(ids, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn fan_out_mean_is_small_relative_to_max() {
        let mut rng = SmallRng::seed_from_u64(42);
        let fan_out = FanOut::new(100, 1.5).expect("valid exponent");
        let draws = 5_000;
        let total: usize = (0..draws).map(|_| fan_out.sample(&mut rng)).sum();
        let mean = total as f64 / f64::from(draws);
        assert!(mean < 25.0, "mean fan-out {mean} too large");
    }

    #[test]
    fn huge_max_follows_needs_no_table() {
        let mut rng = SmallRng::seed_from_u64(9);
        let max = 100_000_000;
        let fan_out = FanOut::new(max, 1.5).expect("valid exponent");
        assert!(std::mem::size_of_val(&fan_out) <= 64);
        for _ in 0..1_000 {
            assert!(fan_out.sample(&mut rng) <= max);
        }
    }

    #[test]
    fn invalid_exponent_rejected() {
        for exponent in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(FanOut::new(10, exponent), Err(Error::Exponent(_))));
        }
    }
}
