//! Random content synthesis.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    model::{Content, Fields, User, Value},
};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

fn default_min_length() -> usize {
    10
}

fn default_max_length() -> usize {
    140
}

/// Configuration for [`Synthesizer`]
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Minimum generated text length, inclusive
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    /// Maximum generated text length, inclusive
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Number of structured fields to attach to each content item. Zero
    /// attaches none.
    #[serde(default)]
    pub field_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            max_length: default_max_length(),
            field_count: 0,
        }
    }
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Validation will fail if `min_length` exceeds `max_length`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_length > self.max_length {
            return Err(Error::LengthBounds {
                min: self.min_length,
                max: self.max_length,
            });
        }
        Ok(())
    }
}

/// Produces lowercase alphabetic text with uniformly distributed length.
#[derive(Debug)]
pub struct Synthesizer<R> {
    rng: R,
    config: Config,
}

impl<R> Synthesizer<R>
where
    R: Rng,
{
    /// Create a new [`Synthesizer`]
    ///
    /// # Errors
    ///
    /// Function will error if `config` does not validate.
    pub fn new(rng: R, config: &Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            rng,
            config: *config,
        })
    }

    /// Generate a text of length within `[min_length, max_length]`.
    pub fn generate(&mut self) -> String {
        let length = self
            .rng
            .random_range(self.config.min_length..=self.config.max_length);
        (0..length)
            .map(|_| char::from(ALPHABET[self.rng.random_range(0..ALPHABET.len())]))
            .collect()
    }

    /// Generate `field_count` named text fields, or `None` when no fields are
    /// configured.
    pub fn fields(&mut self) -> Option<Fields> {
        if self.config.field_count == 0 {
            return None;
        }
        let fields = (0..self.config.field_count)
            .map(|i| (format!("field{i}"), Value::Text(self.generate())))
            .collect();
        Some(fields)
    }

    /// Generate a complete [`Content`] authored by `author`.
    pub fn content(&mut self, author: User) -> Content {
        let body = Value::Text(self.generate());
        let fields = self.fields();
        Content::new(author, body, fields)
    }
}
