//! The socialite-load payloads
//!
//! This library supports synthetic data generation for the socialite-load
//! project: the follow graph that is loaded into the graph-storage service and
//! the content that is later published and fanned out into feeds. Nothing in
//! here performs IO. Every generator owns its source of randomness so that a
//! fixed seed reproduces a run.

#![deny(clippy::cargo)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod content;
pub mod graph;
pub mod model;

pub use content::Synthesizer;
pub use graph::{GraphMutation, Generator};
pub use model::{Content, Fields, User, Value};

/// Errors related to payload generation
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The power-law exponent must be finite and strictly positive.
    #[error("Fan-out exponent must be finite and greater than zero, got {0}")]
    Exponent(f64),
    /// Content length bounds are inverted.
    #[error("Content minimum length {min} exceeds maximum length {max}")]
    LengthBounds {
        /// Configured minimum length
        min: usize,
        /// Configured maximum length
        max: usize,
    },
}
