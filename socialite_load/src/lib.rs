//! The socialite-load synthetic workload tool.
//!
//! This library supports the socialite-load binary found elsewhere in this
//! project. A run builds a synthetic follow graph in the target service and
//! then drives rounds of content publication and feed fan-out against it,
//! all through a worker pool fed by a bounded queue so that neither the
//! target nor this process is buried under unbounded work.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod dispatcher;
pub mod services;
pub mod transform;
pub mod workload;
