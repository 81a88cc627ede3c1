//! The stampede cache load fan-out harness.
//!
//! This library supports the stampede binary found elsewhere in this
//! project. Stampede launches a fleet of external workload processes against
//! a cache server, each at an even share of a target aggregate request rate,
//! and waits for the whole fleet to exit. The workload binary itself is an
//! external collaborator; everything here is orchestration.

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

pub mod cleaner;
pub mod config;
pub mod fleet;
pub mod planner;
