//! # bluelog-daemon
//!
//! Process plumbing around `bluelog-core`: argument parsing, logging setup,
//! signal handling and the sources that produce sightings.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod cli;
pub mod logging;
pub mod signal;
pub mod source;
