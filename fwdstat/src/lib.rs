//! Request, back-pressure and ack statistics for event forwarder logs.
//!
//! This library supports the fwdstat binary found elsewhere in this project.
//! A log is scanned once, every line is classified against a fixed table of
//! known patterns and the resulting [`classify::Tally`] is reduced into a
//! [`report::Report`].

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
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

pub mod classify;
pub mod config;
pub mod report;
pub mod scan;
pub mod stats;
