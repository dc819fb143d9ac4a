#![deny(missing_debug_implementations)]

//! # hive_core
//!
//! The dispatch core behind `hived`: a reverse-proxy that fans client
//! inference requests out to a fleet of polling worker connections.
//!
//! This crate holds the protocol plumbing — the framed message codec, the
//! dispatch queue, the worker-session state machine, the monitor sweep, and
//! the intake/admin HTTP surfaces — separated from the `hived` binary's
//! bootstrap so the dispatch core can be exercised without real sockets.

pub mod admin;
pub mod codec;
pub mod config;
pub mod error;
pub mod intake;
pub mod keystore;
pub mod monitor;
pub mod queue;
pub mod task;
pub mod worker;

pub use error::{Error, Result};
