//! Harbormaster: a single-host container fleet controller.
//!
//! Reads a desired-state document, then keeps the host's containers matching
//! it: worker sets are scaled to their instance count, data sets are promoted
//! one generation per image change, and terminated or expired containers are
//! garbage-collected. The runtime's container labels are the only state.

pub mod cli;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod gc;
pub mod hooks;
pub mod idle;
pub mod plugins;
pub mod reconciler;
pub mod runtime;
pub mod scheduler;
pub mod testing;
