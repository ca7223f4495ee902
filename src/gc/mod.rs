//! Garbage collection.
//!
//! Two independent sweeps share this module:
//!
//! - [`CadaverSweeper`] removes terminated managed containers, keeping the
//!   newest generation of every data set and any data container whose volumes
//!   a running container still mounts, then clears dangling images and volumes.
//! - [`AgeSweeper`] retires running workers past `maxAge`, a few at a time.

mod age;
mod sweeper;

pub use age::{AgeReport, AgeSweeper};
pub use sweeper::{CadaverSweeper, SweepReport};
