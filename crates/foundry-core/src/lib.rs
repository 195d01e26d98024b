//! Foundry Core
//!
//! Core domain types, the condition expression language, error handling, and
//! the port traits shared by the scheduler, runner, and CLI crates.

pub mod error;
pub mod events;
pub mod expr;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod ports;
pub mod run;
pub mod snapshot;

pub use error::{Error, Result};
pub use ids::*;
