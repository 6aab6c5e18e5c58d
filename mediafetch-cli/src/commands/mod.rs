//! CLI command implementations.

pub mod common;
pub mod config;
pub mod fetch;
pub mod inspect;
pub mod stats;
pub mod sweep;
