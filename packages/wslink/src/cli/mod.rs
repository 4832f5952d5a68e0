//! CLI support
//!
//! Configuration loading for the `wslink` binary.

pub mod config;
