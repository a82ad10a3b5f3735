//! # CLI Layer
//!
//! A headless client of the engine, for scripting and quick lookups. It is
//! the only place that knows about arguments, stdout/stderr and exit codes.
//!
//! - `setup`: clap definitions and the version string
//! - `commands`: builds the engine, opens the file, dispatches per command
//! - `render`: tree and attribute output

pub mod commands;
pub mod render;
pub mod setup;
