//! # KeyMinder Architecture
//!
//! KeyMinder keeps credentials and notes in a single tree of nodes, stored in
//! one (optionally password-encrypted) file. This crate is the document
//! engine behind any editor: it owns the tree, its undo history, the change
//! notifications and the persistence of the file. It never draws anything
//! and never talks to a terminal on its own.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Collaborators (editor views, plugins, the CLI binary)    │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ calls / subscribes
//! ┌────────────────────────────▼─────────────────────────────┐
//! │ engine::KeyMinder         file lifecycle, settings,      │
//! │                           encryption, quicklinks         │
//! └──────┬─────────────────────┬──────────────────┬──────────┘
//!        │                     │                  │
//! ┌──────▼───────┐   ┌─────────▼─────────┐  ┌─────▼───────────┐
//! │ store        │   │ format            │  │ file_config     │
//! │  Document    │   │  FormatRegistry   │  │  cipher         │
//! │  undo, events│   │  StorageHandlers  │  │  settings       │
//! └──────────────┘   └───────────────────┘  └─────────────────┘
//! ```
//!
//! ## Ownership
//!
//! Nodes live in an arena inside [`store::Document`] and refer to each other
//! by [`model::NodeId`]. Collaborators hold ids, never references, so a
//! removed node simply stops resolving. Everything the engine needs at start
//! (typed config, global settings, the UI thread) travels in one
//! [`config::EngineContext`] passed explicitly; there are no globals.
//!
//! ## Threading
//!
//! The engine is `Send` and can be moved to any thread. Once a UI thread is
//! registered, every event dispatch must happen on it or it fails with
//! [`error::KeyMinderError::WrongThread`]. Without a UI the engine runs
//! headless on whatever thread owns it.
//!
//! ## Modules
//!
//! - **[`model`]**: node ids, nodes, reserved attribute names and id-free records
//! - **[`store`]**: the node tree and every structural/attribute edit
//! - **[`undo`]**: transactions of inverse operations
//! - **[`events`]**: typed, synchronous publish/subscribe with vetoable events
//! - **[`cipher`]**: password based key derivation and authenticated encryption
//! - **[`file_config`]**: per-file metadata (path, format, cipher, attributes, settings)
//! - **[`format`]**: storage handlers and their registry
//! - **[`settings`]**: string-keyed settings maps
//! - **[`config`]**: engine configuration and context
//! - **[`prompt`]**: password prompt capability
//! - **[`engine`]**: the facade tying it together
//! - **[`error`]**: error types

pub mod cipher;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod file_config;
pub mod format;
pub mod model;
pub mod prompt;
pub mod settings;
pub mod store;
pub mod undo;

pub use config::{EngineConfig, EngineContext};
pub use engine::KeyMinder;
pub use error::{KeyMinderError, Result, StorageFailure};
pub use model::{Direction, Node, NodeId};
pub use store::Document;
