//! # State Store (C2)
//!
//! Durable key/value document persistence with single-writer guarantees.
//! `document` holds the in-memory shape of the persisted JSON file;
//! `store` provides `load`/`save`/`acquire_lock`/`release_lock` and the
//! normalization pass applied on every load.

pub mod document;
pub mod store;

pub use document::StateDocument;
pub use store::{StateLock, StateStore};
