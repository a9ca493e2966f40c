//! # relgraph Testkit
//!
//! Test utilities for relgraph.
//!
//! This crate provides:
//! - A fixture schema (artists, paintings, galleries, exhibits) with large
//!   objects, a self-referencing relationship and an optimistic locking
//!   column
//! - A channel over a scripted [`MemoryDriver`](relgraph_driver::MemoryDriver)
//!   and helpers to fetch committed objects into a context
//! - Property-based test generators using proptest
//! - Delegates that record peer merges
//!
//! ## Usage
//!
//! ```rust
//! use relgraph_testkit::prelude::*;
//!
//! let store = TestChannel::new();
//! let context = store.context();
//! let artist = store.fetch_artist(&context, 1, "Monet");
//! context.set_field(&artist, "name", "Claude Monet").unwrap();
//! context.commit().unwrap();
//! assert_eq!(store.driver.statements_starting_with("UPDATE ARTIST").len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod recording;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::recording::*;
}

pub use fixtures::*;
pub use generators::*;
pub use recording::*;
