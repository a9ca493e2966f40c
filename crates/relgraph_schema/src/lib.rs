//! # relgraph schema
//!
//! Static description of mapped entities: tables, attributes, primary and
//! foreign keys, relationships and their delete rules.
//!
//! A [`Schema`] is built once, validated, and shared read-only by every
//! context and by the query compiler.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod schema;
mod sort;
mod types;

pub use entity::{Attribute, Entity, Join, Relationship};
pub use error::{SchemaError, SchemaResult};
pub use schema::{Schema, SchemaBuilder};
pub use sort::{topological_order, EntitySorter};
pub use types::{ColumnType, DeleteRule};
