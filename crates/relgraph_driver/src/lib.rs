//! # relgraph driver
//!
//! The synchronous request/response contract between the persistence
//! runtime and an external transactional relational store.
//!
//! relgraph owns SQL generation and object bookkeeping; a [`Driver`] only
//! executes statements, controls transactions and streams large objects.
//!
//! ## Drivers
//!
//! - [`MemoryDriver`] - records statements and replays scripted results

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
mod memory;

pub use driver::{Driver, ExecuteResult, LobHandle, LobLocator, Row};
pub use error::{DriverError, DriverResult};
pub use memory::{LobWrite, MemoryDriver, Statement};
