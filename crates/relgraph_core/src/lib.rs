//! # relgraph core
//!
//! Object graph runtime over a relational store.
//!
//! This crate provides:
//! - Identity registry and persistence-state machine per context
//! - Change tracking and commit planning (ordered INSERT/UPDATE/DELETE batches)
//! - Query compilation to parameterized SQL with join reuse
//! - A synchronization channel that republishes commits to peer contexts
//! - The [`Context`] API tying it together

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod commit;
mod config;
mod context;
mod delegate;
mod diff;
mod error;
mod merge;
mod object;
mod pk;
pub mod query;
mod registry;
mod state;

pub use channel::{Channel, PeerListener};
pub use commit::{BatchKind, BatchRow, CommitBatch, CommitPlan, PendingLobs};
pub use config::{ChannelConfig, ContextConfig, DeliveryMode, LobConfig, SqlConfig};
pub use context::{CommitSummary, Context};
pub use delegate::ContextDelegate;
pub use diff::{ChangeSet, EdgeChange, FieldChange, ObjectDiff};
pub use error::{CoreError, CoreResult};
pub use merge::MergeReport;
pub use object::{EntityRef, Fault};
pub use pk::{PkGenerator, SequencePkGenerator};
pub use registry::{Registry, Snapshot};
pub use state::PersistenceState;
