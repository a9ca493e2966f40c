//! # relgraph sync protocol
//!
//! Messages exchanged between contexts that share a synchronization
//! channel.
//!
//! A committing context emits one [`GraphDiffEvent`] per successful commit.
//! Peers merge it into their registries; when an incoming change collides
//! with local uncommitted work a [`MergeConflict`] is raised and a
//! [`MergeDecision`] settles it.
//!
//! Events are plain values. In-process channels pass them by reference;
//! bridges to other processes use [`GraphDiffEvent::encode`] and
//! [`GraphDiffEvent::decode`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod event;

pub use conflict::{LocalChange, MergeConflict, MergeDecision, MergePolicy};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{
    ArcChange, ArcOp, ChangeKind, ContextId, GraphDiffEvent, ObjectChange, PROTOCOL_VERSION,
};
