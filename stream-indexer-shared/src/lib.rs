//! # Stream Indexer Shared
//!
//! This crate defines the data structures that flow between the stream indexer
//! pipeline and the search index repository: stream positions, decoded
//! document mutations and the wire message they are decoded from.

pub mod types;

pub use types::index_message::{IndexMessage, MessageOperation};
pub use types::mutation::{Mutation, MutationKind};
pub use types::position::StreamPosition;
