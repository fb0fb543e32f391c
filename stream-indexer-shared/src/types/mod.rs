//! This module defines the core data structures shared across the stream indexer.
//! It re-exports `StreamPosition`, `Mutation` and `IndexMessage`.

pub mod index_message;
pub mod mutation;
pub mod position;

pub use index_message::{IndexMessage, MessageOperation};
pub use mutation::{Mutation, MutationKind};
pub use position::StreamPosition;
