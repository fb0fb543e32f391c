//! Processor module for the stream indexer.
//!
//! Turns raw stream records into document mutations.

mod json_decoder;

pub use json_decoder::JsonMessageDecoder;

use stream_indexer_shared::Mutation;

use crate::consumer::Record;
use crate::errors::DecodeError;

/// Decodes a raw record into a mutation.
///
/// Decoding must not depend on anything but the record itself.
pub trait Decode: Send + Sync {
    fn decode(&self, record: &Record) -> Result<Mutation, DecodeError>;
}
