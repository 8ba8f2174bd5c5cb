//! Domain models for archived envelopes

mod envelope;
mod topic;

pub use envelope::{
    DEFAULT_MAX_ENVELOPE_SIZE, ENVELOPE_HEADER_LENGTH, Envelope, EnvelopeBuilder, EnvelopeCodec,
};
pub use topic::{EnvelopeHash, Topic};
