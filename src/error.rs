//! Error types for neurogrow.

use std::io;

use thiserror::Error;

use crate::device::DeviceError;

/// Errors surfaced by stores, checkpoints, and configuration.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying stream failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stream ran out of tokens in the middle of an entity
    #[error("unexpected end of stream while reading `{field}`")]
    UnexpectedEof {
        /// Field that was being read
        field: &'static str,
    },

    /// Token could not be parsed as the field's type
    #[error("malformed value {token:?} for `{field}`")]
    Malformed {
        /// Field that was being read
        field: &'static str,
        /// Offending token
        token: String,
    },

    /// Slot-level state that parses but breaks a load-time rule
    #[error("slot {slot}: {reason}")]
    InvalidSlot {
        /// Slot (or neuron) index
        slot: usize,
        /// What was wrong
        reason: String,
    },

    /// Host and mirror images disagree on size
    #[error("mirror size mismatch: expected {expected} slots, got {got}")]
    SizeMismatch {
        /// Size of the host image
        expected: usize,
        /// Size recorded by the mirror
        got: usize,
    },

    /// Mirrored synapse pass ran without a queue mirror attached
    #[error("synapse mirror has no queue attached")]
    QueueDetached,

    /// Accelerator memory failure
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration document could not be parsed
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// A name that does not match any variant of an enum parsed from text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {what} {token:?}")]
pub struct UnknownName {
    /// What was being parsed (`"synapse model"`, `"neuron kind"`)
    pub what: &'static str,
    /// Offending token
    pub token: String,
}

impl From<UnknownName> for Error {
    fn from(e: UnknownName) -> Self {
        Error::Malformed { field: e.what, token: e.token }
    }
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, Error>;
