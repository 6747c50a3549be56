//! # neurogrow
//!
//! Spiking network simulator with activity-dependent structural growth.
//!
//! A 2D sheet of leaky integrate-and-fire neurons is wired by overlapping
//! connectivity radii. Every growth epoch each neuron's radius grows or
//! shrinks according to how its firing rate compares to a target, and
//! synapses are created, reweighted, or removed to match the new overlaps.
//!
//! Synapse state lives in a struct-of-arrays store with a fixed number of
//! incoming slots per neuron. The per-tick synapse pass can run on the host
//! or as a batched kernel over a device mirror of the store.

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod geometry;
pub mod growth;
pub mod layout;
pub mod mirror;
pub mod network;
pub mod neuron;
pub mod queue;
pub mod recorder;
pub mod stats;
pub mod synapse;

#[cfg(test)]
mod integration_test;

pub use codec::{CheckpointHeader, EntityStream, TokenReader, TokenWriter};
pub use config::{GrowthParams, NeuronParams, SimConfig};
pub use device::{BufferId, DeviceArena, DeviceError};
pub use error::{Error, Result, UnknownName};
pub use geometry::{overlap_area, PairMatrix};
pub use growth::{AdjacencyDelta, ConnectionsState, EpochSnapshot, GrowthEngine};
pub use layout::{FixedLayout, GridLayout, NeuronLayout};
pub use mirror::SynapseMirror;
pub use network::{Backend, Network};
pub use neuron::{NeuronArrays, NeuronKind};
pub use queue::{QueueMirror, SpikeEventQueue, RING_LENGTH};
pub use recorder::{EpochRecorder, HistoryRecorder, NullRecorder};
pub use stats::{NetworkStats, TypeDistribution};
pub use synapse::{DumpSummary, OutgoingIndex, PlasticityLayer, SynapseModel, SynapseStore, SynapseType};
