//! Network inspection and diagnostics.

use crate::network::{Backend, Network};
use crate::neuron::NeuronKind;
use crate::synapse::SynapseType;

/// Occupied synapses per pre/post type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TypeDistribution {
    pub ii: usize,
    pub ie: usize,
    pub ei: usize,
    pub ee: usize,
}

impl TypeDistribution {
    pub fn total(&self) -> usize {
        self.ii + self.ie + self.ei + self.ee
    }
}

impl std::fmt::Display for TypeDistribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "II={} IE={} EI={} EE={}", self.ii, self.ie, self.ei, self.ee)
    }
}

/// Summary statistics for a network.
#[derive(Clone, Debug)]
pub struct NetworkStats {
    pub n_neurons: usize,
    pub n_excitatory: usize,
    pub n_inhibitory: usize,
    pub n_starters: usize,
    pub n_synapses: usize,
    pub max_synapses_per_neuron: usize,
    pub types: TypeDistribution,
    pub tick: u64,
    pub epoch: u32,
    pub backend: Backend,
    pub mean_radius: f32,
    pub mean_rate: f32,
    pub mean_weight_magnitude: f32,
    /// Fraction of destination slots in use
    pub occupancy: f32,
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Network: {} neurons ({}E/{}I, {} starters), {} synapses ({:.1}% of slots)",
            self.n_neurons,
            self.n_excitatory,
            self.n_inhibitory,
            self.n_starters,
            self.n_synapses,
            self.occupancy * 100.0
        )?;
        writeln!(f, "  Tick: {}, Epoch: {}, Backend: {:?}", self.tick, self.epoch, self.backend)?;
        writeln!(f, "  Types: {}", self.types)?;
        write!(
            f,
            "  Mean radius: {:.4}, Mean rate: {:.3} Hz, Mean |weight|: {:.3e}",
            self.mean_radius, self.mean_rate, self.mean_weight_magnitude
        )
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

impl Network {
    /// Summary of the host image. Call after an epoch boundary for current
    /// per-tick state when running mirrored.
    pub fn stats(&self) -> NetworkStats {
        let neurons = self.neurons();
        let synapses = self.synapses();
        let growth = self.growth().state();

        let n_inhibitory = neurons.kind.iter().filter(|k| **k == NeuronKind::Inhibitory).count();
        let mut types = TypeDistribution::default();
        let mut weight_sum = 0.0f32;
        for slot in 0..synapses.capacity() {
            if synapses.is_free(slot) {
                continue;
            }
            weight_sum += synapses.base.weight[slot].abs();
            match synapses.base.ty[slot] {
                SynapseType::II => types.ii += 1,
                SynapseType::IE => types.ie += 1,
                SynapseType::EI => types.ei += 1,
                SynapseType::EE => types.ee += 1,
                SynapseType::None => {}
            }
        }
        let n_synapses = types.total();
        let capacity = synapses.capacity();

        NetworkStats {
            n_neurons: neurons.len(),
            n_excitatory: neurons.len() - n_inhibitory,
            n_inhibitory,
            n_starters: neurons.starter.iter().filter(|s| **s).count(),
            n_synapses,
            max_synapses_per_neuron: synapses.max_per_neuron(),
            types,
            tick: self.tick(),
            epoch: self.epoch(),
            backend: self.backend(),
            mean_radius: mean(&growth.radii),
            mean_rate: mean(&growth.rates),
            mean_weight_magnitude: if n_synapses > 0 { weight_sum / n_synapses as f32 } else { 0.0 },
            occupancy: if capacity > 0 { n_synapses as f32 / capacity as f32 } else { 0.0 },
        }
    }
}
