//! Simulation configuration: plain structs with defaults, loadable from TOML.
//!
//! Every field has a default so a TOML document only needs to name what it
//! overrides. `SimConfig::validate` runs once at setup; nothing here is
//! re-checked in the tick loop.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::Backend;
use crate::synapse::SynapseModel;

/// Structural growth parameters. Fixed for a run, read once at setup.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthParams {
    /// Null firing rate, as a fraction of `max_rate` (zero outgrowth point)
    pub epsilon: f32,
    /// Sensitivity of outgrowth to firing rate
    pub beta: f32,
    /// Outgrowth rate constant (radius units per second)
    pub rho: f32,
    /// Target firing rate in spikes per second
    pub target_rate: f32,
    /// Radius floor, so fast-firing neurons still connect to close neighbours
    pub min_radius: f32,
    /// Starting radius for every neuron
    pub start_radius: f32,
}

impl GrowthParams {
    /// `target_rate / epsilon`
    #[inline]
    pub fn max_rate(&self) -> f32 {
        self.target_rate / self.epsilon
    }

    fn validate(&self) -> Result<()> {
        if !(self.epsilon > 0.0 && self.epsilon <= 1.0) {
            return Err(Error::Config(format!("growth.epsilon must be in (0, 1], got {}", self.epsilon)));
        }
        if self.beta <= 0.0 {
            return Err(Error::Config(format!("growth.beta must be positive, got {}", self.beta)));
        }
        if self.rho < 0.0 {
            return Err(Error::Config(format!("growth.rho must be non-negative, got {}", self.rho)));
        }
        if self.target_rate <= 0.0 {
            return Err(Error::Config(format!("growth.target_rate must be positive, got {}", self.target_rate)));
        }
        if self.min_radius < 0.0 || self.start_radius < self.min_radius {
            return Err(Error::Config(format!(
                "growth radii must satisfy 0 <= min_radius ({}) <= start_radius ({})",
                self.min_radius, self.start_radius
            )));
        }
        Ok(())
    }
}

impl Default for GrowthParams {
    fn default() -> Self {
        Self {
            epsilon: 0.60,
            beta: 0.10,
            rho: 0.0001,
            target_rate: 1.9,
            min_radius: 0.1,
            start_radius: 0.4,
        }
    }
}

impl fmt::Display for GrowthParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epsilon: {} beta: {} rho: {} targetRate: {} maxRate: {} minRadius: {} startRadius: {}",
            self.epsilon,
            self.beta,
            self.rho,
            self.target_rate,
            self.max_rate(),
            self.min_radius,
            self.start_radius
        )
    }
}

/// LIF parameter ranges. Each `[min, max]` pair is sampled uniformly per neuron.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuronParams {
    /// Background injected current (A)
    pub i_inject: [f32; 2],
    /// Noise current amplitude (A)
    pub i_noise: [f32; 2],
    /// Firing threshold (V)
    pub v_thresh: [f32; 2],
    /// Resting potential (V)
    pub v_resting: [f32; 2],
    /// Reset potential after a spike (V)
    pub v_reset: [f32; 2],
    /// Initial membrane potential (V)
    pub v_init: [f32; 2],
    /// Threshold for endogenously active (starter) neurons (V)
    pub starter_v_thresh: [f32; 2],
    /// Reset potential for starter neurons (V)
    pub starter_v_reset: [f32; 2],
    /// Membrane time constant (s)
    pub tau: f32,
    /// Membrane capacitance (F)
    pub cm: f32,
    /// Absolute refractory period (s)
    pub t_refract: f32,
}

impl Default for NeuronParams {
    fn default() -> Self {
        Self {
            i_inject: [13.5e-9, 13.5e-9],
            i_noise: [1.0e-9, 1.5e-9],
            v_thresh: [15.0e-3, 15.0e-3],
            v_resting: [0.0, 0.0],
            v_reset: [13.5e-3, 13.5e-3],
            v_init: [13.0e-3, 13.0e-3],
            starter_v_thresh: [13.565e-3, 13.655e-3],
            starter_v_reset: [13.0e-3, 13.0e-3],
            tau: 3.0e-2,
            cm: 3.0e-8,
            t_refract: 3.0e-3,
        }
    }
}

impl NeuronParams {
    fn validate(&self) -> Result<()> {
        let ranges = [
            ("i_inject", self.i_inject),
            ("i_noise", self.i_noise),
            ("v_thresh", self.v_thresh),
            ("v_resting", self.v_resting),
            ("v_reset", self.v_reset),
            ("v_init", self.v_init),
            ("starter_v_thresh", self.starter_v_thresh),
            ("starter_v_reset", self.starter_v_reset),
        ];
        for (name, [lo, hi]) in ranges {
            if !(lo <= hi) {
                return Err(Error::Config(format!("neurons.{name}: min {lo} exceeds max {hi}")));
            }
        }
        if self.tau <= 0.0 || self.cm <= 0.0 {
            return Err(Error::Config("neurons.tau and neurons.cm must be positive".into()));
        }
        if self.t_refract < 0.0 {
            return Err(Error::Config("neurons.t_refract must be non-negative".into()));
        }
        Ok(())
    }
}

/// Top-level simulation configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Grid width in neurons
    pub width: u32,
    /// Grid height in neurons
    pub height: u32,
    /// Slot capacity per destination neuron
    pub max_synapses_per_neuron: u32,
    /// Tick length (s). Default: 0.1 ms
    pub delta_t: f32,
    /// Growth epoch length (s)
    pub epoch_duration: f32,
    /// Number of epochs `Network::simulate` runs
    pub max_epochs: u32,
    /// Seed for parameter draws, layout, and noise
    pub seed: u64,
    /// Where the per-tick synapse pass runs
    pub backend: Backend,
    /// Which synapse layer set to allocate
    pub synapse_model: SynapseModel,
    /// Fraction of neurons that are excitatory
    pub frac_excitatory: f32,
    /// Fraction of neurons that are endogenously active
    pub frac_starter: f32,
    /// Weight per unit of overlap area
    pub strength_adjustment: f32,
    /// Upper bound on firing rate, sizes the per-neuron spike ring (Hz)
    pub max_firing_rate: f32,
    /// LIF parameter ranges
    pub neurons: NeuronParams,
    /// Structural growth parameters
    pub growth: GrowthParams,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            width: 10,
            height: 10,
            max_synapses_per_neuron: 200,
            delta_t: 1.0e-4,
            epoch_duration: 1.0,
            max_epochs: 10,
            seed: 0x5EED_1E55,
            backend: Backend::Host,
            synapse_model: SynapseModel::Dynamic,
            frac_excitatory: 0.9,
            frac_starter: 0.1,
            strength_adjustment: 1.0e-8,
            max_firing_rate: 200.0,
            neurons: NeuronParams::default(),
            growth: GrowthParams::default(),
        }
    }
}

impl SimConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Total neuron count (`width * height`).
    #[inline]
    pub fn neuron_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Ticks per growth epoch, rounded to nearest.
    #[inline]
    pub fn steps_per_epoch(&self) -> u64 {
        (self.epoch_duration / self.delta_t).round() as u64
    }

    /// Capacity of each neuron's spike-time ring.
    #[inline]
    pub fn spike_history_len(&self) -> usize {
        ((self.max_firing_rate * self.epoch_duration).ceil() as usize).max(1)
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config("width and height must be non-zero".into()));
        }
        if self.max_synapses_per_neuron == 0 {
            return Err(Error::Config("max_synapses_per_neuron must be non-zero".into()));
        }
        if self.delta_t <= 0.0 || self.epoch_duration <= 0.0 {
            return Err(Error::Config("delta_t and epoch_duration must be positive".into()));
        }
        if self.steps_per_epoch() == 0 {
            return Err(Error::Config("epoch_duration is shorter than one tick".into()));
        }
        for (name, v) in [("frac_excitatory", self.frac_excitatory), ("frac_starter", self.frac_starter)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::Config(format!("{name} must be in [0, 1], got {v}")));
            }
        }
        if self.strength_adjustment <= 0.0 {
            return Err(Error::Config("strength_adjustment must be positive".into()));
        }
        if self.max_firing_rate <= 0.0 {
            return Err(Error::Config("max_firing_rate must be positive".into()));
        }
        self.neurons.validate()?;
        self.growth.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SimConfig::default();
        config.validate().expect("default config should validate");
        assert_eq!(config.neuron_count(), 100);
        assert_eq!(config.steps_per_epoch(), 10_000);
    }

    #[test]
    fn max_rate_is_target_over_epsilon() {
        let g = GrowthParams::default();
        assert!((g.max_rate() - 1.9 / 0.6).abs() < 1e-6);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config = SimConfig::from_toml_str(
            r#"
            width = 4
            height = 3
            backend = "mirrored"
            synapse_model = "spiking"

            [growth]
            target_rate = 2.5
            "#,
        )
        .expect("parse");
        assert_eq!(config.neuron_count(), 12);
        assert_eq!(config.backend, Backend::Mirrored);
        assert_eq!(config.synapse_model, SynapseModel::Spiking);
        assert_eq!(config.growth.target_rate, 2.5);
        assert_eq!(config.growth.epsilon, GrowthParams::default().epsilon);
    }

    #[test]
    fn toml_round_trip() {
        let config = SimConfig::default();
        let text = toml::to_string(&config).expect("serialize");
        let back = SimConfig::from_toml_str(&text).expect("parse");
        assert_eq!(back, config);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = SimConfig::default();
        config.growth.epsilon = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = SimConfig::default();
        config.neurons.v_thresh = [0.02, 0.01];
        assert!(config.validate().is_err());

        let mut config = SimConfig::default();
        config.epoch_duration = 1.0e-6;
        assert!(config.validate().is_err());

        assert!(SimConfig::from_toml_str("width = 0").is_err());
        assert!(matches!(SimConfig::from_toml_str("width = \"ten\""), Err(Error::ConfigParse(_))));
    }

    #[test]
    fn growth_params_display_lists_every_field() {
        let text = GrowthParams::default().to_string();
        for key in ["epsilon", "beta", "rho", "targetRate", "maxRate", "minRadius", "startRadius"] {
            assert!(text.contains(key), "missing {key} in {text}");
        }
    }
}
