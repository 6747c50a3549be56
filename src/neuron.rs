//! Neuron data structures: SoA (Structure of Arrays) layout for the tick loop.
//!
//! Each neuron field is a separate contiguous array indexed by neuron id.
//! Dynamics are leaky integrate-and-fire with exponential Euler integration:
//!
//! ```text
//! vm ← c1·vm + c2·(summation + i0 + noise·i_noise)
//! c1 = exp(−Δt/τ),  c2 = Rm·(1 − c1),  i0 = i_inject + v_rest/Rm,  Rm = τ/Cm
//! ```
//!
//! The threshold test runs on the potential carried in from the previous
//! tick, and a neuron in its refractory period neither integrates nor fires.
//! The summation slot is cleared after every update.

use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::NeuronParams;
use crate::error::UnknownName;

/// Excitatory or inhibitory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NeuronKind {
    #[default]
    Excitatory,
    Inhibitory,
}

impl NeuronKind {
    #[inline]
    pub fn is_inhibitory(self) -> bool {
        self == Self::Inhibitory
    }
}

impl fmt::Display for NeuronKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Excitatory => "E",
            Self::Inhibitory => "I",
        })
    }
}

impl FromStr for NeuronKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "E" => Ok(Self::Excitatory),
            "I" => Ok(Self::Inhibitory),
            _ => Err(UnknownName { what: "neuron kind", token: s.to_string() }),
        }
    }
}

/// Randomly place `round(n · (1 − frac_excitatory))` inhibitory neurons.
pub fn generate_kind_map(n: usize, frac_excitatory: f32, rng: &mut impl Rng) -> Vec<NeuronKind> {
    let n_inh = ((n as f32) * (1.0 - frac_excitatory)).round() as usize;
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);
    let mut kinds = vec![NeuronKind::Excitatory; n];
    for &i in order.iter().take(n_inh.min(n)) {
        kinds[i] = NeuronKind::Inhibitory;
    }
    kinds
}

/// Pick `round(n · frac_starter)` endogenously active neurons among the
/// excitatory ones.
pub fn generate_starter_map(kinds: &[NeuronKind], frac_starter: f32, rng: &mut impl Rng) -> Vec<bool> {
    let wanted = ((kinds.len() as f32) * frac_starter).round() as usize;
    let mut candidates: Vec<usize> = (0..kinds.len())
        .filter(|&i| !kinds[i].is_inhibitory())
        .collect();
    candidates.shuffle(rng);
    let mut starters = vec![false; kinds.len()];
    for &i in candidates.iter().take(wanted) {
        starters[i] = true;
    }
    starters
}

/// Standard normal draw (Box–Muller).
fn norm_rand(rng: &mut impl Rng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

#[inline]
fn sample(range: [f32; 2], rng: &mut impl Rng) -> f32 {
    if range[0] < range[1] {
        rng.gen_range(range[0]..range[1])
    } else {
        range[0]
    }
}

/// SoA neuron storage. For N neurons each per-neuron `Vec` has N elements;
/// `spike_history` has `N * history_len`.
#[derive(Clone, Debug, Default)]
pub struct NeuronArrays {
    pub kind: Vec<NeuronKind>,
    /// Endogenously active neuron (lowered threshold)
    pub starter: Vec<bool>,
    /// Membrane potential (V)
    pub vm: Vec<f32>,
    pub v_thresh: Vec<f32>,
    pub v_rest: Vec<f32>,
    pub v_reset: Vec<f32>,
    pub v_init: Vec<f32>,
    /// Background current (A)
    pub i_inject: Vec<f32>,
    /// Noise amplitude (A)
    pub i_noise: Vec<f32>,
    /// Membrane time constant (s)
    pub tau: Vec<f32>,
    /// Membrane capacitance (F)
    pub cm: Vec<f32>,
    /// Refractory period (s)
    pub t_refract: Vec<f32>,
    /// Refractory ticks remaining
    pub refract_remaining: Vec<u32>,
    pub c1: Vec<f32>,
    pub c2: Vec<f32>,
    pub i0: Vec<f32>,
    /// Post-synaptic responses summed here by the synapse pass, consumed and
    /// zeroed by the neuron pass every tick.
    pub summation: Vec<f32>,
    /// Spikes since the last epoch boundary
    pub spike_count: Vec<u32>,
    /// Did this neuron spike this tick?
    pub spike_out: Vec<bool>,
    /// Spike ticks, ring of `history_len` per neuron
    pub spike_history: Vec<u64>,
    history_len: usize,
    delta_t: f32,
}

impl NeuronArrays {
    /// Empty store; call `setup` before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate zero-filled arrays for `n` neurons.
    pub fn setup(&mut self, n: usize, history_len: usize, delta_t: f32) {
        if !self.is_empty() {
            log::debug!("[NEURON] setup on a live store ({} neurons), cleaning up first", self.len());
            self.cleanup();
        }
        let history_len = history_len.max(1);
        self.kind = vec![NeuronKind::Excitatory; n];
        self.starter = vec![false; n];
        self.vm = vec![0.0; n];
        self.v_thresh = vec![0.0; n];
        self.v_rest = vec![0.0; n];
        self.v_reset = vec![0.0; n];
        self.v_init = vec![0.0; n];
        self.i_inject = vec![0.0; n];
        self.i_noise = vec![0.0; n];
        self.tau = vec![0.0; n];
        self.cm = vec![0.0; n];
        self.t_refract = vec![0.0; n];
        self.refract_remaining = vec![0; n];
        self.c1 = vec![0.0; n];
        self.c2 = vec![0.0; n];
        self.i0 = vec![0.0; n];
        self.summation = vec![0.0; n];
        self.spike_count = vec![0; n];
        self.spike_out = vec![false; n];
        self.spike_history = vec![0; n * history_len];
        self.history_len = history_len;
        self.delta_t = delta_t;
    }

    /// Release every array. Safe on an already-clean store.
    pub fn cleanup(&mut self) {
        let delta_t = self.delta_t;
        *self = Self::default();
        self.delta_t = delta_t;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vm.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vm.is_empty()
    }

    /// Tick length the integration constants were derived for.
    #[inline]
    pub fn delta_t(&self) -> f32 {
        self.delta_t
    }

    /// Capacity of each neuron's spike ring.
    #[inline]
    pub fn history_len(&self) -> usize {
        self.history_len
    }

    /// Draw every neuron's parameters from `params`.
    ///
    /// Starter neurons take their threshold and reset from the starter ranges.
    pub fn populate(&mut self, params: &NeuronParams, kinds: &[NeuronKind], starters: &[bool], rng: &mut impl Rng) {
        for i in 0..self.len() {
            self.kind[i] = kinds[i];
            self.starter[i] = starters[i];
            self.i_inject[i] = sample(params.i_inject, rng);
            self.i_noise[i] = sample(params.i_noise, rng);
            self.v_rest[i] = sample(params.v_resting, rng);
            self.v_init[i] = sample(params.v_init, rng);
            if starters[i] {
                self.v_thresh[i] = sample(params.starter_v_thresh, rng);
                self.v_reset[i] = sample(params.starter_v_reset, rng);
            } else {
                self.v_thresh[i] = sample(params.v_thresh, rng);
                self.v_reset[i] = sample(params.v_reset, rng);
            }
            self.tau[i] = params.tau;
            self.cm[i] = params.cm;
            self.t_refract[i] = params.t_refract;
            self.vm[i] = self.v_init[i];
            self.refract_remaining[i] = 0;
            self.init_constants(i);
        }
    }

    /// Recompute `c1, c2, i0` for neuron `i` from its parameters.
    pub fn init_constants(&mut self, i: usize) {
        let rm = self.tau[i] / self.cm[i];
        let c1 = (-self.delta_t / self.tau[i]).exp();
        self.c1[i] = c1;
        self.c2[i] = rm * (1.0 - c1);
        self.i0[i] = self.i_inject[i] + self.v_rest[i] / rm;
    }

    /// Advance every neuron one tick. Returns the number that fired.
    pub fn advance(&mut self, tick: u64, rng: &mut impl Rng) -> u32 {
        let mut fired = 0u32;
        for i in 0..self.len() {
            self.spike_out[i] = false;
            if self.refract_remaining[i] > 0 {
                self.refract_remaining[i] -= 1;
            } else if self.vm[i] >= self.v_thresh[i] {
                self.fire(i, tick);
                fired += 1;
            } else {
                let noise = norm_rand(rng) * self.i_noise[i];
                let input = self.summation[i] + self.i0[i] + noise;
                self.vm[i] = self.c1[i] * self.vm[i] + self.c2[i] * input;
            }
            self.summation[i] = 0.0;
        }
        fired
    }

    fn fire(&mut self, i: usize, tick: u64) {
        self.spike_out[i] = true;
        let pos = self.spike_count[i] as usize % self.history_len;
        self.spike_history[i * self.history_len + pos] = tick;
        self.spike_count[i] = self.spike_count[i].saturating_add(1);
        self.vm[i] = self.v_reset[i];
        self.refract_remaining[i] = (self.t_refract[i] / self.delta_t + 0.5) as u32;
    }

    /// Spike ticks recorded for neuron `i` this epoch, oldest first. When
    /// the ring overflowed only the most recent `history_len` are kept.
    pub fn epoch_spikes(&self, i: usize) -> Vec<u64> {
        let count = self.spike_count[i] as usize;
        let ring = &self.spike_history[i * self.history_len..(i + 1) * self.history_len];
        if count <= self.history_len {
            ring[..count].to_vec()
        } else {
            let head = count % self.history_len;
            ring[head..].iter().chain(&ring[..head]).copied().collect()
        }
    }

    /// Zero every spike counter (epoch boundary).
    pub fn reset_spike_counts(&mut self) {
        self.spike_count.iter_mut().for_each(|c| *c = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn quiet_params() -> NeuronParams {
        NeuronParams {
            i_noise: [0.0, 0.0],
            ..NeuronParams::default()
        }
    }

    fn store(n: usize) -> NeuronArrays {
        let mut arr = NeuronArrays::new();
        arr.setup(n, 8, 1.0e-4);
        let kinds = vec![NeuronKind::Excitatory; n];
        let starters = vec![false; n];
        arr.populate(&quiet_params(), &kinds, &starters, &mut ChaCha8Rng::seed_from_u64(1));
        arr
    }

    #[test]
    fn setup_and_cleanup() {
        let mut arr = store(5);
        assert_eq!(arr.len(), 5);
        assert_eq!(arr.spike_history.len(), 40);
        arr.setup(3, 4, 1.0e-4);
        assert_eq!(arr.len(), 3);
        assert!(arr.vm.iter().all(|&v| v == 0.0), "re-setup zero-fills");
        arr.cleanup();
        assert!(arr.is_empty());
        arr.cleanup();
        assert!(arr.is_empty());
    }

    #[test]
    fn kind_names_parse_and_report_unknowns() {
        assert_eq!("I".parse::<NeuronKind>(), Ok(NeuronKind::Inhibitory));
        assert_eq!(NeuronKind::Excitatory.to_string().parse::<NeuronKind>(), Ok(NeuronKind::Excitatory));
        let err = "X".parse::<NeuronKind>().unwrap_err();
        assert_eq!(err, UnknownName { what: "neuron kind", token: "X".into() });
        assert!(matches!(
            crate::error::Error::from(err),
            crate::error::Error::Malformed { field: "neuron kind", .. }
        ));
    }

    #[test]
    fn kind_map_respects_fraction() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let kinds = generate_kind_map(100, 0.8, &mut rng);
        assert_eq!(kinds.iter().filter(|k| k.is_inhibitory()).count(), 20);

        let starters = generate_starter_map(&kinds, 0.1, &mut rng);
        assert_eq!(starters.iter().filter(|&&s| s).count(), 10);
        for i in 0..100 {
            if starters[i] {
                assert_eq!(kinds[i], NeuronKind::Excitatory, "starter {i} must be excitatory");
            }
        }
    }

    #[test]
    fn constant_drive_reaches_threshold_and_resets() {
        let mut arr = store(1);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        // 13.5 nA * 1 MΩ settles at 13.5 mV, below the 15 mV threshold.
        for t in 0..20_000 {
            arr.advance(t, &mut rng);
        }
        assert_eq!(arr.spike_count[0], 0);

        let mut first_spike = None;
        for t in 0..20_000 {
            arr.summation[0] = 5.0e-9;
            if arr.advance(t, &mut rng) > 0 {
                first_spike = Some(t);
                break;
            }
        }
        let t = first_spike.expect("extra drive should cause a spike");
        assert_eq!(arr.vm[0], arr.v_reset[0]);
        assert_eq!(arr.refract_remaining[0], 30);
        assert_eq!(arr.epoch_spikes(0), vec![t]);
    }

    #[test]
    fn refractory_neuron_does_not_integrate() {
        let mut arr = store(1);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        arr.refract_remaining[0] = 2;
        let vm = arr.vm[0];
        arr.summation[0] = 1.0;
        arr.advance(0, &mut rng);
        assert_eq!(arr.vm[0], vm);
        assert_eq!(arr.summation[0], 0.0, "summation cleared even when refractory");
        assert_eq!(arr.refract_remaining[0], 1);
    }

    #[test]
    fn spike_ring_keeps_latest() {
        let mut arr = store(1);
        for t in 0..11u64 {
            arr.fire(0, t * 100);
        }
        assert_eq!(arr.spike_count[0], 11);
        assert_eq!(arr.epoch_spikes(0), vec![300, 400, 500, 600, 700, 800, 900, 1000]);
        arr.reset_spike_counts();
        assert!(arr.epoch_spikes(0).is_empty());
    }

    #[test]
    fn starter_neurons_use_starter_threshold() {
        let mut arr = NeuronArrays::new();
        arr.setup(2, 4, 1.0e-4);
        let params = NeuronParams::default();
        arr.populate(
            &params,
            &[NeuronKind::Excitatory, NeuronKind::Excitatory],
            &[true, false],
            &mut ChaCha8Rng::seed_from_u64(3),
        );
        assert!(arr.v_thresh[0] >= params.starter_v_thresh[0] && arr.v_thresh[0] <= params.starter_v_thresh[1]);
        assert_eq!(arr.v_thresh[1], params.v_thresh[0]);
    }
}
