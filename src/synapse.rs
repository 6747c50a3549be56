//! Synapse property store: struct-of-arrays slots grouped by destination.
//!
//! Slot `dest * max_per_neuron + k` holds the `k`-th incoming synapse of
//! neuron `dest`. Every per-synapse attribute is its own contiguous array.
//! A free slot is marked by `weight == 0`, and a free slot has every
//! companion field zeroed as well. `diagnostic_dump` reports slots that
//! break that rule.
//!
//! The store is layered: the base layer (weight, response decay, delay) is
//! always present; the plasticity layer is a tagged variant picked at
//! construction, so the tick loop matches on it once per pass rather than
//! per slot.

use std::fmt;
use std::io::{self, Write};
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UnknownName;
use crate::neuron::NeuronKind;
use crate::queue::{SpikeEventQueue, MAX_DELAY};

/// `last_spike` of an occupied slot that has not delivered yet.
pub const NEVER_SPIKED: u64 = u64::MAX;

/// Initial facilitation state of a new dynamic synapse.
pub const DEFAULT_U: f32 = 0.4;

/// Which plasticity layer the store carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynapseModel {
    /// Base layer only: fixed-weight exponential post-synaptic response
    Spiking,
    /// Base layer + short-term depression/facilitation
    #[default]
    Dynamic,
}

impl fmt::Display for SynapseModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Spiking => "spiking",
            Self::Dynamic => "dynamic",
        })
    }
}

impl FromStr for SynapseModel {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spiking" => Ok(Self::Spiking),
            "dynamic" => Ok(Self::Dynamic),
            _ => Err(UnknownName { what: "synapse model", token: s.to_string() }),
        }
    }
}

/// Pre/post neuron kinds of a synapse. `None` marks a free slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SynapseType {
    #[default]
    None = 0,
    /// Inhibitory → inhibitory
    II = 1,
    /// Inhibitory → excitatory
    IE = 2,
    /// Excitatory → inhibitory
    EI = 3,
    /// Excitatory → excitatory
    EE = 4,
}

impl SynapseType {
    pub fn between(pre: NeuronKind, post: NeuronKind) -> Self {
        match (pre, post) {
            (NeuronKind::Inhibitory, NeuronKind::Inhibitory) => Self::II,
            (NeuronKind::Inhibitory, NeuronKind::Excitatory) => Self::IE,
            (NeuronKind::Excitatory, NeuronKind::Inhibitory) => Self::EI,
            (NeuronKind::Excitatory, NeuronKind::Excitatory) => Self::EE,
        }
    }

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::II),
            2 => Some(Self::IE),
            3 => Some(Self::EI),
            4 => Some(Self::EE),
            _ => None,
        }
    }

    /// Weight sign: inhibitory sources hyperpolarize.
    pub fn sign(self) -> f32 {
        match self {
            Self::II | Self::IE => -1.0,
            Self::EI | Self::EE => 1.0,
            Self::None => 0.0,
        }
    }

    /// Post-synaptic response time constant (s).
    pub fn tau(self) -> f32 {
        match self {
            Self::II | Self::IE => 6.0e-3,
            Self::EI | Self::EE => 3.0e-3,
            Self::None => 0.0,
        }
    }

    /// Axonal delay (s).
    pub fn axonal_delay(self) -> f32 {
        match self {
            Self::II | Self::IE | Self::EI => 0.8e-3,
            Self::EE => 1.5e-3,
            Self::None => 0.0,
        }
    }

    /// Short-term plasticity defaults `(U, D, F)`.
    pub fn stp_defaults(self) -> (f32, f32, f32) {
        match self {
            Self::II => (0.32, 0.144, 0.06),
            Self::IE => (0.25, 0.7, 0.02),
            Self::EI => (0.05, 0.125, 1.2),
            Self::EE => (0.5, 1.1, 0.05),
            Self::None => (0.0, 0.0, 0.0),
        }
    }
}

/// Delay in ticks for a delay in seconds, capped to what the ring holds.
pub fn delay_ticks(delay_s: f32, delta_t: f32) -> u32 {
    ((delay_s / delta_t) as u32 + 1).min(MAX_DELAY)
}

/// Always-present per-synapse attributes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BaseLayer {
    pub source: Vec<u32>,
    pub dest: Vec<u32>,
    pub weight: Vec<f32>,
    /// Post-synaptic response
    pub psr: Vec<f32>,
    /// Per-tick PSR decay factor, `exp(−Δt/τ)`
    pub decay: Vec<f32>,
    pub tau: Vec<f32>,
    /// Delivery delay in ticks
    pub total_delay: Vec<u32>,
    pub ty: Vec<SynapseType>,
}

impl BaseLayer {
    fn zeroed(n: usize) -> Self {
        Self {
            source: vec![0; n],
            dest: vec![0; n],
            weight: vec![0.0; n],
            psr: vec![0.0; n],
            decay: vec![0.0; n],
            tau: vec![0.0; n],
            total_delay: vec![0; n],
            ty: vec![SynapseType::None; n],
        }
    }

    fn clear_slot(&mut self, i: usize) {
        self.source[i] = 0;
        self.dest[i] = 0;
        self.weight[i] = 0.0;
        self.psr[i] = 0.0;
        self.decay[i] = 0.0;
        self.tau[i] = 0.0;
        self.total_delay[i] = 0;
        self.ty[i] = SynapseType::None;
    }

    fn companions_zero(&self, i: usize) -> bool {
        self.source[i] == 0
            && self.dest[i] == 0
            && self.psr[i] == 0.0
            && self.decay[i] == 0.0
            && self.tau[i] == 0.0
            && self.total_delay[i] == 0
            && self.ty[i] == SynapseType::None
    }
}

/// Short-term depression/facilitation state.
///
/// Documented ranges, checked when loading a checkpoint:
/// `depression_tau, facilitation_tau ∈ (0, 10)` seconds,
/// `utilization ∈ (1e-5, 1)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DynamicLayer {
    /// Tick of the last delivered spike (`NEVER_SPIKED` before the first)
    pub last_spike: Vec<u64>,
    /// Depression state `r`
    pub r: Vec<f32>,
    /// Facilitation state `u`
    pub u: Vec<f32>,
    /// Depression time constant `D` (s)
    pub depression_tau: Vec<f32>,
    /// Use parameter `U`
    pub utilization: Vec<f32>,
    /// Facilitation time constant `F` (s)
    pub facilitation_tau: Vec<f32>,
}

impl DynamicLayer {
    fn zeroed(n: usize) -> Self {
        Self {
            last_spike: vec![0; n],
            r: vec![0.0; n],
            u: vec![0.0; n],
            depression_tau: vec![0.0; n],
            utilization: vec![0.0; n],
            facilitation_tau: vec![0.0; n],
        }
    }

    fn clear_slot(&mut self, i: usize) {
        self.last_spike[i] = 0;
        self.r[i] = 0.0;
        self.u[i] = 0.0;
        self.depression_tau[i] = 0.0;
        self.utilization[i] = 0.0;
        self.facilitation_tau[i] = 0.0;
    }

    fn companions_zero(&self, i: usize) -> bool {
        self.last_spike[i] == 0
            && self.r[i] == 0.0
            && self.u[i] == 0.0
            && self.depression_tau[i] == 0.0
            && self.utilization[i] == 0.0
            && self.facilitation_tau[i] == 0.0
    }
}

/// Layer-specific attributes, chosen once at setup.
#[derive(Clone, Debug, PartialEq)]
pub enum PlasticityLayer {
    None,
    Dynamic(DynamicLayer),
}

/// Update `r`, `u` for a spike arriving at `tick`, then stamp `last_spike`.
#[inline]
#[allow(clippy::too_many_arguments)]
pub(crate) fn stp_on_spike(
    r: &mut f32,
    u: &mut f32,
    last_spike: &mut u64,
    depression_tau: f32,
    utilization: f32,
    facilitation_tau: f32,
    tick: u64,
    delta_t: f32,
) {
    if *last_spike != NEVER_SPIKED {
        let isi = tick.saturating_sub(*last_spike) as f32 * delta_t;
        *r = 1.0 + (*r * (1.0 - *u) - 1.0) * (-isi / depression_tau).exp();
        *u = utilization + *u * (1.0 - utilization) * (-isi / facilitation_tau).exp();
    }
    *last_spike = tick;
}

/// Outcome of `diagnostic_dump`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DumpSummary {
    /// Slots with nonzero weight
    pub occupied: usize,
    /// Slots breaking the `weight == 0 ⟺ companions == 0` rule
    pub violations: Vec<usize>,
}

impl DumpSummary {
    #[inline]
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Per-synapse state for `neuron_count * max_per_neuron` slots.
#[derive(Clone, Debug)]
pub struct SynapseStore {
    model: SynapseModel,
    neuron_count: usize,
    max_per_neuron: usize,
    pub base: BaseLayer,
    pub layer: PlasticityLayer,
    /// Delivery rings, one per slot
    pub queue: SpikeEventQueue,
    /// Occupied slots per destination neuron
    pub synapse_counts: Vec<u32>,
}

impl SynapseStore {
    /// Unallocated store for the given model.
    pub fn new(model: SynapseModel) -> Self {
        Self {
            model,
            neuron_count: 0,
            max_per_neuron: 0,
            base: BaseLayer::default(),
            layer: Self::empty_layer(model),
            queue: SpikeEventQueue::default(),
            synapse_counts: Vec::new(),
        }
    }

    fn empty_layer(model: SynapseModel) -> PlasticityLayer {
        match model {
            SynapseModel::Spiking => PlasticityLayer::None,
            SynapseModel::Dynamic => PlasticityLayer::Dynamic(DynamicLayer::default()),
        }
    }

    /// Allocate every array for `neuron_count * max_per_neuron` zeroed slots.
    ///
    /// A store that is already allocated is cleaned up first.
    pub fn setup(&mut self, neuron_count: usize, max_per_neuron: usize) {
        if self.capacity() != 0 {
            log::debug!(
                "[SYNAPSE] setup on a live store ({} slots), cleaning up first",
                self.capacity()
            );
            self.cleanup();
        }
        let n = neuron_count * max_per_neuron;
        self.neuron_count = neuron_count;
        self.max_per_neuron = max_per_neuron;
        self.base = BaseLayer::zeroed(n);
        self.layer = match self.model {
            SynapseModel::Spiking => PlasticityLayer::None,
            SynapseModel::Dynamic => PlasticityLayer::Dynamic(DynamicLayer::zeroed(n)),
        };
        self.queue = SpikeEventQueue::new(n);
        self.synapse_counts = vec![0; neuron_count];
    }

    /// Release every array and zero the recorded sizes. No-op when already
    /// clean.
    pub fn cleanup(&mut self) {
        if self.capacity() == 0 && self.base.weight.is_empty() {
            return;
        }
        self.base = BaseLayer::default();
        self.layer = Self::empty_layer(self.model);
        self.queue = SpikeEventQueue::default();
        self.synapse_counts = Vec::new();
        self.neuron_count = 0;
        self.max_per_neuron = 0;
    }

    #[inline]
    pub fn model(&self) -> SynapseModel {
        self.model
    }

    #[inline]
    pub fn neuron_count(&self) -> usize {
        self.neuron_count
    }

    #[inline]
    pub fn max_per_neuron(&self) -> usize {
        self.max_per_neuron
    }

    /// Total slot count.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.neuron_count * self.max_per_neuron
    }

    /// Slots belonging to destination neuron `dest`.
    #[inline]
    pub fn slot_range(&self, dest: usize) -> Range<usize> {
        dest * self.max_per_neuron..(dest + 1) * self.max_per_neuron
    }

    #[inline]
    pub fn is_free(&self, slot: usize) -> bool {
        self.base.weight[slot] == 0.0
    }

    /// Occupied slot count across all neurons.
    pub fn total_synapses(&self) -> usize {
        self.synapse_counts.iter().map(|&c| c as usize).sum()
    }

    /// Slot of the synapse `source → dest`, if one exists.
    pub fn find(&self, source: usize, dest: usize) -> Option<usize> {
        self.slot_range(dest)
            .find(|&i| !self.is_free(i) && self.base.source[i] as usize == source)
    }

    /// Create `source → dest` in the first free slot of `dest`.
    ///
    /// Returns `None` when `dest` has no free slot. The new slot's delivery
    /// ring is cleared so no event from a previous tenant survives.
    pub fn create_synapse(
        &mut self,
        source: usize,
        dest: usize,
        weight: f32,
        ty: SynapseType,
        delta_t: f32,
    ) -> Option<usize> {
        debug_assert!(weight != 0.0, "zero weight marks a free slot");
        debug_assert!(ty != SynapseType::None);
        let slot = self.slot_range(dest).find(|&i| self.is_free(i))?;

        let tau = ty.tau();
        let b = &mut self.base;
        b.source[slot] = source as u32;
        b.dest[slot] = dest as u32;
        b.weight[slot] = weight;
        b.psr[slot] = 0.0;
        b.tau[slot] = tau;
        b.decay[slot] = (-delta_t / tau).exp();
        b.total_delay[slot] = delay_ticks(ty.axonal_delay(), delta_t);
        b.ty[slot] = ty;

        if let PlasticityLayer::Dynamic(d) = &mut self.layer {
            let (big_u, big_d, big_f) = ty.stp_defaults();
            d.last_spike[slot] = NEVER_SPIKED;
            d.r[slot] = 1.0;
            d.u[slot] = DEFAULT_U;
            d.utilization[slot] = big_u;
            d.depression_tau[slot] = big_d;
            d.facilitation_tau[slot] = big_f;
        }

        self.queue.clear(slot);
        self.synapse_counts[dest] += 1;
        Some(slot)
    }

    /// Replace the weight of an occupied slot. Other state is kept.
    pub fn update_weight(&mut self, slot: usize, weight: f32) {
        debug_assert!(!self.is_free(slot), "update on a free slot");
        debug_assert!(weight != 0.0, "use erase_synapse to free a slot");
        self.base.weight[slot] = weight;
    }

    /// Free a slot: every field back to zero, pending deliveries dropped.
    pub fn erase_synapse(&mut self, slot: usize) {
        if self.is_free(slot) {
            return;
        }
        let dest = self.base.dest[slot] as usize;
        self.base.clear_slot(slot);
        if let PlasticityLayer::Dynamic(d) = &mut self.layer {
            d.clear_slot(slot);
        }
        self.queue.clear(slot);
        self.synapse_counts[dest] = self.synapse_counts[dest].saturating_sub(1);
    }

    /// Schedule a pre-synaptic spike emitted at `tick` on `slot`.
    #[inline]
    pub fn pre_spike_hit(&mut self, slot: usize, tick: u64) -> bool {
        let delay = self.base.total_delay[slot];
        self.queue.schedule_delivery(slot, tick, delay)
    }

    /// Host synapse pass: for every occupied slot deliver any due spike,
    /// decay the response, and add it into `summation[dest]`.
    pub fn advance(&mut self, summation: &mut [f32], tick: u64, delta_t: f32) {
        for dest in 0..self.neuron_count {
            let mut sum = 0.0f32;
            for slot in self.slot_range(dest) {
                if self.is_free(slot) {
                    continue;
                }
                sum += self.advance_slot(slot, tick, delta_t);
            }
            summation[dest] += sum;
        }
    }

    /// Advance one occupied slot. Returns its decayed response.
    pub fn advance_slot(&mut self, slot: usize, tick: u64, delta_t: f32) -> f32 {
        let b = &mut self.base;
        if self.queue.check_and_clear(slot, tick) {
            let mut gain = 1.0;
            if let PlasticityLayer::Dynamic(d) = &mut self.layer {
                stp_on_spike(
                    &mut d.r[slot],
                    &mut d.u[slot],
                    &mut d.last_spike[slot],
                    d.depression_tau[slot],
                    d.utilization[slot],
                    d.facilitation_tau[slot],
                    tick,
                    delta_t,
                );
                gain = d.u[slot] * d.r[slot];
            }
            b.psr[slot] += b.weight[slot] / b.decay[slot] * gain;
        }
        b.psr[slot] *= b.decay[slot];
        b.psr[slot]
    }

    /// Whether slot `i` satisfies the sentinel rule.
    pub fn slot_is_consistent(&self, i: usize) -> bool {
        let layer_zero = match &self.layer {
            PlasticityLayer::None => true,
            PlasticityLayer::Dynamic(d) => d.companions_zero(i),
        };
        let companions_zero = self.base.companions_zero(i) && layer_zero && self.queue.pending(i) == 0;
        if self.is_free(i) {
            companions_zero
        } else {
            self.base.ty[i] != SynapseType::None
        }
    }

    fn write_slot_state(&self, out: &mut impl Write, i: usize) -> io::Result<()> {
        let b = &self.base;
        write!(
            out,
            "source: {} dest: {} W: {} psr: {} decay: {} tau: {} total_delay: {} type: {:?} queue: {:#010x}",
            b.source[i], b.dest[i], b.weight[i], b.psr[i], b.decay[i], b.tau[i], b.total_delay[i], b.ty[i],
            self.queue.pending(i)
        )?;
        if let PlasticityLayer::Dynamic(d) = &self.layer {
            write!(
                out,
                " lastSpike: {} r: {} u: {} D: {} U: {} F: {}",
                d.last_spike[i], d.r[i], d.u[i], d.depression_tau[i], d.utilization[i], d.facilitation_tau[i]
            )?;
        }
        writeln!(out)
    }

    /// Report every occupied slot's full state, and every slot breaking the
    /// sentinel rule as an `ERROR` line.
    pub fn diagnostic_dump(&self, out: &mut impl Write) -> io::Result<DumpSummary> {
        let mut summary = DumpSummary::default();
        for i in 0..self.capacity() {
            let consistent = self.slot_is_consistent(i);
            if !self.is_free(i) {
                summary.occupied += 1;
                write!(out, "slot {i}: ")?;
                self.write_slot_state(out, i)?;
            } else if consistent {
                continue;
            }
            if !consistent {
                summary.violations.push(i);
                log::warn!("[SYNAPSE] slot {i} breaks the free-slot sentinel rule");
                write!(out, "---------------------ERROR!!!!!!!!------------- slot {i}: ")?;
                self.write_slot_state(out, i)?;
            }
        }
        Ok(summary)
    }
}

/// CSR index from source neuron to the slots it projects onto.
///
/// Slots are grouped by destination, so finding a neuron's outgoing
/// synapses needs this side index. It is rebuilt after every adjacency
/// change. Within a source, slots are ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutgoingIndex {
    offsets: Vec<usize>,
    slots: Vec<usize>,
}

impl OutgoingIndex {
    pub fn build(store: &SynapseStore) -> Self {
        let n = store.neuron_count();
        let mut offsets = vec![0usize; n + 1];
        for slot in 0..store.capacity() {
            if !store.is_free(slot) {
                offsets[store.base.source[slot] as usize + 1] += 1;
            }
        }
        for i in 0..n {
            offsets[i + 1] += offsets[i];
        }
        let mut cursor = offsets.clone();
        let mut slots = vec![0usize; offsets[n]];
        for slot in 0..store.capacity() {
            if !store.is_free(slot) {
                let src = store.base.source[slot] as usize;
                slots[cursor[src]] = slot;
                cursor[src] += 1;
            }
        }
        Self { offsets, slots }
    }

    /// Slots whose source is `neuron`.
    #[inline]
    pub fn slots_of(&self, neuron: usize) -> &[usize] {
        &self.slots[self.offsets[neuron]..self.offsets[neuron + 1]]
    }

    /// Indexed synapse count.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
