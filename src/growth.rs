//! Activity-dependent structural growth.
//!
//! Each neuron carries a connectivity radius. At every epoch boundary:
//!
//! 1. firing rates are computed from the epoch's spike counts,
//! 2. radii grow or shrink with a sigmoidal outgrowth term,
//! 3. pairwise frontiers `r_i + r_j − dist` are updated,
//! 4. overlap areas are computed where frontiers are positive,
//! 5. synapses are created, reweighted, or erased to match the overlaps.
//!
//! Outgrowth is `1 − 2 / (1 + exp((ε − rate/max_rate) / β))`: zero at the
//! target rate, positive below it, negative above it. The radius change per
//! epoch is bounded by `ρ · epoch_duration`.

use rayon::prelude::*;

use crate::config::GrowthParams;
use crate::geometry::{overlap_area, PairMatrix};
use crate::layout::NeuronLayout;
use crate::neuron::{NeuronArrays, NeuronKind};
use crate::synapse::{SynapseStore, SynapseType};
use crate::error::{Error, Result};

/// Per-neuron and pairwise growth state.
#[derive(Clone, Debug)]
pub struct ConnectionsState {
    pub rates: Vec<f32>,
    pub radii: Vec<f32>,
    pub outgrowth: Vec<f32>,
    pub delta_r: Vec<f32>,
    /// Fixed at creation
    pub dist: PairMatrix,
    /// `r_i + r_j − dist[i,j]`
    pub delta: PairMatrix,
    /// Overlap area, zero where `delta <= 0`
    pub area: PairMatrix,
}

impl ConnectionsState {
    fn new(layout: &dyn NeuronLayout, start_radius: f32) -> Self {
        let n = layout.len();
        Self {
            rates: vec![0.0; n],
            radii: vec![start_radius; n],
            outgrowth: vec![0.0; n],
            delta_r: vec![0.0; n],
            dist: PairMatrix::distances(layout),
            delta: PairMatrix::zeros(n),
            area: PairMatrix::zeros(n),
        }
    }
}

/// What one connectivity update changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdjacencyDelta {
    pub created: usize,
    pub removed: usize,
    pub updated: usize,
    /// Creations dropped because the destination had no free slot
    pub skipped_capacity: usize,
}

impl AdjacencyDelta {
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.removed == 0 && self.updated == 0 && self.skipped_capacity == 0
    }
}

impl std::ops::AddAssign for AdjacencyDelta {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.removed += rhs.removed;
        self.updated += rhs.updated;
        self.skipped_capacity += rhs.skipped_capacity;
    }
}

/// Radii and rates at the end of an epoch.
#[derive(Clone, Copy, Debug)]
pub struct EpochSnapshot<'a> {
    pub radii: &'a [f32],
    pub rates: &'a [f32],
}

/// Drives the per-epoch growth steps over a `ConnectionsState`.
#[derive(Clone, Debug)]
pub struct GrowthEngine {
    params: GrowthParams,
    strength_adjustment: f32,
    state: ConnectionsState,
}

impl GrowthEngine {
    pub fn new(params: GrowthParams, strength_adjustment: f32, layout: &dyn NeuronLayout) -> Self {
        log::debug!("[GROWTH] {} neurons, {}", layout.len(), params);
        Self {
            params,
            strength_adjustment,
            state: ConnectionsState::new(layout, params.start_radius),
        }
    }

    #[inline]
    pub fn params(&self) -> &GrowthParams {
        &self.params
    }

    #[inline]
    pub fn state(&self) -> &ConnectionsState {
        &self.state
    }

    #[inline]
    pub fn neuron_count(&self) -> usize {
        self.state.radii.len()
    }

    pub fn set_radius(&mut self, i: usize, radius: f32) {
        self.state.radii[i] = radius;
    }

    /// Replace radii and rates, e.g. from a checkpoint. Frontiers and areas
    /// are recomputed from the new radii.
    pub fn restore(&mut self, radii: Vec<f32>, rates: Vec<f32>) -> Result<()> {
        let n = self.neuron_count();
        for len in [radii.len(), rates.len()] {
            if len != n {
                return Err(Error::SizeMismatch { expected: n, got: len });
            }
        }
        self.state.radii = radii;
        self.state.rates = rates;
        self.update_frontiers();
        self.update_overlap();
        Ok(())
    }

    /// Step 1: `rate = spike_count / epoch_duration`, then reset the counts.
    pub fn update_rates(&mut self, neurons: &mut NeuronArrays, epoch_duration: f32) {
        for (rate, &count) in self.state.rates.iter_mut().zip(&neurons.spike_count) {
            *rate = count as f32 / epoch_duration;
        }
        neurons.reset_spike_counts();
    }

    /// Step 2: outgrowth and radius update, clamped to `min_radius`.
    pub fn update_radii(&mut self, epoch_duration: f32) {
        let p = self.params;
        let max_rate = p.max_rate();
        let s = &mut self.state;
        for i in 0..s.radii.len() {
            let outgrowth = 1.0 - 2.0 / (1.0 + ((p.epsilon - s.rates[i] / max_rate) / p.beta).exp());
            s.outgrowth[i] = outgrowth;
            s.delta_r[i] = epoch_duration * p.rho * outgrowth;
            s.radii[i] = (s.radii[i] + s.delta_r[i]).max(p.min_radius);
        }
    }

    /// Step 3: `delta[i,j] = r_i + r_j − dist[i,j]`.
    pub fn update_frontiers(&mut self) {
        let s = &mut self.state;
        let radii = &s.radii;
        let dist = &s.dist;
        s.delta.par_rows_mut().enumerate().for_each(|(i, row)| {
            for (j, d) in row.iter_mut().enumerate() {
                *d = radii[i] + radii[j] - dist.get(i, j);
            }
        });
    }

    /// Step 4: overlap area for every pair with a positive frontier.
    pub fn update_overlap(&mut self) {
        let s = &mut self.state;
        let radii = &s.radii;
        let dist = &s.dist;
        let delta = &s.delta;
        s.area.par_rows_mut().enumerate().for_each(|(i, row)| {
            for (j, a) in row.iter_mut().enumerate() {
                *a = if i != j && delta.get(i, j) > 0.0 {
                    overlap_area(dist.get(i, j), radii[i], radii[j])
                } else {
                    0.0
                };
            }
        });
    }

    /// Step 5: mutate adjacency to match the overlap matrix.
    ///
    /// Pairs are visited in ascending `(i, j)` with `i < j`, direction
    /// `i → j` before `j → i`, so the outcome is independent of thread
    /// count.
    pub fn update_connections(&self, kinds: &[NeuronKind], synapses: &mut SynapseStore, delta_t: f32) -> AdjacencyDelta {
        let n = self.neuron_count();
        let mut out = AdjacencyDelta::default();
        for i in 0..n {
            for j in (i + 1)..n {
                let area = self.state.area.get(i, j);
                for (src, dst) in [(i, j), (j, i)] {
                    self.connect(kinds, synapses, src, dst, area, delta_t, &mut out);
                }
            }
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn connect(
        &self,
        kinds: &[NeuronKind],
        synapses: &mut SynapseStore,
        src: usize,
        dst: usize,
        area: f32,
        delta_t: f32,
        out: &mut AdjacencyDelta,
    ) {
        let existing = synapses.find(src, dst);
        if area <= 0.0 {
            if let Some(slot) = existing {
                synapses.erase_synapse(slot);
                out.removed += 1;
            }
            return;
        }

        let ty = SynapseType::between(kinds[src], kinds[dst]);
        let weight = ty.sign() * area * self.strength_adjustment;
        match existing {
            Some(slot) if weight != 0.0 => {
                synapses.update_weight(slot, weight);
                out.updated += 1;
            }
            Some(slot) => {
                synapses.erase_synapse(slot);
                out.removed += 1;
            }
            None if weight == 0.0 => {}
            None => match synapses.create_synapse(src, dst, weight, ty, delta_t) {
                Some(_) => out.created += 1,
                None => {
                    log::debug!("[GROWTH] neuron {dst} has no free slot for a synapse from {src}");
                    out.skipped_capacity += 1;
                }
            },
        }
    }

    /// Steps 1–5 in order. Consumes and resets the epoch's spike counts.
    pub fn run_epoch(
        &mut self,
        neurons: &mut NeuronArrays,
        synapses: &mut SynapseStore,
        epoch_duration: f32,
        delta_t: f32,
    ) -> AdjacencyDelta {
        self.update_rates(neurons, epoch_duration);
        self.update_radii(epoch_duration);
        self.update_frontiers();
        self.update_overlap();
        let delta = self.update_connections(&neurons.kind, synapses, delta_t);
        log::debug!(
            "[GROWTH] +{} -{} ~{} synapses ({} skipped at capacity), {} total",
            delta.created,
            delta.removed,
            delta.updated,
            delta.skipped_capacity,
            synapses.total_synapses()
        );
        delta
    }

    /// Step 6: state handed to the epoch recorder.
    pub fn snapshot(&self) -> EpochSnapshot<'_> {
        EpochSnapshot { radii: &self.state.radii, rates: &self.state.rates }
    }
}
