//! Network: the top-level container, tick loop, and epoch driver.
//!
//! Per tick: neurons integrate and fire, each firing neuron schedules a
//! delivery on its outgoing synapses, then the synapse pass delivers due
//! spikes and accumulates responses into next tick's summation slots.
//!
//! With `Backend::Mirrored` the synapse state lives on the device image for
//! the duration of an epoch. At the boundary the device image is copied
//! back, growth runs on the host, and the host image is copied out again.
//! Exactly one image is authoritative at any time.

use std::io::{BufRead, Write};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::codec::{write_f32_row, CheckpointHeader, EntityStream, TokenReader, TokenWriter};
use crate::config::SimConfig;
use crate::device::DeviceArena;
use crate::error::{Error, Result};
use crate::growth::{AdjacencyDelta, GrowthEngine};
use crate::layout::NeuronLayout;
use crate::mirror::SynapseMirror;
use crate::neuron::{generate_kind_map, generate_starter_map, NeuronArrays};
use crate::queue::{QueueMirror, SpikeEventQueue};
use crate::recorder::EpochRecorder;
use crate::synapse::{OutgoingIndex, SynapseStore};

/// Where the per-tick synapse pass runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Sequential pass over the host image
    #[default]
    Host,
    /// Batched parallel kernel over a device image
    Mirrored,
}

/// Which image holds the current synapse and queue state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Truth {
    Host,
    Device,
}

struct DeviceState {
    arena: DeviceArena,
    synapses: SynapseMirror,
    queue: QueueMirror,
}

/// A simulated sheet of neurons with activity-dependent wiring.
pub struct Network {
    config: SimConfig,
    neurons: NeuronArrays,
    synapses: SynapseStore,
    growth: GrowthEngine,
    outgoing: OutgoingIndex,
    rng: ChaCha8Rng,
    tick: u64,
    epoch: u32,
    device: Option<DeviceState>,
    truth: Truth,
}

impl Network {
    /// Build a network on a default-sized device arena (mirrored backend).
    pub fn new(config: SimConfig, layout: &dyn NeuronLayout) -> Result<Self> {
        Self::with_device_arena(config, layout, DeviceArena::new())
    }

    /// Build a network. `arena` is used only by the mirrored backend.
    pub fn with_device_arena(config: SimConfig, layout: &dyn NeuronLayout, arena: DeviceArena) -> Result<Self> {
        config.validate()?;
        let n = config.neuron_count();
        if layout.len() != n {
            return Err(Error::Config(format!(
                "layout places {} neurons, config expects {}",
                layout.len(),
                n
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let kinds = generate_kind_map(n, config.frac_excitatory, &mut rng);
        let starters = generate_starter_map(&kinds, config.frac_starter, &mut rng);

        let mut neurons = NeuronArrays::new();
        neurons.setup(n, config.spike_history_len(), config.delta_t);
        neurons.populate(&config.neurons, &kinds, &starters, &mut rng);

        let mut synapses = SynapseStore::new(config.synapse_model);
        synapses.setup(n, config.max_synapses_per_neuron as usize);

        let growth = GrowthEngine::new(config.growth, config.strength_adjustment, layout);
        let outgoing = OutgoingIndex::build(&synapses);

        let mut net = Self {
            config,
            neurons,
            synapses,
            growth,
            outgoing,
            rng,
            tick: 0,
            epoch: 0,
            device: None,
            truth: Truth::Host,
        };
        if net.config.backend == Backend::Mirrored {
            net.attach_device(arena)?;
        }
        log::debug!(
            "[NETWORK] {} neurons, {} slots, {:?} backend, {} synapse model",
            n,
            net.synapses.capacity(),
            net.config.backend,
            net.config.synapse_model
        );
        Ok(net)
    }

    fn attach_device(&mut self, mut arena: DeviceArena) -> Result<()> {
        let queue = self.synapses.queue.allocate_mirror(&mut arena)?;
        let mut synapses = match self.synapses.allocate_mirror(&mut arena) {
            Ok(m) => m,
            Err(e) => {
                SpikeEventQueue::free_mirror(&mut arena, queue)?;
                return Err(e);
            }
        };
        synapses.attach_queue(&queue);
        self.device = Some(DeviceState { arena, synapses, queue });
        self.truth = Truth::Host;
        self.ensure_device()
    }

    // ---- Accessors ----

    #[inline]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    #[inline]
    pub fn backend(&self) -> Backend {
        self.config.backend
    }

    #[inline]
    pub fn neurons(&self) -> &NeuronArrays {
        &self.neurons
    }

    /// Host synapse image. Per-tick fields (`psr`, rings, plasticity state)
    /// lag the device image while a mirrored epoch is in progress.
    #[inline]
    pub fn synapses(&self) -> &SynapseStore {
        &self.synapses
    }

    #[inline]
    pub fn growth(&self) -> &GrowthEngine {
        &self.growth
    }

    #[inline]
    pub fn outgoing(&self) -> &OutgoingIndex {
        &self.outgoing
    }

    #[inline]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Completed growth epochs.
    #[inline]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Device arena, when running mirrored.
    pub fn device_arena(&self) -> Option<&DeviceArena> {
        self.device.as_ref().map(|d| &d.arena)
    }

    // ---- Image synchronisation ----

    /// Make the host image authoritative.
    fn ensure_host(&mut self) -> Result<()> {
        if self.truth == Truth::Device {
            if let Some(dev) = &self.device {
                self.synapses.copy_from_mirror(&dev.arena, &dev.synapses)?;
                self.synapses.queue.copy_from_mirror(&dev.arena, &dev.queue)?;
            }
            self.truth = Truth::Host;
        }
        Ok(())
    }

    /// Make the device image authoritative. No-op on the host backend.
    fn ensure_device(&mut self) -> Result<()> {
        if self.truth == Truth::Host {
            if let Some(dev) = &mut self.device {
                self.synapses.copy_to_mirror(&mut dev.arena, &dev.synapses)?;
                self.synapses.queue.copy_to_mirror(&mut dev.arena, &dev.queue)?;
                self.truth = Truth::Device;
            }
        }
        Ok(())
    }

    // ---- Tick loop ----

    /// Advance one tick. Returns the number of neurons that fired.
    pub fn advance_tick(&mut self) -> Result<u32> {
        let tick = self.tick;
        let delta_t = self.config.delta_t;
        if self.device.is_some() {
            self.ensure_device()?;
        }

        let fired = self.neurons.advance(tick, &mut self.rng);

        match &mut self.device {
            None => {
                if fired > 0 {
                    for (i, _) in self.neurons.spike_out.iter().enumerate().filter(|(_, s)| **s) {
                        for &slot in self.outgoing.slots_of(i) {
                            self.synapses.pre_spike_hit(slot, tick);
                        }
                    }
                }
                self.synapses.advance(&mut self.neurons.summation, tick, delta_t);
            }
            Some(dev) => {
                if fired > 0 {
                    // total_delay is fixed between growth steps, so the host copy is current.
                    let delays = &self.synapses.base.total_delay;
                    let outgoing = &self.outgoing;
                    let events = self
                        .neurons
                        .spike_out
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| **s)
                        .flat_map(move |(i, _)| outgoing.slots_of(i).iter().map(move |&slot| (slot, delays[slot])));
                    SpikeEventQueue::schedule_on_mirror(&mut dev.arena, &dev.queue, tick, events)?;
                }
                dev.synapses
                    .advance_tick(&mut dev.arena, &mut self.neurons.summation, tick, delta_t)?;
            }
        }

        self.tick += 1;
        Ok(fired)
    }

    /// Run one growth epoch: `steps_per_epoch` ticks, then the growth
    /// steps, then report the snapshot to `recorder`.
    pub fn advance_epoch(&mut self, recorder: &mut dyn EpochRecorder) -> Result<AdjacencyDelta> {
        let steps = self.config.steps_per_epoch();
        let mut spikes = 0u64;
        for _ in 0..steps {
            spikes += self.advance_tick()? as u64;
        }

        self.ensure_host()?;
        let delta = self.growth.run_epoch(
            &mut self.neurons,
            &mut self.synapses,
            self.config.epoch_duration,
            self.config.delta_t,
        );
        self.outgoing = OutgoingIndex::build(&self.synapses);
        if self.device.is_some() {
            self.ensure_device()?;
        }

        self.epoch += 1;
        let snap = self.growth.snapshot();
        recorder.report_epoch_snapshot(self.epoch, snap.radii, snap.rates);
        log::debug!(
            "[NETWORK] epoch {} done at tick {}: {} spikes, {} synapses",
            self.epoch,
            self.tick,
            spikes,
            self.synapses.total_synapses()
        );
        Ok(delta)
    }

    /// Run `max_epochs` epochs. Returns the accumulated adjacency changes.
    pub fn simulate(&mut self, recorder: &mut dyn EpochRecorder) -> Result<AdjacencyDelta> {
        let mut total = AdjacencyDelta::default();
        for _ in 0..self.config.max_epochs {
            total += self.advance_epoch(recorder)?;
        }
        Ok(total)
    }

    // ---- Checkpoints ----

    /// Write a full checkpoint. Pending deliveries are not saved.
    pub fn save_memory(&mut self, out: impl Write) -> Result<()> {
        self.ensure_host()?;
        let mut w = TokenWriter::new(out);
        CheckpointHeader {
            neurons: self.neurons.len(),
            max_per_neuron: self.synapses.max_per_neuron(),
            model: self.synapses.model(),
            tick: self.tick,
        }
        .write(&mut w)?;
        self.neurons.write_all_entities(&mut w)?;
        self.synapses.write_all_entities(&mut w)?;
        let snap = self.growth.snapshot();
        write_f32_row(&mut w, snap.radii)?;
        write_f32_row(&mut w, snap.rates)?;
        w.flush()?;
        log::debug!("[CHECKPOINT] saved tick {} ({} synapses)", self.tick, self.synapses.total_synapses());
        Ok(())
    }

    /// Restore a checkpoint written by `save_memory` for a network of the
    /// same shape. On error the network is left unchanged.
    pub fn load_memory(&mut self, input: impl BufRead) -> Result<()> {
        let mut r = TokenReader::new(input);
        let header = CheckpointHeader::read(&mut r)?;
        if header.neurons != self.neurons.len() {
            return Err(Error::SizeMismatch { expected: self.neurons.len(), got: header.neurons });
        }
        if header.max_per_neuron != self.synapses.max_per_neuron() {
            return Err(Error::SizeMismatch { expected: self.synapses.max_per_neuron(), got: header.max_per_neuron });
        }
        if header.model != self.synapses.model() {
            return Err(Error::Malformed { field: "model", token: header.model.to_string() });
        }

        let mut neurons = self.neurons.clone();
        let mut synapses = self.synapses.clone();
        neurons.read_all_entities(&mut r)?;
        synapses.read_all_entities(&mut r)?;
        let radii = r.f32_row(neurons.len(), "radius")?;
        let rates = r.f32_row(neurons.len(), "rate")?;
        self.growth.restore(radii, rates)?;

        neurons.reset_spike_counts();
        self.neurons = neurons;
        self.synapses = synapses;
        self.outgoing = OutgoingIndex::build(&self.synapses);
        self.tick = header.tick;
        self.epoch = (header.tick / self.config.steps_per_epoch()) as u32;
        self.truth = Truth::Host;
        if self.device.is_some() {
            self.ensure_device()?;
        }
        log::debug!("[CHECKPOINT] loaded tick {} ({} synapses)", self.tick, self.synapses.total_synapses());
        Ok(())
    }

    // ---- Teardown ----

    /// Copy device state back and release every device buffer. The network
    /// continues on the host backend afterwards.
    pub fn teardown(&mut self) -> Result<()> {
        self.ensure_host()?;
        if let Some(DeviceState { mut arena, synapses, queue }) = self.device.take() {
            SynapseStore::free_mirror(&mut arena, synapses)?;
            SpikeEventQueue::free_mirror(&mut arena, queue)?;
            log::debug!("[MIRROR] teardown complete, {} buffers live", arena.live_buffers());
            self.config.backend = Backend::Host;
        }
        Ok(())
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        if self.device.is_some() {
            if let Err(e) = self.teardown() {
                log::warn!("[MIRROR] teardown on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::GridLayout;
    use crate::recorder::{HistoryRecorder, NullRecorder};
    use crate::synapse::SynapseModel;

    fn small_config(backend: Backend) -> SimConfig {
        let mut config = SimConfig {
            width: 4,
            height: 4,
            max_synapses_per_neuron: 8,
            epoch_duration: 0.05,
            max_epochs: 3,
            seed: 11,
            backend,
            ..SimConfig::default()
        };
        config.neurons.i_inject = [14.0e-9, 16.0e-9];
        config.growth.start_radius = 0.6;
        config
    }

    fn network(config: SimConfig) -> Network {
        let layout = GridLayout::new(config.width, config.height);
        Network::new(config, &layout).expect("network")
    }

    #[test]
    fn layout_size_must_match() {
        let config = small_config(Backend::Host);
        let err = Network::new(config, &GridLayout::new(2, 2)).err().expect("mismatch");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn first_epoch_wires_neighbours() {
        let mut net = network(small_config(Backend::Host));
        let mut history = HistoryRecorder::new(16, 0.6);
        let delta = net.advance_epoch(&mut history).unwrap();

        assert!(delta.created > 0);
        assert_eq!(net.tick(), 500);
        assert_eq!(net.epoch(), 1);
        assert_eq!(history.epochs(), 1);
        assert_eq!(net.outgoing().len(), net.synapses().total_synapses());
        assert!(net.neurons().spike_count.iter().all(|&c| c == 0), "counts reset at boundary");
        assert!(net.growth().state().rates.iter().any(|&r| r > 0.0), "driven neurons fire");
    }

    #[test]
    fn host_and_mirrored_backends_agree() {
        for model in [SynapseModel::Dynamic, SynapseModel::Spiking] {
            let mut host_cfg = small_config(Backend::Host);
            host_cfg.synapse_model = model;
            let mut dev_cfg = host_cfg.clone();
            dev_cfg.backend = Backend::Mirrored;

            let mut host = network(host_cfg);
            let mut dev = network(dev_cfg);
            let mut host_hist = HistoryRecorder::new(16, 0.6);
            let mut dev_hist = HistoryRecorder::new(16, 0.6);

            let a = host.simulate(&mut host_hist).unwrap();
            let b = dev.simulate(&mut dev_hist).unwrap();
            assert_eq!(a, b);
            assert_eq!(host_hist, dev_hist, "rates and radii per epoch");
            assert_eq!(host.neurons().vm, dev.neurons().vm);
            assert_eq!(host.synapses().base, dev.synapses().base);
            assert_eq!(host.synapses().layer, dev.synapses().layer);
            assert_eq!(host.synapses().queue, dev.synapses().queue);
        }
    }

    #[test]
    fn mirrored_teardown_releases_device() {
        let mut net = network(small_config(Backend::Mirrored));
        assert_eq!(net.device_arena().map(|a| a.live_buffers()), Some(15));
        for _ in 0..25 {
            net.advance_tick().unwrap();
        }
        net.teardown().unwrap();
        assert!(net.device_arena().is_none());
        assert_eq!(net.backend(), Backend::Host);
        net.advance_tick().unwrap();
        net.teardown().unwrap();
    }

    #[test]
    fn device_out_of_memory_is_fatal() {
        let config = small_config(Backend::Mirrored);
        let layout = GridLayout::new(4, 4);
        let err = Network::with_device_arena(config, &layout, DeviceArena::with_capacity(64)).err().unwrap();
        assert!(matches!(err, Error::Device(_)));
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut net = network(small_config(Backend::Mirrored));
        net.simulate(&mut NullRecorder).unwrap();
        let mut buf = Vec::new();
        net.save_memory(&mut buf).unwrap();

        let mut restored = network(small_config(Backend::Host));
        restored.load_memory(buf.as_slice()).unwrap();
        assert_eq!(restored.tick(), net.tick());
        assert_eq!(restored.epoch(), 3);
        assert_eq!(restored.synapses().base, net.synapses().base);
        assert_eq!(restored.synapses().layer, net.synapses().layer);
        assert_eq!(restored.synapses().synapse_counts, net.synapses().synapse_counts);
        assert_eq!(restored.growth().state().radii, net.growth().state().radii);
        assert_eq!(restored.growth().state().rates, net.growth().state().rates);
        assert_eq!(restored.neurons().vm, net.neurons().vm);
        assert_eq!(restored.outgoing(), net.outgoing());
    }

    #[test]
    fn mismatched_checkpoint_leaves_network_unchanged() {
        let mut net = network(small_config(Backend::Host));
        net.advance_epoch(&mut NullRecorder).unwrap();
        let mut buf = Vec::new();
        net.save_memory(&mut buf).unwrap();

        let mut small = small_config(Backend::Host);
        small.max_synapses_per_neuron = 4;
        let mut other = network(small);
        assert!(matches!(other.load_memory(buf.as_slice()), Err(Error::SizeMismatch { expected: 4, got: 8 })));

        let text = String::from_utf8(buf).unwrap();
        let truncated = &text[..text.len() / 2];
        let mut fresh = network(small_config(Backend::Host));
        let before = fresh.synapses().base.clone();
        assert!(fresh.load_memory(truncated.as_bytes()).is_err());
        assert_eq!(fresh.synapses().base, before);
        assert_eq!(fresh.tick(), 0);
    }
}
