//! Device mirror of the synapse store and the batched synapse kernel.
//!
//! `SynapseMirror` owns one device buffer per per-synapse array. The delivery
//! ring is not one of them: it belongs to the queue's own `QueueMirror`, and
//! the synapse mirror only records a borrowed id via `attach_queue`. Freeing
//! the synapse mirror drops that id without touching the buffer.
//!
//! The kernel binds every buffer it needs, runs one worker per destination
//! neuron, and restores the buffers. Each worker writes only its own slots
//! and its own summation entry.

use rayon::prelude::*;

use crate::device::{AllocBatch, BufferId, DeviceArena, DeviceError, DeviceScalar};
use crate::error::{Error, Result};
use crate::queue::{check_and_clear_bits, QueueMirror};
use crate::synapse::{stp_on_spike, PlasticityLayer, SynapseStore, SynapseType};

/// Device buffers of the dynamic layer.
#[derive(Debug, Clone, Copy)]
struct DynamicBuffers {
    last_spike: BufferId,
    r: BufferId,
    u: BufferId,
    depression_tau: BufferId,
    utilization: BufferId,
    facilitation_tau: BufferId,
}

/// Handle to a device-resident synapse store.
#[derive(Debug)]
#[must_use = "a synapse mirror must be released with SynapseStore::free_mirror"]
pub struct SynapseMirror {
    slots: usize,
    max_per_neuron: usize,
    source: BufferId,
    dest: BufferId,
    weight: BufferId,
    psr: BufferId,
    decay: BufferId,
    tau: BufferId,
    total_delay: BufferId,
    ty: BufferId,
    dynamic: Option<DynamicBuffers>,
    /// Borrowed from a `QueueMirror`, never freed here
    queue: Option<BufferId>,
}

impl SynapseMirror {
    /// Recorded slot count. Zero once freed.
    #[inline]
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Borrowed queue buffer, if attached.
    #[inline]
    pub fn queue(&self) -> Option<BufferId> {
        self.queue
    }

    /// Record the queue mirror's buffer for the kernel to use.
    pub fn attach_queue(&mut self, queue: &QueueMirror) {
        self.queue = queue.buffer();
    }

    /// Every buffer this handle owns.
    pub fn buffers(&self) -> Vec<BufferId> {
        let mut ids = vec![
            self.source,
            self.dest,
            self.weight,
            self.psr,
            self.decay,
            self.tau,
            self.total_delay,
            self.ty,
        ];
        if let Some(d) = self.dynamic {
            ids.extend([d.last_spike, d.r, d.u, d.depression_tau, d.utilization, d.facilitation_tau]);
        }
        ids
    }

    fn checked(&self, host_slots: usize) -> Result<()> {
        if self.slots != host_slots {
            return Err(Error::SizeMismatch { expected: host_slots, got: self.slots });
        }
        Ok(())
    }

    /// One synapse pass over the device image: deliver due spikes, decay
    /// responses, and add each neuron's total into `summation`.
    ///
    /// Produces the same values as `SynapseStore::advance` on the host image.
    pub fn advance_tick(&self, arena: &mut DeviceArena, summation: &mut [f32], tick: u64, delta_t: f32) -> Result<()> {
        let queue = self.queue.ok_or(Error::QueueDetached)?;
        if summation.len() * self.max_per_neuron != self.slots {
            return Err(Error::SizeMismatch {
                expected: self.slots,
                got: summation.len() * self.max_per_neuron,
            });
        }
        let mut bound = KernelBinding::acquire(arena, self, queue)?;
        bound.run(summation, self.max_per_neuron, tick, delta_t);
        bound.release(arena)?;
        Ok(())
    }
}

/// Owned copies of the kernel's buffers while they are bound.
struct KernelBinding {
    weight: (BufferId, Vec<f32>),
    decay: (BufferId, Vec<f32>),
    psr: (BufferId, Vec<f32>),
    bits: (BufferId, Vec<u32>),
    stp: Option<StpBinding>,
}

struct StpBinding {
    last_spike: (BufferId, Vec<u64>),
    r: (BufferId, Vec<f32>),
    u: (BufferId, Vec<f32>),
    depression_tau: (BufferId, Vec<f32>),
    utilization: (BufferId, Vec<f32>),
    facilitation_tau: (BufferId, Vec<f32>),
}

/// Slices of one destination neuron's slots.
struct NeuronSlots<'a> {
    weight: &'a [f32],
    decay: &'a [f32],
    psr: &'a mut [f32],
    bits: &'a mut [u32],
    stp: Option<StpSlots<'a>>,
}

struct StpSlots<'a> {
    last_spike: &'a mut [u64],
    r: &'a mut [f32],
    u: &'a mut [f32],
    depression_tau: &'a [f32],
    utilization: &'a [f32],
    facilitation_tau: &'a [f32],
}

fn bind<T: DeviceScalar>(arena: &mut DeviceArena, id: BufferId) -> std::result::Result<(BufferId, Vec<T>), DeviceError> {
    arena.take::<T>(id).map(|data| (id, data))
}

fn unbind<T: DeviceScalar>(arena: &mut DeviceArena, (id, data): (BufferId, Vec<T>)) -> std::result::Result<(), DeviceError> {
    arena.restore(id, data)
}

impl KernelBinding {
    /// Bind every buffer. All ids are checked first so a failure leaves
    /// nothing bound.
    fn acquire(arena: &mut DeviceArena, mirror: &SynapseMirror, queue: BufferId) -> Result<Self> {
        for id in [mirror.weight, mirror.decay, mirror.psr] {
            arena.view::<f32>(id)?;
        }
        arena.view::<u32>(queue)?;
        if let Some(d) = mirror.dynamic {
            arena.view::<u64>(d.last_spike)?;
            for id in [d.r, d.u, d.depression_tau, d.utilization, d.facilitation_tau] {
                arena.view::<f32>(id)?;
            }
        }

        let stp = match mirror.dynamic {
            Some(d) => Some(StpBinding {
                last_spike: bind(arena, d.last_spike)?,
                r: bind(arena, d.r)?,
                u: bind(arena, d.u)?,
                depression_tau: bind(arena, d.depression_tau)?,
                utilization: bind(arena, d.utilization)?,
                facilitation_tau: bind(arena, d.facilitation_tau)?,
            }),
            None => None,
        };
        Ok(Self {
            weight: bind(arena, mirror.weight)?,
            decay: bind(arena, mirror.decay)?,
            psr: bind(arena, mirror.psr)?,
            bits: bind(arena, queue)?,
            stp,
        })
    }

    fn release(self, arena: &mut DeviceArena) -> Result<()> {
        unbind(arena, self.weight)?;
        unbind(arena, self.decay)?;
        unbind(arena, self.psr)?;
        unbind(arena, self.bits)?;
        if let Some(s) = self.stp {
            unbind(arena, s.last_spike)?;
            unbind(arena, s.r)?;
            unbind(arena, s.u)?;
            unbind(arena, s.depression_tau)?;
            unbind(arena, s.utilization)?;
            unbind(arena, s.facilitation_tau)?;
        }
        Ok(())
    }

    fn run(&mut self, summation: &mut [f32], m: usize, tick: u64, delta_t: f32) {
        let mut stp_chunks: Box<dyn Iterator<Item = Option<StpSlots<'_>>> + '_> = match &mut self.stp {
            Some(s) => Box::new(
                s.last_spike
                    .1
                    .chunks_mut(m)
                    .zip(s.r.1.chunks_mut(m))
                    .zip(s.u.1.chunks_mut(m))
                    .zip(s.depression_tau.1.chunks(m))
                    .zip(s.utilization.1.chunks(m))
                    .zip(s.facilitation_tau.1.chunks(m))
                    .map(|(((((last_spike, r), u), depression_tau), utilization), facilitation_tau)| {
                        Some(StpSlots { last_spike, r, u, depression_tau, utilization, facilitation_tau })
                    }),
            ),
            None => Box::new(std::iter::repeat_with(|| None)),
        };

        let chunks: Vec<NeuronSlots<'_>> = self
            .weight
            .1
            .chunks(m)
            .zip(self.decay.1.chunks(m))
            .zip(self.psr.1.chunks_mut(m))
            .zip(self.bits.1.chunks_mut(m))
            .map(|(((weight, decay), psr), bits)| NeuronSlots {
                weight,
                decay,
                psr,
                bits,
                stp: stp_chunks.next().flatten(),
            })
            .collect();

        summation
            .par_iter_mut()
            .zip(chunks.into_par_iter())
            .for_each(|(sum, slots)| *sum += advance_neuron_slots(slots, tick, delta_t));
    }
}

/// Kernel body for one destination neuron. Mirrors `SynapseStore::advance_slot`.
fn advance_neuron_slots(mut s: NeuronSlots<'_>, tick: u64, delta_t: f32) -> f32 {
    let mut total = 0.0f32;
    for k in 0..s.weight.len() {
        if s.weight[k] == 0.0 {
            continue;
        }
        if check_and_clear_bits(&mut s.bits[k], tick) {
            let mut gain = 1.0;
            if let Some(stp) = s.stp.as_mut() {
                stp_on_spike(
                    &mut stp.r[k],
                    &mut stp.u[k],
                    &mut stp.last_spike[k],
                    stp.depression_tau[k],
                    stp.utilization[k],
                    stp.facilitation_tau[k],
                    tick,
                    delta_t,
                );
                gain = stp.u[k] * stp.r[k];
            }
            s.psr[k] += s.weight[k] / s.decay[k] * gain;
        }
        s.psr[k] *= s.decay[k];
        total += s.psr[k];
    }
    total
}

impl SynapseStore {
    /// Allocate device buffers matching every per-synapse array. The queue
    /// is attached separately with `SynapseMirror::attach_queue`. If any
    /// allocation fails, the ones already made are released.
    pub fn allocate_mirror(&self, arena: &mut DeviceArena) -> Result<SynapseMirror> {
        let mut batch = AllocBatch::new(arena);
        match self.allocate_buffers(&mut batch) {
            Ok(mirror) => {
                log::debug!(
                    "[MIRROR] synapses: allocated {} buffers for {} slots ({} bytes in arena)",
                    mirror.buffers().len(),
                    mirror.slots,
                    batch.arena().used_bytes()
                );
                Ok(mirror)
            }
            Err(e) => {
                batch.rollback();
                log::debug!("[MIRROR] synapses: allocation failed, partial buffers released");
                Err(e.into())
            }
        }
    }

    fn allocate_buffers(&self, batch: &mut AllocBatch<'_>) -> std::result::Result<SynapseMirror, DeviceError> {
        let n = self.capacity();
        let dynamic = match &self.layer {
            PlasticityLayer::None => None,
            PlasticityLayer::Dynamic(_) => Some(DynamicBuffers {
                last_spike: batch.alloc::<u64>(n)?,
                r: batch.alloc::<f32>(n)?,
                u: batch.alloc::<f32>(n)?,
                depression_tau: batch.alloc::<f32>(n)?,
                utilization: batch.alloc::<f32>(n)?,
                facilitation_tau: batch.alloc::<f32>(n)?,
            }),
        };
        Ok(SynapseMirror {
            slots: n,
            max_per_neuron: self.max_per_neuron(),
            source: batch.alloc::<u32>(n)?,
            dest: batch.alloc::<u32>(n)?,
            weight: batch.alloc::<f32>(n)?,
            psr: batch.alloc::<f32>(n)?,
            decay: batch.alloc::<f32>(n)?,
            tau: batch.alloc::<f32>(n)?,
            total_delay: batch.alloc::<u32>(n)?,
            ty: batch.alloc::<u8>(n)?,
            dynamic,
            queue: None,
        })
    }

    /// Host → device, every array.
    pub fn copy_to_mirror(&self, arena: &mut DeviceArena, mirror: &SynapseMirror) -> Result<()> {
        mirror.checked(self.capacity())?;
        let b = &self.base;
        arena.upload(mirror.source, &b.source)?;
        arena.upload(mirror.dest, &b.dest)?;
        arena.upload(mirror.weight, &b.weight)?;
        arena.upload(mirror.psr, &b.psr)?;
        arena.upload(mirror.decay, &b.decay)?;
        arena.upload(mirror.tau, &b.tau)?;
        arena.upload(mirror.total_delay, &b.total_delay)?;
        let codes: Vec<u8> = b.ty.iter().map(|t| t.code()).collect();
        arena.upload(mirror.ty, &codes)?;

        match (&self.layer, mirror.dynamic) {
            (PlasticityLayer::Dynamic(d), Some(m)) => {
                arena.upload(m.last_spike, &d.last_spike)?;
                arena.upload(m.r, &d.r)?;
                arena.upload(m.u, &d.u)?;
                arena.upload(m.depression_tau, &d.depression_tau)?;
                arena.upload(m.utilization, &d.utilization)?;
                arena.upload(m.facilitation_tau, &d.facilitation_tau)?;
            }
            (PlasticityLayer::None, None) => {}
            _ => return Err(Error::SizeMismatch { expected: self.capacity(), got: 0 }),
        }
        Ok(())
    }

    /// Device → host, every array.
    pub fn copy_from_mirror(&mut self, arena: &DeviceArena, mirror: &SynapseMirror) -> Result<()> {
        mirror.checked(self.capacity())?;
        let b = &mut self.base;
        arena.download(mirror.source, &mut b.source)?;
        arena.download(mirror.dest, &mut b.dest)?;
        arena.download(mirror.weight, &mut b.weight)?;
        arena.download(mirror.psr, &mut b.psr)?;
        arena.download(mirror.decay, &mut b.decay)?;
        arena.download(mirror.tau, &mut b.tau)?;
        arena.download(mirror.total_delay, &mut b.total_delay)?;
        let codes = arena.view::<u8>(mirror.ty)?;
        if codes.len() != b.ty.len() {
            return Err(Error::SizeMismatch { expected: b.ty.len(), got: codes.len() });
        }
        for (slot, (dst, &code)) in b.ty.iter_mut().zip(codes).enumerate() {
            *dst = SynapseType::from_code(code).ok_or_else(|| Error::InvalidSlot {
                slot,
                reason: format!("device holds unknown synapse type code {code}"),
            })?;
        }

        match (&mut self.layer, mirror.dynamic) {
            (PlasticityLayer::Dynamic(d), Some(m)) => {
                arena.download(m.last_spike, &mut d.last_spike)?;
                arena.download(m.r, &mut d.r)?;
                arena.download(m.u, &mut d.u)?;
                arena.download(m.depression_tau, &mut d.depression_tau)?;
                arena.download(m.utilization, &mut d.utilization)?;
                arena.download(m.facilitation_tau, &mut d.facilitation_tau)?;
            }
            (PlasticityLayer::None, None) => {}
            _ => return Err(Error::SizeMismatch { expected: self.capacity(), got: 0 }),
        }
        Ok(())
    }

    /// Release a synapse mirror. The recorded size is zeroed first, the
    /// borrowed queue id is dropped without freeing, then every owned buffer
    /// is freed. The first failing free is returned after all were tried.
    pub fn free_mirror(arena: &mut DeviceArena, mut mirror: SynapseMirror) -> Result<()> {
        mirror.slots = 0;
        mirror.queue = None;
        let mut first_err = None;
        for id in mirror.buffers() {
            if let Err(e) = arena.free(id) {
                log::warn!("[MIRROR] synapses: failed to free {id}: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => {
                log::debug!("[MIRROR] synapses: released, {} buffers still live", arena.live_buffers());
                Ok(())
            }
        }
    }
}
