//! Growth and tick-loop benchmarks
//!
//! Measures the per-epoch growth steps on grids of increasing size, and
//! the per-tick synapse pass on both backends.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use neurogrow::{
    Backend, GridLayout, GrowthEngine, GrowthParams, NeuronArrays, Network, SimConfig, SynapseModel,
    SynapseStore,
};
use std::time::Duration;

const DT: f32 = 1.0e-4;

/// Spread spike counts so some neurons grow and others shrink
fn synthetic_counts(neurons: &mut NeuronArrays, epoch: u32) {
    for (i, c) in neurons.spike_count.iter_mut().enumerate() {
        *c = (i as u32 * 7 + epoch * 3) % 6;
    }
}

fn bench_growth_epoch(c: &mut Criterion) {
    let mut group = c.benchmark_group("growth_epoch");
    group.measurement_time(Duration::from_secs(5));

    for side in [10u32, 20, 30].iter() {
        let n = (*side * *side) as usize;
        let layout = GridLayout::new(*side, *side);
        let params = GrowthParams { rho: 0.3, start_radius: 0.6, ..GrowthParams::default() };

        group.bench_with_input(BenchmarkId::new("run_epoch", n), &n, |b, &n| {
            let mut engine = GrowthEngine::new(params, 1.0e-8, &layout);
            let mut neurons = NeuronArrays::new();
            neurons.setup(n, 16, DT);
            let mut synapses = SynapseStore::new(SynapseModel::Dynamic);
            synapses.setup(n, 32);
            let mut epoch = 0;
            b.iter(|| {
                synthetic_counts(&mut neurons, epoch);
                epoch += 1;
                black_box(engine.run_epoch(&mut neurons, &mut synapses, 1.0, DT))
            });
        });
    }

    group.finish();
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("advance_tick");

    for backend in [Backend::Host, Backend::Mirrored] {
        let mut config = SimConfig {
            width: 16,
            height: 16,
            max_synapses_per_neuron: 32,
            epoch_duration: 0.02,
            backend,
            ..SimConfig::default()
        };
        config.growth.start_radius = 1.2;
        config.neurons.i_inject = [15.0e-9, 16.0e-9];
        let layout = GridLayout::new(16, 16);
        let mut net = Network::new(config, &layout).expect("network");
        net.advance_epoch(&mut neurogrow::NullRecorder).expect("wire up");

        group.bench_function(BenchmarkId::new("backend", format!("{backend:?}")), |b| {
            b.iter(|| black_box(net.advance_tick().expect("tick")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_growth_epoch, bench_tick);
criterion_main!(benches);
