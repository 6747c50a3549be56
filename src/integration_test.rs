//! Integration Test: Growth to a Target Rate
//!
//! A small sheet is driven by a strong background current and left to grow
//! for several epochs. The test checks that:
//!
//! - radii respond to activity and the recorder sees every epoch
//! - every slot still satisfies the free-slot rule after repeated rewiring
//! - the outgoing index always matches the store
//! - a TOML-configured mirrored run can be checkpointed and resumed on the host

#[cfg(test)]
mod tests {
    use crate::codec::EntityStream;
    use crate::config::SimConfig;
    use crate::layout::GridLayout;
    use crate::network::{Backend, Network};
    use crate::recorder::HistoryRecorder;
    use crate::synapse::OutgoingIndex;

    fn driven_config() -> SimConfig {
        let mut config = SimConfig {
            width: 5,
            height: 5,
            max_synapses_per_neuron: 12,
            epoch_duration: 0.04,
            max_epochs: 5,
            seed: 2024,
            ..SimConfig::default()
        };
        config.neurons.i_inject = [14.5e-9, 16.5e-9];
        config.growth.start_radius = 0.7;
        config.growth.rho = 0.5;
        config
    }

    #[test]
    fn repeated_rewiring_keeps_store_consistent() {
        let config = driven_config();
        let layout = GridLayout::new(config.width, config.height);
        let mut net = Network::new(config, &layout).unwrap();
        let mut history = HistoryRecorder::new(25, 0.7);

        for _ in 0..5 {
            net.advance_epoch(&mut history).unwrap();

            let dump = net.synapses().diagnostic_dump(&mut std::io::sink()).unwrap();
            assert!(dump.is_consistent(), "violations: {:?}", dump.violations);
            assert_eq!(dump.occupied, net.synapses().total_synapses());
            assert_eq!(net.outgoing(), &OutgoingIndex::build(net.synapses()));
            for (n, &count) in net.synapses().synapse_counts.iter().enumerate() {
                assert!(count as usize <= net.synapses().max_per_neuron(), "neuron {n} over capacity");
            }
        }

        assert_eq!(history.epochs(), 5);
        let moved = (0..25).any(|i| {
            let trace = history.radius_trace(i);
            trace.first() != trace.last()
        });
        assert!(moved, "radii must respond to firing");

        let stats = net.stats();
        assert_eq!(stats.epoch, 5);
        assert_eq!(stats.n_synapses, net.synapses().total_synapses());
        let text = stats.to_string();
        assert!(text.contains("25 neurons"), "{text}");
    }

    #[test]
    fn toml_mirrored_run_resumes_on_host() {
        let config = SimConfig::from_toml_str(
            r#"
            width = 3
            height = 3
            max_synapses_per_neuron = 6
            epoch_duration = 0.03
            max_epochs = 2
            seed = 99
            backend = "mirrored"

            [neurons]
            i_inject = [15.0e-9, 16.0e-9]

            [growth]
            start_radius = 0.8
            "#,
        )
        .unwrap();
        let layout = GridLayout::new(3, 3);
        let mut mirrored = Network::new(config.clone(), &layout).unwrap();
        mirrored.simulate(&mut HistoryRecorder::new(9, 0.8)).unwrap();
        assert!(mirrored.synapses().total_synapses() > 0);

        let mut checkpoint = Vec::new();
        mirrored.save_memory(&mut checkpoint).unwrap();
        mirrored.teardown().unwrap();

        let host_config = SimConfig { backend: Backend::Host, ..config };
        let mut host = Network::new(host_config, &layout).unwrap();
        host.load_memory(checkpoint.as_slice()).unwrap();
        assert_eq!(host.tick(), mirrored.tick());
        assert_eq!(host.synapses().entity_count(), 54);

        let before = host.tick();
        host.advance_epoch(&mut HistoryRecorder::new(9, 0.8)).unwrap();
        assert_eq!(host.tick(), before + 300);
        assert_eq!(host.epoch(), 3);
    }
}
