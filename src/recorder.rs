//! Epoch snapshot sink.
//!
//! `EpochRecorder` decouples the network from whatever persists growth
//! history. The host passes an implementation to `Network::advance_epoch`.

/// Receives the radii and firing rates at the end of every growth epoch.
pub trait EpochRecorder {
    /// `epoch` counts from 1. Both slices hold one value per neuron.
    fn report_epoch_snapshot(&mut self, epoch: u32, radii: &[f32], rates: &[f32]);
}

/// Discards every snapshot.
pub struct NullRecorder;

impl EpochRecorder for NullRecorder {
    #[inline]
    fn report_epoch_snapshot(&mut self, _epoch: u32, _radii: &[f32], _rates: &[f32]) {}
}

/// Keeps every snapshot in memory, one row per epoch.
///
/// Row 0 holds the starting radii (and zero rates) so a history always has
/// `epochs + 1` rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryRecorder {
    pub radii: Vec<Vec<f32>>,
    pub rates: Vec<Vec<f32>>,
}

impl HistoryRecorder {
    pub fn new(neurons: usize, start_radius: f32) -> Self {
        Self {
            radii: vec![vec![start_radius; neurons]],
            rates: vec![vec![0.0; neurons]],
        }
    }

    /// Recorded epochs, excluding the starting row.
    pub fn epochs(&self) -> usize {
        self.radii.len().saturating_sub(1)
    }

    /// Radius of neuron `i` across all rows.
    pub fn radius_trace(&self, i: usize) -> Vec<f32> {
        self.radii.iter().map(|row| row[i]).collect()
    }
}

impl EpochRecorder for HistoryRecorder {
    fn report_epoch_snapshot(&mut self, epoch: u32, radii: &[f32], rates: &[f32]) {
        log::trace!("[RECORDER] epoch {epoch}: {} radii", radii.len());
        self.radii.push(radii.to_vec());
        self.rates.push(rates.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_starts_with_initial_row() {
        let mut h = HistoryRecorder::new(2, 0.4);
        assert_eq!(h.epochs(), 0);
        h.report_epoch_snapshot(1, &[0.5, 0.3], &[1.0, 4.0]);
        h.report_epoch_snapshot(2, &[0.6, 0.2], &[1.0, 5.0]);
        assert_eq!(h.epochs(), 2);
        assert_eq!(h.radius_trace(1), vec![0.4, 0.3, 0.2]);
        assert_eq!(h.rates[2], vec![1.0, 5.0]);
    }
}
