//! Orientation histogram over plane-normal angles.
//!
//! A B x B bin grid over the spherical angles of cell normals. The densest
//! bin seeds the region growing; consumed cells are removed so a bin drains
//! as its plane grows.

/// 2D angular histogram with per-cell bin assignment.
#[derive(Clone, Debug)]
pub struct OrientationHistogram {
    bins_per_coordinate: usize,
    /// Occupancy per bin.
    counts: Vec<u32>,
    /// Bin of each cell; `None` marks unassigned or removed cells.
    cell_bins: Vec<Option<usize>>,
}

impl OrientationHistogram {
    pub fn new(bins_per_coordinate: usize) -> Self {
        Self {
            bins_per_coordinate,
            counts: vec![0; bins_per_coordinate * bins_per_coordinate],
            cell_bins: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.counts.fill(0);
        self.cell_bins.clear();
    }

    /// Assign a bin to every flagged cell from its normal angles
    /// `(theta, phi)` with `theta` in [0, pi] and `phi` in [-pi, pi].
    ///
    /// Near `theta = 0` every `phi` describes the same normal, so the
    /// phi-bin is forced to 0 to keep degenerate normals from seeding
    /// spurious wraparound bins.
    pub fn init(&mut self, angles: &[(f64, f64)], is_planar: &[bool]) {
        debug_assert_eq!(angles.len(), is_planar.len());
        let bins = self.bins_per_coordinate;
        self.cell_bins = vec![None; angles.len()];

        for (cell, &(theta, phi)) in angles.iter().enumerate() {
            if !is_planar[cell] {
                continue;
            }
            let theta_bin = ((bins - 1) as f64 * theta / std::f64::consts::PI) as usize;
            let phi_bin = if theta_bin > 0 {
                ((bins - 1) as f64 * (phi + std::f64::consts::PI)
                    / (2.0 * std::f64::consts::PI)) as usize
            } else {
                0
            };

            let bin = (phi_bin.min(bins - 1)) * bins + theta_bin.min(bins - 1);
            self.cell_bins[cell] = Some(bin);
            self.counts[bin] += 1;
        }
    }

    /// All cell indices in the densest bin; ties break toward the lowest
    /// bin index. Empty when the histogram has drained.
    pub fn most_frequent_bin(&self) -> Vec<usize> {
        let mut best_bin = None;
        let mut best_count = 0;
        for (bin, &count) in self.counts.iter().enumerate() {
            if count > best_count {
                best_bin = Some(bin);
                best_count = count;
            }
        }

        match best_bin {
            Some(bin) => self
                .cell_bins
                .iter()
                .enumerate()
                .filter(|(_, cell_bin)| **cell_bin == Some(bin))
                .map(|(cell, _)| cell)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Remove a cell from its bin. Idempotent: removing twice is a no-op.
    pub fn remove(&mut self, cell: usize) {
        if cell >= self.cell_bins.len() {
            return;
        }
        if let Some(bin) = self.cell_bins[cell].take() {
            self.counts[bin] = self.counts[bin].saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn densest_bin_wins() {
        let mut histogram = OrientationHistogram::new(20);
        // three cells share an orientation, one differs
        let angles = vec![(1.0, 0.5), (1.0, 0.5), (1.0, 0.5), (2.0, -2.0)];
        histogram.init(&angles, &[true, true, true, true]);

        let seeds = histogram.most_frequent_bin();
        assert_eq!(seeds, vec![0, 1, 2]);
    }

    #[test]
    fn non_planar_cells_are_ignored() {
        let mut histogram = OrientationHistogram::new(20);
        let angles = vec![(1.0, 0.5), (1.0, 0.5)];
        histogram.init(&angles, &[true, false]);

        assert_eq!(histogram.most_frequent_bin(), vec![0]);
    }

    #[test]
    fn removal_drains_the_bin_and_is_idempotent() {
        let mut histogram = OrientationHistogram::new(20);
        let angles = vec![(1.0, 0.5), (1.0, 0.5)];
        histogram.init(&angles, &[true, true]);

        histogram.remove(0);
        histogram.remove(0); // second removal is a no-op
        assert_eq!(histogram.most_frequent_bin(), vec![1]);

        histogram.remove(1);
        assert!(histogram.most_frequent_bin().is_empty());
    }

    #[test]
    fn degenerate_theta_forces_phi_bin_to_zero() {
        let mut histogram = OrientationHistogram::new(20);
        // theta ~ 0 with wildly different phi must land in one bin
        let angles = vec![(0.0, -3.0), (0.0, 3.0)];
        histogram.init(&angles, &[true, true]);

        let seeds = histogram.most_frequent_bin();
        assert_eq!(seeds.len(), 2);
    }

    #[test]
    fn empty_histogram_returns_no_seeds() {
        let histogram = OrientationHistogram::new(20);
        assert!(histogram.most_frequent_bin().is_empty());
    }
}
