use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Throughput values above this come from steps too short to time.
const MLSUPS_CUTOFF: f64 = 10000.0;




/**
 * Running diagnostics of a simulation: cell counts, throughput in million
 * lattice site updates per second (MLSUPS), mass and volume, and counts of
 * surface and grid changes.
 */
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SimulationStats {
    pub steps: u64,
    pub used_cells: u64,
    pub interpolated_cells: u64,
    pub min_used_cells: u64,
    pub max_used_cells: u64,
    total_used_cells: u64,
    pub mlsups: Option<f64>,
    mlsups_sum: f64,
    mlsups_count: u64,
    pub initial_mass: f64,
    pub current_mass: f64,
    pub current_volume: f64,
    pub filled_cells: u64,
    pub emptied_cells: u64,
    pub grid_changes: u64,
    pub time_switches: u64,
    pub warnings: u64,
    pub clamped_cells: u64,
}




// ============================================================================
impl SimulationStats {

    /**
     * Record the cell counts and the wall time of one step.
     */
    pub fn record_step(&mut self, used_cells: u64, interpolated_cells: u64, elapsed: Duration) {
        let used = used_cells + interpolated_cells;
        self.steps += 1;
        self.used_cells = used;
        self.interpolated_cells = interpolated_cells;
        self.total_used_cells += used;

        if self.steps == 1 {
            self.min_used_cells = used;
            self.max_used_cells = used;
        } else {
            self.min_used_cells = self.min_used_cells.min(used);
            self.max_used_cells = self.max_used_cells.max(used);
        }

        let seconds = elapsed.as_secs_f64();
        let mlsups = if seconds > 0.0 { used as f64 / seconds * 1e-6 } else { f64::INFINITY };
        if mlsups < MLSUPS_CUTOFF {
            self.mlsups = Some(mlsups);
            self.mlsups_sum += mlsups;
            self.mlsups_count += 1;
        } else {
            self.mlsups = None;
        }
    }

    pub fn average_used_cells(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.total_used_cells as f64 / self.steps as f64
        }
    }

    pub fn average_mlsups(&self) -> Option<f64> {
        if self.mlsups_count == 0 {
            None
        } else {
            Some(self.mlsups_sum / self.mlsups_count as f64)
        }
    }

    /// Relative difference between the current and the initial mass.
    pub fn mass_drift(&self) -> f64 {
        if self.initial_mass == 0.0 {
            0.0
        } else {
            (self.current_mass - self.initial_mass) / self.initial_mass
        }
    }
}

impl fmt::Display for SimulationStats {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            fmt,
            "step {} cells {} (avg {:.0}) mlsups {:.3} (avg {:.3}) mass {:.6} (drift {:+.2e}) vol {:.3} filled {} emptied {} ts {}",
            self.steps,
            self.used_cells,
            self.average_used_cells(),
            self.mlsups.unwrap_or(0.0),
            self.average_mlsups().unwrap_or(0.0),
            self.current_mass,
            self.mass_drift(),
            self.current_volume,
            self.filled_cells,
            self.emptied_cells,
            self.time_switches,
        )
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cell_counts_track_extremes() {
        let mut stats = SimulationStats::default();
        stats.record_step(100, 10, Duration::from_millis(2));
        stats.record_step(50, 0, Duration::from_millis(2));
        stats.record_step(200, 0, Duration::from_millis(2));
        assert_eq!(stats.min_used_cells, 50);
        assert_eq!(stats.max_used_cells, 200);
        assert_eq!(stats.used_cells, 200);
        assert!((stats.average_used_cells() - 120.0).abs() < 1e-12);
        assert!((stats.mlsups.unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn instantaneous_steps_are_not_averaged() {
        let mut stats = SimulationStats::default();
        stats.record_step(100, 0, Duration::from_secs(0));
        assert!(stats.mlsups.is_none());
        assert!(stats.average_mlsups().is_none());
    }

    #[test]
    fn drift_is_relative() {
        let stats = SimulationStats { initial_mass: 200.0, current_mass: 201.0, ..SimulationStats::default() };
        assert!((stats.mass_drift() - 0.005).abs() < 1e-12);
    }
}
