use log::{debug, info, warn};
use crate::config::SolverConfig;
use crate::error::Error;
use crate::flags::CellFlags;
use crate::lattice::{LatticeModel, MAX_DF};
use crate::level::{Level, AUX_FLUX};

/// Factor by which the step time grows or shrinks in one adaptation.
const ADAPT_FACTOR: f64 = 0.8;

/// Relative changes below this are not worth a rescale.
const ADAPT_MIN_CHANGE: f64 = 0.05;

/// Lower bounds for the Smagorinsky constant on the finest and the coarser
/// levels, with one or with several refinement levels.
const CSMAGO_ONE_LEVEL: (f64, f64) = (0.026, 0.029);
const CSMAGO_MANY_LEVELS: (f64, f64) = (0.028, 0.032);

/// Physical inputs reduced to lattice units on the finest level.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Parameters {
    /// Finest cell size in meters.
    pub cell_size: f64,
    /// Finest step time in seconds.
    pub step_time: f64,
    /// Lattice viscosity on the finest level.
    pub viscosity: f64,
    pub omega: f64,
    /// Gravity in lattice units, not yet divided by omega.
    pub gravity: [f64; 3],
}

// ============================================================================
impl Parameters {

    /**
     * Reduce the configuration to lattice units for a finest grid `size_x`
     * cells wide, using the given step time.
     */
    pub fn from_config(config: &SolverConfig, size_x: usize, step_time: f64) -> Result<Self, Error> {
        let dx = config.domain_size / size_x as f64;
        let viscosity = config.viscosity * step_time / (dx * dx);
        let omega = 1.0 / (3.0 * viscosity + 0.5);

        if !(omega > 0.0 && omega < 2.0) {
            return Err(Error::InvalidParameter(format!(
                "relaxation rate {} outside (0, 2) for viscosity {} and step time {}",
                omega, config.viscosity, step_time
            )));
        }
        let g = step_time * step_time / dx;

        Ok(Self {
            cell_size: dx,
            step_time,
            viscosity,
            omega,
            gravity: [config.gravity[0] * g, config.gravity[1] * g, config.gravity[2] * g],
        })
    }

    /// A velocity in m/s expressed in lattice units.
    pub fn lattice_velocity(&self, v: [f64; 3]) -> [f64; 3] {
        let s = self.step_time / self.cell_size;
        [v[0] * s, v[1] * s, v[2] * s]
    }
}

/// The relaxation rate of the next coarser level, which has twice the cell
/// size and step time.
pub fn coarser_omega(omega: f64) -> f64 {
    1.0 / (2.0 * (1.0 / omega - 0.5) + 0.5)
}

/// Smagorinsky constants for the finest and the coarser levels; with
/// refinement the model needs more damping.
pub fn smagorinsky_constants(csmago: f64, max_level: usize) -> (f64, f64) {
    if csmago <= 0.0 || max_level == 0 {
        return (csmago, csmago)
    }
    let (fine, coarse) = if max_level == 1 { CSMAGO_ONE_LEVEL } else { CSMAGO_MANY_LEVELS };
    (csmago.max(fine), csmago.max(coarse))
}

/// Derive omega, step time, gravity, cell size and viscosity of every level
/// from the finest level's parameters.
pub fn init_level_omegas(levels: &mut [Level], params: &Parameters, csmago: f64) {
    let max_level = levels.len() - 1;
    let (cs_fine, cs_coarse) = smagorinsky_constants(csmago, max_level);

    let mut omega = params.omega;
    let mut step = params.step_time;
    let mut size = params.cell_size;
    let mut gravity = [params.gravity[0] / omega, params.gravity[1] / omega, params.gravity[2] / omega];

    for (n, level) in levels.iter_mut().rev().enumerate() {
        if n > 0 {
            let coarse = coarser_omega(omega);
            for g in gravity.iter_mut() {
                *g = *g * omega * 2.0 / coarse;
            }
            omega = coarse;
            step *= 2.0;
            size *= 2.0;
        }
        level.omega = omega;
        level.time_step = step;
        level.node_size = size;
        level.gravity = gravity;
        level.nu = (1.0 / omega - 0.5) / 3.0;
        level.csmago = if n == 0 { cs_fine } else { cs_coarse };
        debug!(
            "level {}: omega={:.6} dt={:.3e} dx={:.3e} csmago={}",
            level.id, level.omega, level.time_step, level.node_size, level.csmago
        );
    }
}

// ============================================================================
/// Outcome of one time-step adaptation check.
///
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepDecision {
    /// The new finest step time when the levels must be rescaled.
    pub step_time: Option<f64>,
    /// The step time wanted to go below its floor: clamp velocities.
    pub brute_force: bool,
}

/**
 * Chooses step times from the observed maximum velocity. After every
 * rescale further increases are locked out for a while, so the step time
 * does not oscillate.
 */
#[derive(Clone, Debug, Default)]
pub struct TimeAdaptation {
    reduce_lock: usize,
    switches: u64,
    min_step_time: Option<f64>,
    max_step_time: Option<f64>,
}

impl TimeAdaptation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }

    pub fn reduce_lock(&self) -> usize {
        self.reduce_lock
    }

    /// Smallest and largest step times used so far.
    pub fn step_time_range(&self) -> Option<(f64, f64)> {
        self.min_step_time.zip(self.max_step_time)
    }

    /**
     * Decide on the next step time. `max_speed` is the largest lattice
     * speed of the last step and `gravity` the magnitude of the finest
     * level's gravity; `grid_size` is the finest grid's extents.
     */
    pub fn decide(&mut self, config: &SolverConfig, step_time: f64, max_speed: f64, gravity: f64, grid_size: [usize; 3]) -> StepDecision {
        let allow = config.max_lattice_speed;
        let next = max_speed + gravity;

        let mut new_step = if next > allow / ADAPT_FACTOR {
            step_time * ADAPT_FACTOR
        } else if next < allow * ADAPT_FACTOR {
            step_time / ADAPT_FACTOR
        } else {
            step_time
        };
        let mut brute_force = false;

        if new_step > config.max_step_time {
            new_step = config.max_step_time;
        }
        if new_step < config.min_step_time {
            new_step = config.min_step_time;
            brute_force = next > allow / ADAPT_FACTOR;
        }

        let worth_it = (new_step - step_time).abs() > step_time * ADAPT_MIN_CHANGE;
        let locked = new_step > step_time && self.reduce_lock > 0;
        let rescale = worth_it && !locked;

        if self.reduce_lock > 0 {
            self.reduce_lock -= 1;
        }
        if rescale {
            self.reduce_lock = 4 * (grid_size[0] + grid_size[1] + grid_size[2]) / 3;
            self.switches += 1;
            self.min_step_time = Some(self.min_step_time.map_or(new_step, |m| m.min(new_step)));
            self.max_step_time = Some(self.max_step_time.map_or(new_step, |m| m.max(new_step)));
            info!("step time change {:.4e} -> {:.4e} (max speed {:.4}, allowed {})", step_time, new_step, max_speed, allow);
        }
        if brute_force {
            warn!("step time reached its minimum {:.4e} with speed {:.4}", config.min_step_time, max_speed);
        }

        StepDecision {
            step_time: if rescale { Some(new_step) } else { None },
            brute_force,
        }
    }
}

/// The scaled quantities of one level after a rescale.
///
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RescaleTotals {
    pub mass_before: f64,
    pub mass_after: f64,
    pub volume_before: f64,
    pub volume_after: f64,
}

fn is_scaled(flag: CellFlags) -> bool {
    flag.intersects(CellFlags::FLUID | CellFlags::INTER | CellFlags::GR_FROM_COARSE | CellFlags::GR_FROM_FINE | CellFlags::GR_NORM)
}

/**
 * Rescale the current buffer of a level whose omega and step time have
 * already been updated. Density deviations from `rho_avg` and velocities
 * scale with `scale`; the non-equilibrium part is rescaled to the new
 * relaxation time. Interface cells keep their fill fraction.
 */
pub fn rescale_level(
    lattice: &LatticeModel,
    level: &mut Level,
    old_omega: f64,
    old_step_time: f64,
    scale: f64,
    rho_avg: f64,
    is_finest: bool,
) -> RescaleTotals {
    let n = lattice.num_df();
    let s = level.set_curr();
    let new_omega = level.omega;
    let new_step = level.time_step;
    let csmago = level.csmago;
    let cell_factor = level.cell_factor;
    let mut totals = RescaleTotals::default();

    for p in level.space().iter_interior() {
        let index = level.index(p);
        let flag = level.flag(s, index);
        if !is_scaled(flag) {
            continue;
        }
        let (rho_old, u_old) = lattice.moments(&level.cell(s, index)[..n]);
        let rho_new = (rho_old - rho_avg) * scale + rho_avg;
        let u_new = [u_old[0] * scale, u_old[1] * scale, u_old[2] * scale];

        let mut feq_old = [0.0; MAX_DF];
        let mut feq_new = [0.0; MAX_DF];
        lattice.equilibrium_into(rho_old, u_old, &mut feq_old[..n]);
        lattice.equilibrium_into(rho_new, u_new, &mut feq_new[..n]);

        let flux = level.cell(s, index)[n + AUX_FLUX];
        let cell = level.cell_mut(s, index);
        let q = lattice.noneq_stress(&cell[..n], &feq_old[..n]);
        let omega_old = lattice.les_omega(old_omega, csmago, q);
        let omega_new = lattice.les_omega(new_omega, csmago, q);
        let k = (new_step / omega_new) / (old_step_time / omega_old);

        for l in 0..n {
            cell[l] = feq_new[l] + (cell[l] - feq_old[l]) * k * feq_new[l] / feq_old[l];
        }

        if flag.intersects(CellFlags::INTER) {
            let area = if is_finest { 1.0 } else { flux };
            totals.mass_before += level.mass(s, index) * area;
            totals.volume_before += level.ffrac(s, index);
            let mass = level.mass(s, index) / rho_old * rho_new;
            level.set_mass(s, index, mass);
            level.set_ffrac(s, index, mass / rho_new);
            totals.mass_after += mass;
            totals.volume_after += mass / rho_new;
        } else if flag.intersects(CellFlags::FLUID) && !flag.intersects(CellFlags::GR_FROM_FINE | CellFlags::GR_FROM_COARSE) {
            let area = if is_finest { 1.0 } else { flux * cell_factor };
            totals.mass_before += rho_old * area;
            totals.mass_after += rho_new * area;
            totals.volume_before += area;
            totals.volume_after += area;
            level.set_mass(s, index, rho_new);
        }
    }
    totals
}

/// Clamp a level after the step time hit its floor: non-finite cells are
/// reset to rest and speeds above `allow` are scaled down to it. Returns
/// the number of clamped cells.
pub fn brute_force_level(lattice: &LatticeModel, level: &mut Level, allow: f64) -> usize {
    let n = lattice.num_df();
    let mut clamped = 0;

    for s in 0..2 {
        for p in level.space().iter_interior() {
            let index = level.index(p);
            if !is_scaled(level.flag(s, index)) {
                continue;
            }
            let (mut rho, mut u) = lattice.moments(&level.cell(s, index)[..n]);
            if !rho.is_finite() {
                warn!("non-finite density on level {} at {:?}", level.id, p);
                rho = 1.0;
                u = [0.0; 3];
                level.set_mass(s, index, 1.0);
                level.set_ffrac(s, index, 1.0);
                lattice.equilibrium_into(rho, u, &mut level.cell_mut(s, index)[..n]);
                clamped += 1;
                continue;
            }
            let usqr = u[0] * u[0] + u[1] * u[1] + u[2] * u[2];
            if usqr > allow * allow {
                let f = allow / usqr.sqrt();
                u = [u[0] * f, u[1] * f, u[2] * f];
                lattice.equilibrium_into(rho, u, &mut level.cell_mut(s, index)[..n]);
                clamped += 1;
            }
        }
    }
    if clamped > 0 {
        warn!("clamped {} cells on level {}", clamped, level.id);
    }
    clamped
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::index_space::IndexSpace;
    use crate::lattice::LatticeKind;

    fn lattice_config() -> SolverConfig {
        SolverConfig::in_lattice_units(LatticeKind::D2Q9, 32, 0.05, [0.0, -1e-4, 0.0])
    }

    #[test]
    fn lattice_unit_config_maps_to_itself() {
        let params = Parameters::from_config(&lattice_config(), 32, 1.0).unwrap();
        assert!((params.cell_size - 1.0).abs() < 1e-14);
        assert!((params.viscosity - 0.05).abs() < 1e-14);
        assert!((params.omega - 1.0 / 0.65).abs() < 1e-12);
        assert!((params.gravity[1] + 1e-4).abs() < 1e-16);
        assert_eq!(params.lattice_velocity([0.1, 0.0, 0.0]), [0.1, 0.0, 0.0]);
    }

    #[test]
    fn vanishing_viscosity_is_rejected() {
        let config = SolverConfig { viscosity: 0.0, ..lattice_config() };
        assert!(Parameters::from_config(&config, 32, 1.0).is_err());
    }

    #[test]
    fn coarse_levels_double_relaxation_time() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let fine_space = IndexSpace::new([16, 16, 1], 2).unwrap();
        let mut levels = vec![
            Level::allocate(0, 1, fine_space.coarsen(), &lattice).unwrap(),
            Level::allocate(1, 1, fine_space, &lattice).unwrap(),
        ];
        let params = Parameters::from_config(&lattice_config(), 16, 1.0).unwrap();
        init_level_omegas(&mut levels, &params, 0.0);

        let (coarse, fine) = (&levels[0], &levels[1]);
        assert_eq!(fine.omega, params.omega);
        assert_eq!(coarse.time_step, 2.0 * fine.time_step);
        assert!((1.0 / coarse.omega - (2.0 * (1.0 / fine.omega - 0.5) + 0.5)).abs() < 1e-12);
        assert!((coarse.nu - 2.0 * fine.nu).abs() < 1e-12);
        assert_eq!(coarse.node_size, 2.0 * fine.node_size);
        assert!((coarse.gravity[1] * coarse.omega - 2.0 * fine.gravity[1] * fine.omega).abs() < 1e-16);
    }

    #[test]
    fn refinement_raises_smagorinsky_constant() {
        assert_eq!(smagorinsky_constants(0.02, 0), (0.02, 0.02));
        assert_eq!(smagorinsky_constants(0.02, 1), (0.026, 0.029));
        assert_eq!(smagorinsky_constants(0.02, 3), (0.028, 0.032));
        assert_eq!(smagorinsky_constants(0.0, 3), (0.0, 0.0));
    }

    #[test]
    fn slow_flow_grows_step_until_locked() {
        let config = SolverConfig { max_step_time: 10.0, ..lattice_config() };
        let mut adapt = TimeAdaptation::new();
        let d = adapt.decide(&config, 1.0, 0.0, 0.0, [8, 8, 1]);
        assert_eq!(d.step_time, Some(1.0 / ADAPT_FACTOR));
        assert_eq!(adapt.switches(), 1);
        assert!(adapt.reduce_lock() > 0);

        let d = adapt.decide(&config, 1.25, 0.0, 0.0, [8, 8, 1]);
        assert_eq!(d.step_time, None);

        // reductions ignore the lock
        let d = adapt.decide(&config, 1.25, 0.5, 0.0, [8, 8, 1]);
        assert!((d.step_time.unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn step_floor_requests_brute_force() {
        let config = lattice_config();
        let mut adapt = TimeAdaptation::new();
        let d = adapt.decide(&config, config.min_step_time, 0.4, 0.0, [8, 8, 1]);
        assert!(d.brute_force);
        assert_eq!(d.step_time, None);
    }

    #[test]
    fn rescale_scales_velocity_and_keeps_mass() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let mut level = Level::allocate(0, 0, IndexSpace::new([6, 6, 1], 2).unwrap(), &lattice).unwrap();
        level.omega = 1.5;
        level.time_step = 1.0;
        let a = level.index([2, 2, 0]);
        let b = level.index([3, 2, 0]);
        let c = level.index([2, 3, 0]);
        let d = level.index([3, 3, 0]);
        level.init_cell(a, CellFlags::FLUID, &lattice, 1.0, 1.0, [0.04, 0.0, 0.0]);
        level.init_cell(b, CellFlags::INTER, &lattice, 1.0, 0.5, [0.0, 0.02, 0.0]);
        level.init_cell(c, CellFlags::FLUID, &lattice, 1.01, 1.01, [0.0; 3]);
        level.init_cell(d, CellFlags::FLUID, &lattice, 0.99, 0.99, [0.0; 3]);

        level.time_step = 0.8;
        level.omega = 1.0 / ((1.0 / 1.5 - 0.5) * 0.8 + 0.5);
        let totals = rescale_level(&lattice, &mut level, 1.5, 1.0, 0.8, 1.0, true);

        let s = level.set_curr();
        let (rho, u) = lattice.moments(&level.cell(s, a)[..9]);
        assert!((rho - 1.0).abs() < 1e-12);
        assert!((u[0] - 0.032).abs() < 1e-12);
        assert!((level.density(s, c) - 1.008).abs() < 1e-12);
        assert!((level.density(s, d) - 0.992).abs() < 1e-12);
        assert!((level.ffrac(s, b) - 0.5).abs() < 1e-12);
        assert!((totals.mass_before - 3.5).abs() < 1e-12);
        assert!((totals.mass_before - totals.mass_after).abs() < 1e-12);
        assert!((totals.volume_before - 3.5).abs() < 1e-12);
        assert!((totals.volume_before - totals.volume_after).abs() < 1e-12);
    }

    #[test]
    fn brute_force_clamps_fast_cells() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let mut level = Level::allocate(0, 0, IndexSpace::new([6, 6, 1], 2).unwrap(), &lattice).unwrap();
        let a = level.index([2, 2, 0]);
        level.init_cell(a, CellFlags::FLUID, &lattice, 1.0, 1.0, [0.3, 0.0, 0.0]);
        assert_eq!(brute_force_level(&lattice, &mut level, 0.1), 2);
        let (_, u) = lattice.moments(&level.cell(0, a)[..9]);
        assert!((u[0] - 0.1).abs() < 1e-12);
    }
}
