use std::time::Instant;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use crate::config::SolverConfig;
use crate::controller::{self, Parameters, TimeAdaptation};
use crate::error::Error;
use crate::flags::{CellFlags, CellType};
use crate::free_surface;
use crate::geometry::{GeometryInput, ObjectTable, Obstacle, VoxelTag};
use crate::index_space::IndexSpace;
use crate::isofield::IsoField;
use crate::kernel::{self, SweepContext, SweepTotals};
use crate::lattice::LatticeModel;
use crate::level::{Buffer, Level};
use crate::refinement::{Interpolation, Refiner};
use crate::stats::SimulationStats;

/// Smallest extent of the coarsest level along an active axis.
const MIN_COARSE_SIZE: usize = 4;

/// Refine / coarsen / restrict rounds per level pair during start-up.
const INITIAL_COARSENING_ROUNDS: usize = 2;




/// The cell that broke an invariant and brought the solver to a halt.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PanicInfo {
    pub level: usize,
    pub cell: [usize; 3],
    pub reason: String,
}

impl PanicInfo {
    fn to_error(&self) -> Error {
        Error::Panic {
            level: self.level,
            cell: self.cell,
            reason: self.reason.clone(),
        }
    }
}




/**
 * The global scalars of a running simulation. `fix_mass` holds mass that
 * could not be handed to a neighbor yet; it is spread over the interface
 * during the next flag reinitialization.
 */
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SimulationState {
    pub step_count: u64,
    pub time: f64,
    pub initial_mass: f64,
    pub current_mass: f64,
    pub current_volume: f64,
    pub fix_mass: f64,
    pub max_velocity: [f64; 3],
    pub max_speed: f64,
    pub panic: Option<PanicInfo>,
}




/**
 * Owns the level hierarchy and drives it: the init pipeline, one
 * multi-level time step at a time, the time-step adaptation, and cell
 * queries for the surrounding application.
 */
pub struct Solver {
    pub(crate) config: SolverConfig,
    pub(crate) lattice: LatticeModel,
    pub(crate) obstacles: Vec<Obstacle>,
    pub(crate) objects: ObjectTable,
    pub(crate) params: Parameters,
    pub(crate) levels: Vec<Level>,
    pub(crate) refiner: Refiner,
    pub(crate) adaptation: TimeAdaptation,
    pub(crate) state: SimulationState,
    pub(crate) stats: SimulationStats,
}




/// The index spaces of all levels, coarsest first. Every active axis of the
/// finest grid must be divisible by `2^max_refine` and leave a coarsest
/// level of at least `MIN_COARSE_SIZE` cells.
pub(crate) fn level_spaces(max_refine: usize, finest: IndexSpace) -> Result<Vec<IndexSpace>, Error> {
    let factor = 1 << max_refine;
    let size = finest.size();

    for axis in 0..finest.dim() {
        if size[axis] % factor != 0 {
            return Err(Error::GridSize { axis, size: size[axis], reason: "not divisible by 2^max_refine" });
        }
        if size[axis] / factor < MIN_COARSE_SIZE {
            return Err(Error::GridSize { axis, size: size[axis], reason: "too small for the requested refinement" });
        }
    }
    let mut spaces = vec![finest];

    for _ in 0..max_refine {
        let coarse = spaces[spaces.len() - 1].coarsen();
        spaces.push(coarse);
    }
    spaces.reverse();
    Ok(spaces)
}




// ============================================================================
impl Solver {

    /**
     * Set up the level hierarchy for a voxelized domain: allocate and
     * classify the levels, build the interface around the initial fluid,
     * optionally settle a hydrostatic pressure gradient, record the initial
     * mass, and let the coarse levels take over the bulk fluid.
     */
    pub fn new(config: SolverConfig, geometry: &GeometryInput) -> Result<Self, Error> {
        config.validate()?;
        geometry.validate()?;

        let lattice = LatticeModel::new(config.lattice);
        let finest = geometry.space();

        if finest.dim() != lattice.dimension() {
            return Err(Error::Geometry(format!(
                "{}d geometry given to a {}d lattice",
                finest.dim(),
                lattice.dimension()
            )));
        }
        let max_level = config.max_refine;
        let levels = level_spaces(max_level, finest)?
            .into_iter()
            .enumerate()
            .map(|(id, space)| Level::allocate(id, max_level, space, &lattice))
            .collect::<Result<Vec<_>, _>>()?;

        let params = Parameters::from_config(&config, finest.size()[0], config.step_time)?;
        let obstacles = geometry.objects().to_vec();
        let objects = ObjectTable::new(&obstacles, config.domain_boundary, |v| params.lattice_velocity(v));
        let refiner = Refiner::new(&lattice);

        let mut solver = Self {
            config,
            lattice,
            obstacles,
            objects,
            params,
            levels,
            refiner,
            adaptation: TimeAdaptation::new(),
            state: SimulationState { step_count: 1, ..SimulationState::default() },
            stats: SimulationStats::default(),
        };
        controller::init_level_omegas(&mut solver.levels, &solver.params, solver.config.smagorinsky);

        solver.init_finest_cells(geometry);
        solver.init_coarse_cells();

        let finest = &mut solver.levels[max_level];
        free_surface::init_free_surfaces(&solver.lattice, finest, solver.config.interface_fill);

        if solver.config.surface_smoothing > 0 {
            free_surface::smooth_surface(&solver.lattice, finest, solver.config.surface_smoothing);
        }
        solver.mark_wall_distance();

        if solver.config.standing_fluid {
            solver.init_standing_fluid();
        }
        solver.state.initial_mass = solver.fluid_mass();
        solver.state.current_mass = solver.state.initial_mass;
        solver.stats.initial_mass = solver.state.initial_mass;
        solver.stats.current_mass = solver.state.initial_mass;
        solver.initial_coarsening();

        for level in &mut solver.levels {
            level.copy_flags_to_other();
        }
        info!(
            "{} levels, finest {:?}, omega {:.4}, dt {:.3e} s, dx {:.3e} m, initial mass {:.4}",
            solver.levels.len(),
            solver.levels[max_level].space().size(),
            solver.params.omega,
            solver.params.step_time,
            solver.params.cell_size,
            solver.state.initial_mass,
        );
        Ok(solver)
    }

    /**
     * Advance the simulation by one finest-level step. Level `lev` takes a
     * step when bit `max_level - lev` of `step ^ (step - 1)` is set, so each
     * coarser level steps half as often. Before a coarse level steps, the
     * grid is adapted against its finer neighbor and the fine state is
     * restricted onto it.
     */
    pub fn step(&mut self) -> Result<(), Error> {
        if let Some(panic) = &self.state.panic {
            return Err(panic.to_error());
        }
        let start = Instant::now();
        let max_level = self.max_level();
        let step = self.state.step_count;
        let dsbits = step ^ (step - 1);

        self.state.current_mass = self.state.fix_mass;
        self.state.current_volume = 0.0;
        self.state.max_speed = 0.0;
        self.state.max_velocity = [0.0; 3];

        let mut used = 0;
        let mut interpolated = 0;

        for lev in 0..=max_level {
            if dsbits & (1 << (max_level - lev)) != 0 {
                let totals = if lev == max_level {
                    self.fine_advance(dsbits)?
                } else {
                    self.coarse_pass(lev, dsbits)
                };
                used += totals.used_cells;
                interpolated += totals.interpolated_cells;
                self.record_sweep(lev, &totals)?;
            }
            self.state.current_mass += self.levels[lev].lmass;
            self.state.current_volume += self.levels[lev].lvolume;
        }
        self.state.step_count += 1;

        if self.config.strict_checks {
            self.check_flags()?;
        }
        self.stats.record_step(used, interpolated, start.elapsed());
        self.stats.current_mass = self.state.current_mass;
        self.stats.current_volume = self.state.current_volume;

        if self.config.time_adaptation {
            self.adapt_timestep()?;
        }
        Ok(())
    }

    /**
     * Change the finest step time and rescale every level to it: parameters,
     * object speeds and level omegas are recomputed, then the distributions
     * of the current buffers are rescaled, finest level first.
     */
    pub fn rescale_step_time(&mut self, step_time: f64) -> Result<(), Error> {
        if !(step_time.is_finite() && step_time > 0.0) {
            return Err(Error::InvalidParameter(format!("step time {} is not positive", step_time)));
        }
        let max_level = self.max_level();
        let size_x = self.levels[max_level].space().size()[0];
        let params = Parameters::from_config(&self.config, size_x, step_time)?;
        let old: Vec<(f64, f64)> = self.levels.iter().map(|level| (level.omega, level.time_step)).collect();
        let scale = step_time / self.params.step_time;
        let rho_avg = if self.state.current_volume > 0.0 {
            self.state.current_mass / self.state.current_volume
        } else {
            1.0
        };

        self.params = params;
        self.objects = ObjectTable::new(&self.obstacles, self.config.domain_boundary, |v| params.lattice_velocity(v));
        controller::init_level_omegas(&mut self.levels, &self.params, self.config.smagorinsky);

        for lev in (0..=max_level).rev() {
            if lev != max_level {
                self.refiner.coarse_calculate_flux_areas(&self.lattice, &mut self.levels, lev);
            }
            let (omega, dt) = old[lev];
            let totals = controller::rescale_level(&self.lattice, &mut self.levels[lev], omega, dt, scale, rho_avg, lev == max_level);
            debug!(
                "rescaled level {}: mass {:.4} -> {:.4}, volume {:.2} -> {:.2}",
                lev, totals.mass_before, totals.mass_after, totals.volume_before, totals.volume_after
            );
        }
        info!("step time {:.4e} s, omega {:.5}", self.params.step_time, self.params.omega);
        Ok(())
    }

    fn adapt_timestep(&mut self) -> Result<(), Error> {
        let finest = &self.levels[self.max_level()];
        let g = finest.gravity;
        let gravity = (g[0] * g[0] + g[1] * g[1] + g[2] * g[2]).sqrt();
        let decision = self.adaptation.decide(
            &self.config,
            self.params.step_time,
            self.state.max_speed,
            gravity,
            finest.space().size(),
        );

        if let Some(step_time) = decision.step_time {
            self.rescale_step_time(step_time)?;
        }
        if decision.brute_force {
            for level in &mut self.levels {
                self.stats.clamped_cells += controller::brute_force_level(&self.lattice, level, self.config.max_lattice_speed) as u64;
            }
        }
        self.stats.time_switches = self.adaptation.switches();
        Ok(())
    }
}




// ============================================================================
impl Solver {
    fn max_level(&self) -> usize {
        self.levels.len() - 1
    }

    /// How FromCoarse cells of level `lev` are filled in a step with the
    /// given `dsbits`. Time blending only applies when the coarser level did
    /// not step together with this one.
    fn interpolation(&self, lev: usize, dsbits: u64) -> Interpolation {
        let max_level = self.max_level();
        let coarse_stepped = lev == 0 || dsbits & (1 << (max_level + 1 - lev)) != 0;
        let time_blend = if self.config.time_interpolation && !coarse_stepped { 0.5 } else { 0.0 };

        Interpolation {
            order: self.config.interpolation_order,
            time_blend,
        }
    }

    fn fine_advance(&mut self, dsbits: u64) -> Result<SweepTotals, Error> {
        let max_level = self.max_level();
        let interpolation = self.interpolation(max_level, dsbits);
        let ctx = SweepContext {
            lattice: &self.lattice,
            objects: &self.objects,
            interpolation,
        };
        let (lower, upper) = self.levels.split_at_mut(max_level);
        let level = &mut upper[0];
        let mut totals = kernel::fine_sweep(&ctx, lower.last(), level);

        level.swap();
        level.lsteps += 1;
        level.time += level.time_step;
        level.lmass = totals.mass;
        level.lvolume = totals.volume;

        self.state.time += self.params.step_time;
        self.state.initial_mass += totals.initial_mass_delta;
        self.stats.initial_mass += totals.initial_mass_delta;

        let filled = std::mem::take(&mut totals.filled);
        let emptied = std::mem::take(&mut totals.emptied);
        let report = free_surface::reinit_flags(&self.lattice, &mut self.levels[max_level], filled, emptied, &mut self.state.fix_mass);
        self.stats.filled_cells += report.filled as u64;
        self.stats.emptied_cells += report.emptied as u64;
        Ok(totals)
    }

    fn coarse_pass(&mut self, lev: usize, dsbits: u64) -> SweepTotals {
        let max_level = self.max_level();
        let refine = Interpolation { time_blend: 0.0, ..self.interpolation(lev + 1, dsbits) };

        let refined = self.refiner.perform_refinement(&self.lattice, &mut self.levels, lev, max_level, refine);
        let coarsened = self.refiner.perform_coarsening(&self.lattice, &mut self.levels, lev, max_level, &mut self.state.fix_mass);
        self.refiner.coarse_restrict_from_fine(&self.lattice, &mut self.levels, lev);
        self.stats.grid_changes += (refined + coarsened) as u64;

        if refined + coarsened > 0 {
            debug!("level {}: {} cells refined, {} coarsened", lev, refined, coarsened);
        }
        let interpolation = self.interpolation(lev, dsbits);
        self.refiner.coarse_advance(&self.lattice, &self.objects, &mut self.levels, lev, interpolation)
    }

    fn record_sweep(&mut self, lev: usize, totals: &SweepTotals) -> Result<(), Error> {
        let speed = totals.max_usqr.sqrt();

        if speed > self.state.max_speed {
            self.state.max_speed = speed;
            self.state.max_velocity = totals.max_velocity;
        }
        self.stats.warnings += totals.warnings;

        if let Some(violation) = &totals.violation {
            let cell = self.levels[lev].space().coords(violation.index);

            if self.config.strict_checks {
                return Err(self.halt(lev, cell, violation.reason.clone()));
            }
            warn!("level {} cell {:?}: {}", lev, cell, violation.reason);
        }
        Ok(())
    }

    /// Enter the panic state; every later step returns the same error.
    fn halt(&mut self, level: usize, cell: [usize; 3], reason: String) -> Error {
        error!("level {} cell {:?}: {}", level, cell, reason);
        let panic = PanicInfo { level, cell, reason };
        let error = panic.to_error();
        self.state.panic = Some(panic);
        error
    }

    /// Every cell of every level's current buffer has exactly one base type
    /// and at most one refinement role.
    fn check_flags(&mut self) -> Result<(), Error> {
        let mut broken = None;

        'levels: for level in &self.levels {
            let s = level.set_curr();
            for p in level.space().iter() {
                let flag = level.flag(s, level.index(p));
                if !flag.is_consistent() {
                    broken = Some((level.id, p, format!("inconsistent flags {:?}", flag)));
                    break 'levels;
                }
            }
        }
        match broken {
            Some((lev, cell, reason)) => Err(self.halt(lev, cell, reason)),
            None => Ok(()),
        }
    }
}




// ============================================================================
impl Solver {

    /// Classify the finest level from the voxel tags. The outer cell layer
    /// always belongs to the domain boundary.
    fn init_finest_cells(&mut self, geometry: &GeometryInput) {
        let max_level = self.max_level();
        let domain = self.config.domain_boundary.flags().with_object(self.objects.domain_id());
        let lattice = &self.lattice;
        let objects = &self.objects;
        let level = &mut self.levels[max_level];
        let space = level.space();

        for p in space.iter() {
            let index = level.index(p);
            let tag = geometry.get(p);

            if !space.is_interior(p) {
                level.init_cell(index, domain, lattice, 1.0, 0.0, [0.0; 3]);
                continue;
            }
            let flag = geometry.initial_flag(tag);
            let u = match tag {
                VoxelTag::Inflow(id) => objects.speed(id),
                _ => [0.0; 3],
            };
            let mass = if flag.intersects(CellFlags::FLUID) { 1.0 } else { 0.0 };
            level.init_cell(index, flag, lattice, 1.0, mass, u);
        }
    }

    /// Coarse levels start out empty, with the obstacles of the finer level
    /// sampled at the fine centers and the domain boundary around them.
    fn init_coarse_cells(&mut self) {
        let max_level = self.max_level();
        let domain = self.config.domain_boundary.flags().with_object(self.objects.domain_id());

        for lev in (0..max_level).rev() {
            let (lower, upper) = self.levels.split_at_mut(lev + 1);
            let coarse = &mut lower[lev];
            let fine = &upper[0];
            let fs = fine.set_curr();
            let space = coarse.space();

            for p in space.iter() {
                let index = coarse.index(p);
                let center = fine.flag(fs, fine.index([2 * p[0], 2 * p[1], 2 * p[2]]));
                let flag = if !space.is_interior(p) {
                    domain
                } else if center.intersects(CellFlags::BND) {
                    center
                } else {
                    CellFlags::EMPTY
                };
                coarse.init_cell(index, flag, &self.lattice, 1.0, 0.0, [0.0; 3]);
            }
        }
    }

    /// Mark the finest fluid cells without a boundary neighbor; only those
    /// can lie beneath a coarse cell fed by restriction.
    fn mark_wall_distance(&mut self) {
        let max_level = self.max_level();
        let num_df = self.lattice.num_df();
        let level = &mut self.levels[max_level];
        let s = level.set_curr();

        for p in level.space().iter_interior() {
            let index = level.index(p);
            if !level.flag(s, index).intersects(CellFlags::FLUID) {
                continue;
            }
            let near_wall = (1..num_df).any(|l| level.flag(s, level.neighbor(index, l)).intersects(CellFlags::BND));
            if near_wall {
                level.remove_flag(s, index, CellFlags::NO_BND_FLUID);
            } else {
                level.insert_flag(s, index, CellFlags::NO_BND_FLUID);
            }
        }
        level.copy_flags_to_other();
    }

    /**
     * Give resting fluid the hydrostatic density profile along the dominant
     * gravity axis, measured from the lowest row that contains a surface,
     * and relax the fluid cells for a few steps so the profile settles.
     */
    fn init_standing_fluid(&mut self) {
        let max_level = self.max_level();
        let n = self.lattice.num_df();
        let level = &mut self.levels[max_level];
        let g = level.gravity;
        let axis = (0..3).fold(0, |a, b| if g[b].abs() > g[a].abs() { b } else { a });

        if g[axis] == 0.0 {
            return;
        }
        let space = level.space();
        let extent = space.size()[axis];
        let height = |p: [usize; 3]| if g[axis] < 0.0 { p[axis] } else { extent - 1 - p[axis] };
        let s = level.set_curr();

        let surface = space
            .iter_interior()
            .filter(|&p| level.flag(s, level.index(p)).intersects(CellFlags::INTER | CellFlags::EMPTY))
            .map(|p| height(p))
            .min();

        let surface = match surface {
            Some(surface) if surface > 1 => surface,
            _ => return,
        };
        let fluid_height = (surface + 1) as f64;
        let g_lattice = g[axis].abs() * level.omega;

        for p in space.iter_interior() {
            let index = level.index(p);
            let h = height(p);
            if h > surface || !level.flag(s, index).intersects(CellFlags::FLUID | CellFlags::INTER) {
                continue;
            }
            let rho = 1.0 + (fluid_height - h as f64) * g_lattice * 3.0;
            let mass = level.mass(s, index) * rho;
            for df in &mut level.cell_mut(s, index)[..n] {
                *df *= rho;
            }
            level.set_mass(s, index, mass);
        }

        let steps = surface >> 2;
        let ctx = SweepContext {
            lattice: &self.lattice,
            objects: &self.objects,
            interpolation: Interpolation { order: 1, time_blend: 0.0 },
        };
        for _ in 0..steps {
            kernel::relax_fluid(&ctx, level);
            level.swap();
        }
        info!("standing fluid {} cells deep, {} pre-relaxation steps", surface, steps);
    }

    /// Let the coarse levels take over the bulk fluid before the first step,
    /// working from the finest level pair down.
    fn initial_coarsening(&mut self) {
        let max_level = self.max_level();
        let interpolation = Interpolation {
            order: self.config.interpolation_order,
            time_blend: 0.0,
        };
        let mut changes = 0;

        for lev in (0..max_level).rev() {
            for _ in 0..INITIAL_COARSENING_ROUNDS {
                changes += self.refiner.perform_refinement(&self.lattice, &mut self.levels, lev, max_level, interpolation);
                changes += self.refiner.perform_coarsening(&self.lattice, &mut self.levels, lev, max_level, &mut self.state.fix_mass);
                self.refiner.coarse_restrict_from_fine(&self.lattice, &mut self.levels, lev);
            }
        }
        if max_level > 0 {
            debug!("initial coarsening changed {} cells", changes);
        }
    }
}




// ============================================================================
impl Solver {
    fn locate(&self, lev: usize, p: [usize; 3], buffer: Buffer) -> Result<(&Level, usize, usize), Error> {
        let level = self
            .levels
            .get(lev)
            .ok_or_else(|| Error::InvalidParameter(format!("no level {} (finest is {})", lev, self.max_level())))?;
        let size = level.space().size();

        if (0..3).any(|axis| p[axis] >= size[axis]) {
            return Err(Error::InvalidParameter(format!("cell {:?} outside level {} of size {:?}", p, lev, size)));
        }
        Ok((level, level.buffer(buffer), level.index(p)))
    }

    pub fn density(&self, lev: usize, p: [usize; 3], buffer: Buffer) -> Result<f64, Error> {
        let (level, s, index) = self.locate(lev, p, buffer)?;
        Ok(level.density(s, index))
    }

    /// The lattice velocity of a cell, `sum(f_l e_l)` in the incompressible
    /// model.
    pub fn velocity(&self, lev: usize, p: [usize; 3], buffer: Buffer) -> Result<[f64; 3], Error> {
        let (level, s, index) = self.locate(lev, p, buffer)?;
        Ok(self.lattice.moments(&level.cell(s, index)[..self.lattice.num_df()]).1)
    }

    pub fn fill_fraction(&self, lev: usize, p: [usize; 3], buffer: Buffer) -> Result<f64, Error> {
        let (level, s, index) = self.locate(lev, p, buffer)?;
        Ok(level.ffrac(s, index))
    }

    pub fn mass(&self, lev: usize, p: [usize; 3], buffer: Buffer) -> Result<f64, Error> {
        let (level, s, index) = self.locate(lev, p, buffer)?;
        Ok(level.mass(s, index))
    }

    pub fn df(&self, lev: usize, p: [usize; 3], l: usize, buffer: Buffer) -> Result<f64, Error> {
        if l >= self.lattice.num_df() {
            return Err(Error::InvalidParameter(format!("direction {} of a {}-direction lattice", l, self.lattice.num_df())));
        }
        let (level, s, index) = self.locate(lev, p, buffer)?;
        Ok(level.cell(s, index)[l])
    }

    pub fn flag(&self, lev: usize, p: [usize; 3], buffer: Buffer) -> Result<CellFlags, Error> {
        let (level, s, index) = self.locate(lev, p, buffer)?;
        Ok(level.flag(s, index))
    }

    pub fn cell_type(&self, lev: usize, p: [usize; 3], buffer: Buffer) -> Result<Option<CellType>, Error> {
        Ok(self.flag(lev, p, buffer)?.cell_type())
    }

    /// The mass tracked during the last step, including the pending
    /// correction.
    pub fn total_mass(&self) -> f64 {
        self.state.current_mass
    }

    /**
     * The mass held by the finest level right now: fluid density plus
     * interface mass of the current buffer, plus the pending correction.
     * Exact on a single level; with refinement the coarse levels hold the
     * mass of the bulk fluid instead.
     */
    pub fn fluid_mass(&self) -> f64 {
        let level = &self.levels[self.max_level()];
        let s = level.set_curr();
        let mut mass = self.state.fix_mass;

        for p in level.space().iter_interior() {
            let index = level.index(p);
            let flag = level.flag(s, index);
            if flag.intersects(CellFlags::GR_FROM_COARSE) {
                continue;
            }
            if flag.intersects(CellFlags::FLUID) {
                mass += level.density(s, index);
            } else if flag.intersects(CellFlags::INTER) {
                mass += level.mass(s, index);
            }
        }
        mass
    }

    /// Center of the liquid volume on the finest level, in cell units.
    pub fn center_of_mass(&self) -> [f64; 3] {
        let level = &self.levels[self.max_level()];
        let s = level.set_curr();
        let mut weight = 0.0;
        let mut sum = [0.0; 3];

        for p in level.space().iter_interior() {
            let index = level.index(p);
            let flag = level.flag(s, index);
            let w = if flag.intersects(CellFlags::FLUID) {
                1.0
            } else if flag.intersects(CellFlags::INTER) {
                level.ffrac(s, index)
            } else {
                0.0
            };
            weight += w;
            for axis in 0..3 {
                sum[axis] += w * p[axis] as f64;
            }
        }
        if weight == 0.0 {
            return [0.0; 3];
        }
        [sum[0] / weight, sum[1] / weight, sum[2] / weight]
    }

    pub fn iso_field(&self) -> IsoField {
        IsoField::from_level(&self.levels[self.max_level()], self.config.iso_weight_method)
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn lattice(&self) -> &LatticeModel {
        &self.lattice
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::BoundaryKind;
    use crate::lattice::LatticeKind;

    fn dam_break(size: [usize; 3], fluid_hi: [usize; 3], gravity: f64) -> (SolverConfig, GeometryInput) {
        let config = SolverConfig::in_lattice_units(LatticeKind::D2Q9, size[0], 0.02, [0.0, -gravity, 0.0]);
        let mut geometry = GeometryInput::new(size, 2).unwrap();
        geometry.fill_box([1, 1, 0], fluid_hi, VoxelTag::Fluid);
        (config, geometry)
    }

    #[test]
    fn grid_must_divide_by_the_refinement_factor() {
        let space = IndexSpace::new([30, 32, 1], 2).unwrap();
        assert!(matches!(level_spaces(2, space), Err(Error::GridSize { axis: 0, .. })));
        assert!(matches!(level_spaces(4, IndexSpace::new([32, 32, 1], 2).unwrap()), Err(Error::GridSize { .. })));

        let spaces = level_spaces(2, IndexSpace::new([32, 64, 1], 2).unwrap()).unwrap();
        assert_eq!(spaces.len(), 3);
        assert_eq!(spaces[0].size(), [8, 16, 1]);
        assert_eq!(spaces[2].size(), [32, 64, 1]);
    }

    #[test]
    fn geometry_dimension_must_match_the_lattice() {
        let (mut config, geometry) = dam_break([16, 16, 1], [6, 8, 1], 1e-4);
        config.lattice = LatticeKind::D3Q19;
        assert!(matches!(Solver::new(config, &geometry), Err(Error::Geometry(_))));
    }

    #[test]
    fn queries_reject_cells_outside_the_grid() {
        let (config, geometry) = dam_break([16, 16, 1], [6, 8, 1], 1e-4);
        let solver = Solver::new(config, &geometry).unwrap();
        assert!(solver.density(0, [3, 3, 0], Buffer::Current).is_ok());
        assert!(solver.density(0, [16, 3, 0], Buffer::Current).is_err());
        assert!(solver.density(1, [3, 3, 0], Buffer::Current).is_err());
        assert!(solver.df(0, [3, 3, 0], 9, Buffer::Other).is_err());
        assert_eq!(solver.cell_type(0, [0, 0, 0], Buffer::Current).unwrap(), Some(CellType::Boundary));
        assert_eq!(solver.cell_type(0, [3, 3, 0], Buffer::Current).unwrap(), Some(CellType::Fluid));
        assert_eq!(solver.cell_type(0, [12, 3, 0], Buffer::Current).unwrap(), Some(CellType::Empty));
    }

    #[test]
    fn dam_break_conserves_mass_and_spreads() {
        let (config, geometry) = dam_break([32, 32, 1], [12, 20, 1], 2e-4);
        let mut solver = Solver::new(config, &geometry).unwrap();
        let mass0 = solver.fluid_mass();
        let com0 = solver.center_of_mass();

        for _ in 0..200 {
            solver.step().unwrap();
        }
        let mass1 = solver.fluid_mass();
        let com1 = solver.center_of_mass();

        assert!(((mass1 - mass0) / mass0).abs() < 1e-3);
        assert!(com1[0] > com0[0] + 0.1);
        assert!(com1[1] < com0[1]);
        assert!(solver.stats().steps == 200);
        assert!(solver.state().panic.is_none());
    }

    #[test]
    fn slip_walls_conserve_mass_under_a_free_surface() {
        for &(boundary, steps) in &[(BoundaryKind::FreeSlip, 1000), (BoundaryKind::PartSlip(0.5), 300)] {
            let (mut config, geometry) = dam_break([32, 32, 1], [12, 20, 1], 2e-4);
            config.domain_boundary = boundary;
            let mut solver = Solver::new(config, &geometry).unwrap();
            let mass0 = solver.fluid_mass();

            for _ in 0..steps {
                solver.step().unwrap();
            }
            let drift = (solver.fluid_mass() - mass0) / mass0;
            assert!(drift.abs() < 1e-3, "{:?}: {}", boundary, drift);
            assert!(solver.stats().mass_drift().abs() < 1e-3);
        }
    }

    #[test]
    fn inflow_mass_is_not_counted_as_drift() {
        let (config, mut geometry) = dam_break([32, 32, 1], [12, 12, 1], 1e-4);
        let id = geometry.add_object(Obstacle::inflow("inlet", [0.02, 0.0, 0.0]));
        geometry.fill_box([1, 14, 0], [3, 18, 1], VoxelTag::Inflow(id));
        let mut solver = Solver::new(config, &geometry).unwrap();
        let mass0 = solver.stats().initial_mass;

        for _ in 0..200 {
            solver.step().unwrap();
        }
        assert!(solver.state().initial_mass > mass0);
        assert_eq!(solver.stats().initial_mass, solver.state().initial_mass);
        assert!(solver.stats().mass_drift().abs() < 5e-3, "{}", solver.stats().mass_drift());
    }

    #[test]
    fn hydrostatic_column_stays_at_rest() {
        let gravity = 1e-4;
        let (mut config, geometry) = dam_break([16, 24, 1], [15, 11, 1], gravity);
        config.standing_fluid = true;
        let mut solver = Solver::new(config, &geometry).unwrap();

        // Fluid rows grow denser by 3 g per cell of depth.
        let gradient = |solver: &Solver| -> f64 {
            let low = solver.density(0, [8, 2, 0], Buffer::Current).unwrap();
            let high = solver.density(0, [8, 8, 0], Buffer::Current).unwrap();
            (low - high) / 6.0
        };
        let expected = 3.0 * gravity;
        assert!((gradient(&solver) - expected).abs() < 0.1 * expected, "{}", gradient(&solver));

        for _ in 0..100 {
            solver.step().unwrap();
        }
        assert!(solver.state().max_speed < 0.02);
        assert!((gradient(&solver) - expected).abs() < 0.3 * expected, "{}", gradient(&solver));
        for j in 2..8 {
            for i in 3..13 {
                let u = solver.velocity(0, [i, j, 0], Buffer::Current).unwrap();
                assert!(u[0].abs() < 5e-3 && u[1].abs() < 5e-3, "{:?} at {} {}", u, i, j);
            }
        }
    }

    #[test]
    fn refined_runs_conserve_tracked_mass() {
        for max_refine in 1..=2 {
            let (mut config, geometry) = dam_break([64, 64, 1], [24, 40, 1], 2e-4);
            config.max_refine = max_refine;
            let mut solver = Solver::new(config, &geometry).unwrap();

            for _ in 0..200 {
                solver.step().unwrap();
            }
            let drift = solver.stats().mass_drift();
            assert!(drift.abs() < 1e-3, "{} levels: {}", max_refine + 1, drift);
            assert!(solver.state().panic.is_none());
        }
    }

    #[test]
    fn step_time_rescale_stays_in_bounds() {
        let (mut config, geometry) = dam_break([32, 32, 1], [12, 20, 1], 2e-4);
        config.step_time = 0.5;
        config.min_step_time = 0.1;
        config.max_step_time = 1.0;
        let mut solver = Solver::new(config, &geometry).unwrap();

        for _ in 0..20 {
            solver.step().unwrap();
        }
        let mass0 = solver.fluid_mass();
        let u0 = solver.velocity(0, [6, 4, 0], Buffer::Current).unwrap();
        let omega0 = solver.parameters().omega;

        solver.rescale_step_time(0.4).unwrap();
        let mass1 = solver.fluid_mass();
        let u1 = solver.velocity(0, [6, 4, 0], Buffer::Current).unwrap();

        assert!((solver.parameters().step_time - 0.4).abs() < 1e-12);
        assert!(solver.parameters().omega > omega0);
        assert!(((mass1 - mass0) / mass0).abs() < 1e-3);
        for axis in 0..2 {
            assert!((u1[axis] - 0.8 * u0[axis]).abs() < 1e-3);
        }
        assert!(solver.rescale_step_time(0.0).is_err());
    }

    #[test]
    fn fast_cells_shrink_the_step() {
        let (mut config, geometry) = dam_break([32, 32, 1], [12, 20, 1], 1e-5);
        config.time_adaptation = true;
        let mut solver = Solver::new(config, &geometry).unwrap();

        let lattice = solver.lattice.clone();
        let level = &mut solver.levels[0];
        let s = level.set_curr();
        for j in 3..=5 {
            for i in 5..=7 {
                let index = level.index([i, j, 0]);
                level.write_equilibrium(s, index, &lattice, 1.0, 1.0, [0.3, 0.0, 0.0]);
            }
        }
        let mass0 = solver.fluid_mass();
        solver.step().unwrap();

        let step_time = solver.parameters().step_time;
        assert!((step_time - 0.8).abs() < 1e-12);
        assert!(step_time >= solver.config().min_step_time && step_time <= solver.config().max_step_time);
        assert_eq!(solver.stats().time_switches, 1);
        assert!(((solver.fluid_mass() - mass0) / mass0).abs() < 1e-2);
    }

    #[test]
    fn adaptation_grows_slow_step_up_to_the_ceiling() {
        let (mut config, geometry) = dam_break([16, 16, 1], [6, 8, 1], 1e-6);
        config.step_time = 0.5;
        config.max_step_time = 0.6;
        config.time_adaptation = true;
        let mut solver = Solver::new(config, &geometry).unwrap();
        solver.step().unwrap();

        assert!((solver.parameters().step_time - 0.6).abs() < 1e-12);
        assert_eq!(solver.stats().time_switches, 1);
        for _ in 0..5 {
            solver.step().unwrap();
        }
        assert!(solver.parameters().step_time <= 0.6);
        assert_eq!(solver.stats().time_switches, 1);
    }

    #[test]
    fn two_level_flags_stay_consistent() {
        let (mut config, geometry) = dam_break([32, 32, 1], [30, 16, 1], 1e-5);
        config.max_refine = 1;
        config.strict_checks = true;
        let mut solver = Solver::new(config, &geometry).unwrap();

        let (coarse, fine) = (&solver.levels()[0], &solver.levels()[1]);
        let (cs, fs) = (coarse.set_curr(), fine.set_curr());
        let mut coarse_cells = 0;
        for p in coarse.space().iter_interior() {
            let flag = coarse.flag(cs, coarse.index(p));
            if flag.intersects(CellFlags::GR_TO_FINE) {
                let center = fine.flag(fs, fine.index([2 * p[0], 2 * p[1], 2 * p[2]]));
                assert!(center.intersects(CellFlags::GR_FROM_COARSE));
            }
            if flag.contains(CellFlags::FLUID | CellFlags::GR_NORM) {
                coarse_cells += 1;
            }
        }
        let unused = fine.space().iter().filter(|&p| fine.flag(fs, fine.index(p)).intersects(CellFlags::UNUSED)).count();
        assert!(coarse_cells > 0);
        assert!(unused > 0);

        for _ in 0..8 {
            solver.step().unwrap();
            for level in solver.levels() {
                assert!(level.flags_slice(level.set_curr()).iter().all(|flag| flag.is_consistent()));
            }
        }
        assert_eq!(solver.levels()[0].lsteps, 4);
        assert_eq!(solver.levels()[1].lsteps, 8);
    }

    #[test]
    fn a_panic_is_sticky() {
        let (config, geometry) = dam_break([16, 16, 1], [6, 8, 1], 1e-4);
        let mut solver = Solver::new(config, &geometry).unwrap();
        solver.halt(0, [1, 2, 0], "test".to_string());
        assert!(matches!(solver.step(), Err(Error::Panic { level: 0, .. })));
        assert!(matches!(solver.step(), Err(Error::Panic { cell: [1, 2, 0], .. })));
    }
}
