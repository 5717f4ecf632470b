use rayon::prelude::*;
use crate::flags::CellFlags;
use crate::free_surface;
use crate::geometry::ObjectTable;
use crate::index_space::IndexSpace;
use crate::lattice::{LatticeModel, MAX_DF};
use crate::level::{CellSet, Level, LevelParams, AUX_FFRAC, AUX_FLUX, AUX_MASS};
use crate::refinement::{self, Interpolation};

/// Densities and velocities outside this band are reported as unhealthy.
const SANITY_MIN_DENSITY: f64 = -1.0;
const SANITY_MAX_DENSITY: f64 = 2.0;
const SANITY_MAX_VELOCITY: f64 = 1.0;

/// Result of a BGK collision.
///
#[derive(Clone, Copy, Debug)]
pub struct Collision {
    pub rho: f64,
    pub u: [f64; 3],
    pub omega: f64,
}

impl Collision {
    pub fn usqr(&self) -> f64 {
        self.u[0] * self.u[0] + self.u[1] * self.u[1] + self.u[2] * self.u[2]
    }
}

/// Read-only view shared by every cell update of one sweep.
///
#[derive(Clone, Copy)]
pub(crate) struct CellContext<'a> {
    pub lattice: &'a LatticeModel,
    pub params: &'a LevelParams,
    pub objects: &'a ObjectTable,
    pub src: CellSet<'a>,
}

/// Settings of a fine-level sweep.
///
#[derive(Clone, Copy)]
pub(crate) struct SweepContext<'a> {
    pub lattice: &'a LatticeModel,
    pub objects: &'a ObjectTable,
    pub interpolation: Interpolation,
}

/// A cell whose density or velocity left the healthy band.
///
#[derive(Clone, Debug)]
pub(crate) struct Violation {
    pub index: usize,
    pub reason: String,
}

/// Accumulators produced by one row of a sweep and reduced afterwards.
///
#[derive(Debug, Default)]
pub(crate) struct SweepTotals {
    pub mass: f64,
    pub volume: f64,
    pub max_usqr: f64,
    pub max_velocity: [f64; 3],
    pub used_cells: u64,
    pub interpolated_cells: u64,
    pub initial_mass_delta: f64,
    pub filled: Vec<usize>,
    pub emptied: Vec<usize>,
    pub promoted: Vec<usize>,
    pub warnings: u64,
    pub violation: Option<Violation>,
}

impl SweepTotals {
    pub fn merge(mut self, mut other: Self) -> Self {
        self.mass += other.mass;
        self.volume += other.volume;
        if other.max_usqr > self.max_usqr {
            self.max_usqr = other.max_usqr;
            self.max_velocity = other.max_velocity;
        }
        self.used_cells += other.used_cells;
        self.interpolated_cells += other.interpolated_cells;
        self.initial_mass_delta += other.initial_mass_delta;
        self.filled.append(&mut other.filled);
        self.emptied.append(&mut other.emptied);
        self.promoted.append(&mut other.promoted);
        self.warnings += other.warnings;
        self.violation = match (self.violation.take(), other.violation.take()) {
            (Some(a), Some(b)) => Some(if a.index <= b.index { a } else { b }),
            (a, b) => a.or(b),
        };
        self
    }

    pub fn track_velocity(&mut self, c: &Collision) {
        let usqr = c.usqr();
        if usqr > self.max_usqr {
            self.max_usqr = usqr;
            self.max_velocity = c.u;
        }
    }

    /// Record an out-of-band density or velocity.
    pub fn check(&mut self, index: usize, c: &Collision) {
        let reason = if !(c.rho >= SANITY_MIN_DENSITY && c.rho <= SANITY_MAX_DENSITY) {
            format!("density {} out of range", c.rho)
        } else if c.u.iter().any(|u| !(u.abs() <= SANITY_MAX_VELOCITY)) {
            format!("velocity {:?} out of range", c.u)
        } else {
            return;
        };
        self.warnings += 1;
        if self.violation.as_ref().map_or(true, |v| index < v.index) {
            self.violation = Some(Violation { index, reason });
        }
    }
}

// ============================================================================
/// BGK collision of the streamed populations `m`, in place. The velocity is
/// shifted by the level's gravity; with a positive Smagorinsky constant the
/// relaxation rate includes the eddy viscosity.
pub fn collide(lattice: &LatticeModel, m: &mut [f64], gravity: [f64; 3], omega: f64, csmago: f64) -> Collision {
    let n = lattice.num_df();
    let (rho, mom) = lattice.moments(&m[..n]);
    let u = [gravity[0] + mom[0], gravity[1] + mom[1], gravity[2] + mom[2]];
    let mut feq = [0.0; MAX_DF];
    lattice.equilibrium_into(rho, u, &mut feq[..n]);

    let omega = if csmago > 0.0 {
        lattice.les_omega(omega, csmago, lattice.noneq_stress(&m[..n], &feq[..n]))
    } else {
        omega
    };
    for l in 0..n {
        m[l] += omega * (feq[l] - m[l]);
    }
    Collision { rho, u, omega }
}

/// Pull streaming without any boundary handling.
pub(crate) fn stream_fast(cx: &CellContext, index: usize, m: &mut [f64]) {
    for l in 0..cx.lattice.num_df() {
        let from = cx.params.neighbor(index, cx.lattice.inverse(l));
        m[l] = cx.src.df(from, l);
    }
}

/// Pull streaming with bounce-back, free-slip or part-slip reflection from
/// boundary cells.
pub(crate) fn stream_with_boundaries(cx: &CellContext, index: usize, m: &mut [f64]) {
    for l in 0..cx.lattice.num_df() {
        let from = cx.params.neighbor(index, cx.lattice.inverse(l));
        let flag = cx.src.flag(from);
        m[l] = if flag.intersects(CellFlags::BND) {
            boundary_df(cx, index, l, flag)
        } else {
            cx.src.df(from, l)
        };
    }
}

/// Pull streaming on coarse levels, which bounce back from every neighbor
/// that is not fluid.
pub(crate) fn stream_coarse(cx: &CellContext, index: usize, m: &mut [f64]) {
    for l in 0..cx.lattice.num_df() {
        let from = cx.params.neighbor(index, cx.lattice.inverse(l));
        m[l] = if cx.src.flag(from).intersects(CellFlags::FLUID) {
            cx.src.df(from, l)
        } else {
            cx.src.df(index, cx.lattice.inverse(l))
        };
    }
}

fn boundary_df(cx: &CellContext, index: usize, l: usize, wall: CellFlags) -> f64 {
    let bounce = cx.src.df(index, cx.lattice.inverse(l));

    if wall.intersects(CellFlags::BND_FREESLIP | CellFlags::BND_PARTSLIP) {
        let slip = slip_df(cx, index, l).unwrap_or(bounce);
        if wall.intersects(CellFlags::BND_PARTSLIP) {
            let p = cx.objects.part_slip(wall.object_id());
            p * bounce + (1.0 - p) * slip
        } else {
            slip
        }
    } else {
        bounce
    }
}

/// Specular reflection of a diagonal population off a flat wall. Returns
/// `None` for axis-aligned directions and corners, where the caller falls
/// back to bounce-back.
fn slip_df(cx: &CellContext, index: usize, l: usize) -> Option<f64> {
    let e = cx.lattice.vector(l);
    let mut axes = (0..3).filter(|a| e[*a] != 0);
    let (a, b) = match (axes.next(), axes.next(), axes.next()) {
        (Some(a), Some(b), None) => (a, b),
        _ => return None,
    };
    let back = |axis: usize| {
        let mut d = [0; 3];
        d[axis] = -e[axis];
        IndexSpace::shifted(index, cx.params.space.offset(d))
    };
    // Interface mass only follows exchanges between neighbors, so a
    // reflected population must both leave and land in a fluid cell.
    if !cx.src.flag(index).intersects(CellFlags::FLUID) {
        return None;
    }
    let (xa, xb) = (back(a), back(b));
    let fa = cx.src.flag(xa);
    let fb = cx.src.flag(xb);

    match (fa.intersects(CellFlags::BND), fb.intersects(CellFlags::BND)) {
        (true, false) if fb.intersects(CellFlags::FLUID) => Some(cx.src.df(xb, cx.lattice.mirror(l, a))),
        (false, true) if fa.intersects(CellFlags::FLUID) => Some(cx.src.df(xa, cx.lattice.mirror(l, b))),
        _ => None,
    }
}

// ============================================================================
/// One stream-collide sweep of the finest level: reads the current buffer,
/// writes the other one, and returns the reduced row totals. The caller
/// swaps the buffers afterwards.
pub(crate) fn fine_sweep(ctx: &SweepContext, coarse: Option<&Level>, level: &mut Level) -> SweepTotals {
    let params = level.params();
    let sx = params.space.size()[0];
    let stride = level.stride();
    let (src, dst) = level.split();
    let (cells, flags) = dst.into_parts();
    let cx = CellContext { lattice: ctx.lattice, params: &params, objects: ctx.objects, src };

    cells
        .par_chunks_mut(sx * stride)
        .zip(flags.par_chunks_mut(sx))
        .enumerate()
        .filter(|(row, _)| params.space.is_interior_row(*row))
        .map(|(row, (cells, flags))| {
            let mut totals = SweepTotals::default();
            for i in 1..sx - 1 {
                let cell = &mut cells[i * stride..(i + 1) * stride];
                fine_cell(&cx, ctx, coarse, row * sx + i, cell, &mut flags[i], &mut totals);
            }
            totals
        })
        .reduce(SweepTotals::default, SweepTotals::merge)
}

/// A sweep that only relaxes the fluid cells and leaves every other cell
/// unchanged. Used to settle an initial pressure gradient before the free
/// surface starts to move. The caller swaps the buffers afterwards.
pub(crate) fn relax_fluid(ctx: &SweepContext, level: &mut Level) {
    let params = level.params();
    let sx = params.space.size()[0];
    let stride = level.stride();
    let n = ctx.lattice.num_df();
    let (src, dst) = level.split();
    let (cells, flags) = dst.into_parts();
    let cx = CellContext { lattice: ctx.lattice, params: &params, objects: ctx.objects, src };

    cells
        .par_chunks_mut(sx * stride)
        .zip(flags.par_chunks_mut(sx))
        .enumerate()
        .for_each(|(row, (cells, flags))| {
            for i in 0..sx {
                let index = row * sx + i;
                let cell = &mut cells[i * stride..(i + 1) * stride];
                let flag = src.flag(index);
                flags[i] = flag;

                if !params.space.is_interior_row(row) || i == 0 || i == sx - 1 || !flag.intersects(CellFlags::FLUID) || flag.intersects(CellFlags::INFLOW) {
                    cell.copy_from_slice(src.cell(index));
                    continue;
                }
                let mut m = [0.0; MAX_DF];
                stream_with_boundaries(&cx, index, &mut m);
                let c = collide(ctx.lattice, &mut m[..n], params.gravity, params.omega, params.csmago);
                cell.copy_from_slice(src.cell(index));
                cell[..n].copy_from_slice(&m[..n]);
                cell[n + AUX_MASS] = c.rho;
            }
        });
}

fn fine_cell(
    cx: &CellContext,
    ctx: &SweepContext,
    coarse: Option<&Level>,
    index: usize,
    cell: &mut [f64],
    flag: &mut CellFlags,
    totals: &mut SweepTotals,
) {
    let lattice = cx.lattice;
    let n = lattice.num_df();
    let old = cx.src.flag(index);

    if old.intersects(CellFlags::GR_FROM_COARSE) {
        match coarse {
            Some(coarse) => {
                let p = cx.params.space.coords(index);
                refinement::interpolate_into(lattice, coarse, cx.params, p, ctx.interpolation, cell);
                totals.interpolated_cells += 1;
            }
            None => cell.copy_from_slice(cx.src.cell(index)),
        }
        *flag = old.rebased(CellFlags::FLUID | CellFlags::GR_FROM_COARSE);
        return;
    }

    if old.intersects(CellFlags::INFLOW) && !old.intersects(CellFlags::FLUID | CellFlags::INTER) {
        let u = cx.objects.speed(old.object_id());
        lattice.equilibrium_into(1.0, u, &mut cell[..n]);
        cell[n + AUX_MASS] = 1.0;
        cell[n + AUX_FFRAC] = 1.0;
        cell[n + AUX_FLUX] = 0.5 * n as f64;
        *flag = old.rebased(CellFlags::INTER);
        totals.mass += 1.0;
        totals.volume += 1.0;
        totals.initial_mass_delta += 1.0;
        totals.used_cells += 1;
        return;
    }

    if old.contains(CellFlags::OUTFLOW | CellFlags::FLUID) {
        let rho = cx.src.density(index);
        cell.copy_from_slice(cx.src.cell(index));
        cell[n + AUX_MASS] = 0.0;
        cell[n + AUX_FFRAC] = 0.0;
        cell[n + AUX_FLUX] = 0.5 * n as f64;
        *flag = old.rebased(CellFlags::INTER);
        totals.initial_mass_delta -= rho;
        totals.emptied.push(index);
        return;
    }

    if old.intersects(CellFlags::BND | CellFlags::EMPTY | CellFlags::UNUSED) {
        *flag = old;
        return;
    }

    let mut nbflag = [CellFlags::NONE; MAX_DF];
    let mut nbored = CellFlags::NONE;
    for l in 1..n {
        nbflag[l] = cx.src.flag(cx.params.neighbor(index, l));
        nbored |= nbflag[l];
    }
    totals.used_cells += 1;

    if !old.intersects(CellFlags::FLUID) {
        free_surface::interface_cell(cx, index, old, &nbflag, nbored, cell, flag, totals);
        return;
    }

    let mut m = [0.0; MAX_DF];
    let mut new_flag = old;
    let params = cx.params;

    let collision = if old.intersects(CellFlags::INFLOW) {
        stream_with_boundaries(cx, index, &mut m);
        let rho: f64 = m[..n].iter().sum();
        let u = cx.objects.speed(old.object_id());
        lattice.equilibrium_into(rho, u, &mut m[..n]);
        Collision { rho, u, omega: params.omega }
    } else if nbored.intersects(CellFlags::BND) {
        stream_with_boundaries(cx, index, &mut m);
        new_flag.remove(CellFlags::NO_BND_FLUID);
        collide(lattice, &mut m[..n], params.gravity, params.omega, params.csmago)
    } else {
        stream_fast(cx, index, &mut m);
        new_flag.insert(CellFlags::NO_BND_FLUID);
        collide(lattice, &mut m[..n], params.gravity, params.omega, params.csmago)
    };
    totals.check(index, &collision);
    totals.track_velocity(&collision);

    cell[..n].copy_from_slice(&m[..n]);
    cell[n + AUX_FFRAC] = 1.0;
    cell[n + AUX_MASS] = collision.rho;
    cell[n + AUX_FLUX] = cx.src.flux(index);
    *flag = new_flag;
    totals.mass += cx.src.density(index);
    totals.volume += 1.0;
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::BoundaryKind;
    use crate::lattice::LatticeKind;

    fn closed_box(lattice: &LatticeModel, size: [usize; 3], wall: CellFlags) -> Level {
        let dim = lattice.dimension();
        let space = IndexSpace::new(size, dim).unwrap();
        let mut level = Level::allocate(0, 0, space, lattice).unwrap();
        level.omega = 1.2;
        for p in space.iter() {
            let index = level.index(p);
            let flag = if space.is_interior(p) { CellFlags::FLUID } else { wall };
            level.init_cell(index, flag, lattice, 1.0, 1.0, [0.0; 3]);
        }
        level
    }

    fn sweep(lattice: &LatticeModel, level: &mut Level, objects: &ObjectTable) -> SweepTotals {
        let ctx = SweepContext {
            lattice,
            objects,
            interpolation: Interpolation { order: 1, time_blend: 0.0 },
        };
        let totals = fine_sweep(&ctx, None, level);
        level.swap();
        totals
    }

    #[test]
    fn rest_state_is_a_fixed_point() {
        for (kind, size) in vec![(LatticeKind::D2Q9, [8, 7, 1]), (LatticeKind::D3Q19, [6, 5, 5])] {
            let lattice = LatticeModel::new(kind);
            let objects = ObjectTable::new(&[], BoundaryKind::NoSlip, |v| v);
            let mut level = closed_box(&lattice, size, CellFlags::BND | CellFlags::BND_NOSLIP);

            for _ in 0..5 {
                sweep(&lattice, &mut level, &objects);
            }
            let rest = lattice.rest_equilibrium();
            for p in level.space().iter_interior() {
                let index = level.index(p);
                for l in 0..lattice.num_df() {
                    assert!((level.curr().df(index, l) - rest[l]).abs() < 1e-14);
                }
            }
        }
    }

    #[test]
    fn free_slip_walls_conserve_mass() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let objects = ObjectTable::new(&[], BoundaryKind::FreeSlip, |v| v);
        let wall = (CellFlags::BND | CellFlags::BND_FREESLIP).with_object(objects.domain_id());
        let mut level = closed_box(&lattice, [10, 10, 1], wall);
        let index = level.index([4, 5, 0]);
        level.init_cell(index, CellFlags::FLUID, &lattice, 1.0, 1.0, [0.05, -0.03, 0.0]);

        let before: f64 = level.space().iter_interior().map(|p| level.curr().density(level.index(p))).sum();
        let mut totals = SweepTotals::default();
        for _ in 0..20 {
            totals = sweep(&lattice, &mut level, &objects);
        }
        let after: f64 = level.space().iter_interior().map(|p| level.curr().density(level.index(p))).sum();
        assert!((before - after).abs() < 1e-10);
        assert_eq!(totals.used_cells, 64);
        assert!(totals.violation.is_none());
    }

    #[test]
    fn fluid_cells_next_to_walls_lose_no_bnd_flag() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let objects = ObjectTable::new(&[], BoundaryKind::NoSlip, |v| v);
        let mut level = closed_box(&lattice, [6, 6, 1], CellFlags::BND | CellFlags::BND_NOSLIP);
        sweep(&lattice, &mut level, &objects);
        let edge = level.index([1, 2, 0]);
        assert!(!level.curr().flag(edge).intersects(CellFlags::NO_BND_FLUID));
        let mut level = closed_box(&lattice, [7, 7, 1], CellFlags::BND | CellFlags::BND_NOSLIP);
        sweep(&lattice, &mut level, &objects);
        let center = level.index([3, 3, 0]);
        assert!(level.curr().flag(center).contains(CellFlags::FLUID | CellFlags::NO_BND_FLUID));
    }

    #[test]
    fn totals_merge_keeps_fastest_cell() {
        let mut a = SweepTotals::default();
        a.track_velocity(&Collision { rho: 1.0, u: [0.1, 0.0, 0.0], omega: 1.0 });
        let mut b = SweepTotals::default();
        b.track_velocity(&Collision { rho: 1.0, u: [0.0, 0.2, 0.0], omega: 1.0 });
        b.check(7, &Collision { rho: 3.0, u: [0.0; 3], omega: 1.0 });
        let c = a.merge(b);
        assert_eq!(c.max_velocity, [0.0, 0.2, 0.0]);
        assert_eq!(c.warnings, 1);
        assert_eq!(c.violation.map(|v| v.index), Some(7));
    }
}
