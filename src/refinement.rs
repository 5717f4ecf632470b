use rayon::prelude::*;
use crate::flags::CellFlags;
use crate::geometry::ObjectTable;
use crate::kernel::{collide, stream_coarse, CellContext, SweepTotals};
use crate::lattice::{LatticeModel, MAX_DF};
use crate::level::{Level, LevelParams, AUX_FFRAC, AUX_FLUX, AUX_MASS};

/// Roles a fine cell must not have for the coarse cell above it to take
/// part in the fine/coarse transfer.
const NOT_ALLOWED: CellFlags = CellFlags::from_bits(
    CellFlags::INTER.bits() | CellFlags::GR_FROM_FINE.bits() | CellFlags::GR_TO_FINE.bits(),
);

/// How cells are filled from the next coarser level.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interpolation {
    /// 1 for (multi)linear, 2 for the four-point cubic stencil.
    pub order: usize,
    /// Weight of the coarse level's other buffer.
    pub time_blend: f64,
}

/// Precomputed per-lattice tables used by the level transfer operations.
///
#[derive(Clone, Debug)]
pub struct Refiner {
    restriction: Vec<f64>,
    areas: Vec<f64>,
}

/// The flag the fine center of a coarse cell must carry before the coarse
/// cell can be fed by restriction.
fn required_flag(lev: usize, max_level: usize) -> CellFlags {
    if lev + 1 == max_level {
        CellFlags::NO_BND_FLUID
    } else {
        CellFlags::GR_NORM
    }
}

fn qualifies(flag: CellFlags, req: CellFlags) -> bool {
    flag.intersects(req) && !flag.intersects(NOT_ALLOWED)
}

fn fine_center(coarse: &Level, fine: &Level, index: usize) -> usize {
    let p = coarse.space().coords(index);
    fine.index([2 * p[0], 2 * p[1], 2 * p[2]])
}

/// Mutable access to levels `lev - 1`, `lev` and `lev + 1` at once.
fn level_triple(levels: &mut [Level], lev: usize) -> (Option<&mut Level>, &mut Level, &mut Level) {
    let (lower, upper) = levels.split_at_mut(lev);
    let (mid, fine) = upper.split_at_mut(1);
    (lower.last_mut(), &mut mid[0], &mut fine[0])
}

// ============================================================================
/// Fill `out` (a full cell: DFs followed by the auxiliary values) with the
/// state interpolated from the coarser level at fine coordinates `p`, and
/// rescale the non-equilibrium part to the fine relaxation time.
pub(crate) fn interpolate_into(
    lattice: &LatticeModel,
    coarse: &Level,
    fine: &LevelParams,
    p: [usize; 3],
    interpolation: Interpolation,
    out: &mut [f64],
) {
    let n = lattice.num_df();
    let df = gather_coarse(lattice, coarse, p, interpolation);
    let (rho, u) = lattice.moments(&df[..n]);
    let mut feq = [0.0; MAX_DF];
    lattice.equilibrium_into(rho, u, &mut feq[..n]);

    let (omega_f, omega_c) = if fine.csmago > 0.0 {
        let q = lattice.noneq_stress(&df[..n], &feq[..n]);
        (lattice.les_omega(fine.omega, fine.csmago, q), lattice.les_omega(coarse.omega, coarse.csmago, q))
    } else {
        (fine.omega, coarse.omega)
    };
    let scale = (fine.time_step / coarse.time_step) * (1.0 / omega_f - 1.0) / (1.0 / omega_c - 1.0);

    for l in 0..n {
        out[l] = feq[l] + (df[l] - feq[l]) * scale;
    }
    out[n + AUX_FFRAC] = 1.0;
    out[n + AUX_MASS] = rho;
    out[n + AUX_FLUX] = 0.5 * n as f64;
}

/// Spatially (and optionally temporally) interpolated coarse populations at
/// fine coordinates `p`. Each odd fine coordinate lies between two coarse
/// cells.
fn gather_coarse(lattice: &LatticeModel, coarse: &Level, p: [usize; 3], interpolation: Interpolation) -> [f64; MAX_DF] {
    let space = coarse.space();
    let base = [p[0] / 2, p[1] / 2, p[2] / 2];
    let odd = [p[0] % 2 == 1, p[1] % 2 == 1, space.dim() == 3 && p[2] % 2 == 1];

    let linear = |a: usize| -> Vec<(i64, f64)> {
        if odd[a] {
            vec![(0, 0.5), (1, 0.5)]
        } else {
            vec![(0, 1.0)]
        }
    };
    let cubic = |a: usize| -> Vec<(i64, f64)> {
        if odd[a] {
            vec![(-1, -1.0 / 16.0), (0, 9.0 / 16.0), (1, 9.0 / 16.0), (2, -1.0 / 16.0)]
        } else {
            vec![(0, 1.0)]
        }
    };
    let sources = |stencil: &dyn Fn(usize) -> Vec<(i64, f64)>| -> Option<Vec<(usize, f64)>> {
        let mut out = Vec::new();
        for &(dx, wx) in &stencil(0) {
            for &(dy, wy) in &stencil(1) {
                for &(dz, wz) in &stencil(2) {
                    let q = [base[0] as i64 + dx, base[1] as i64 + dy, base[2] as i64 + dz];
                    if !space.contains(q) {
                        return None;
                    }
                    out.push((space.index(q[0] as usize, q[1] as usize, q[2] as usize), wx * wy * wz));
                }
            }
        }
        Some(out)
    };
    let curr = coarse.curr();
    let is_fluid = |index: usize| curr.flag(index).intersects(CellFlags::FLUID);

    let cubic_sources = if interpolation.order == 2 {
        sources(&cubic).filter(|s| s.iter().all(|(index, _)| is_fluid(*index)))
    } else {
        None
    };
    let weighted = match cubic_sources {
        Some(s) => s,
        None => {
            let all = sources(&linear).unwrap_or_else(|| vec![(space.index(base[0], base[1], base[2]), 1.0)]);
            let fluid: Vec<(usize, f64)> = all.iter().copied().filter(|(index, _)| is_fluid(*index)).collect();
            if fluid.is_empty() {
                all
            } else {
                let total: f64 = fluid.iter().map(|(_, w)| w).sum();
                fluid.into_iter().map(|(index, w)| (index, w / total)).collect()
            }
        }
    };

    let n = lattice.num_df();
    let other = coarse.other();
    let t = interpolation.time_blend;
    let mut df = [0.0; MAX_DF];
    for (index, w) in weighted {
        for l in 0..n {
            let value = if t > 0.0 {
                (1.0 - t) * curr.df(index, l) + t * other.df(index, l)
            } else {
                curr.df(index, l)
            };
            df[l] += w * value;
        }
    }
    df
}

// ============================================================================
impl Refiner {
    pub fn new(lattice: &LatticeModel) -> Self {
        Self {
            restriction: lattice.restriction_weights(),
            areas: lattice.coarse_flux_areas(),
        }
    }

    /// Interpolate fine cell `index` of buffer `s` on `fine` from `coarse`
    /// and give it the flag `flag`.
    fn interpolate_cell(
        &self,
        lattice: &LatticeModel,
        coarse: &Level,
        fine: &mut Level,
        s: usize,
        index: usize,
        flag: CellFlags,
        interpolation: Interpolation,
    ) {
        let params = fine.params();
        let p = fine.space().coords(index);
        let keep = fine.flag(s, index);
        interpolate_into(lattice, coarse, &params, p, interpolation, fine.cell_mut(s, index));
        fine.set_flag(s, index, keep.rebased(flag));
    }

    /// Interpolate a cell on level `lev` from `lev - 1`, first filling any
    /// unused neighbors when `mark_neighbors` is set.
    pub fn interpolate_cell_from_coarse(
        &self,
        lattice: &LatticeModel,
        levels: &mut [Level],
        lev: usize,
        p: [usize; 3],
        interpolation: Interpolation,
        flag: CellFlags,
        mark_neighbors: bool,
    ) {
        if lev == 0 {
            return;
        }
        let (lower, upper) = levels.split_at_mut(lev);
        let coarse = &lower[lev - 1];
        let fine = &mut upper[0];
        let s = fine.set_curr();
        let index = fine.index(p);

        if mark_neighbors {
            for l in 1..lattice.num_dir() {
                let nb = fine.neighbor(index, l);
                if fine.flag(s, nb).intersects(CellFlags::UNUSED) {
                    self.interpolate_cell(lattice, coarse, fine, s, nb, CellFlags::FLUID | CellFlags::GR_FROM_COARSE, interpolation);
                }
            }
        }
        self.interpolate_cell(lattice, coarse, fine, s, index, flag, interpolation);
    }

    /// Flux-area normalization of the coarse fluid cells of level `lev`,
    /// written into the current buffer: the fraction of each coarse cell
    /// that is actually simulated on the coarse level.
    pub fn coarse_calculate_flux_areas(&self, lattice: &LatticeModel, levels: &mut [Level], lev: usize) {
        let (lower, upper) = levels.split_at_mut(lev + 1);
        let coarse = &mut lower[lev];
        let fine = &upper[0];
        let s = coarse.set_curr();
        let fs = fine.set_curr();
        let open = CellFlags::GR_FROM_COARSE | CellFlags::UNUSED | CellFlags::EMPTY;

        for p in coarse.space().iter_interior() {
            let index = coarse.index(p);
            if !coarse.flag(s, index).intersects(CellFlags::FLUID) {
                continue;
            }
            let fc = fine_center(coarse, fine, index);
            let center = fine.flag(fs, fc);
            let area = if center.intersects(CellFlags::GR_FROM_COARSE) {
                self.areas[0]
                    + (1..lattice.num_dir())
                        .filter(|&l| fine.flag(fs, fine.neighbor(fc, l)).intersects(open))
                        .map(|l| self.areas[l])
                        .sum::<f64>()
            } else if center.intersects(CellFlags::EMPTY | CellFlags::UNUSED) {
                1.0
            } else {
                0.0
            };
            coarse.set_flux(s, index, area);
        }
    }

    /// Stream-collide sweep of coarse level `lev`, which also re-fills its
    /// FromCoarse border from `lev - 1` and carries its FromFine cells over
    /// unchanged. The buffers are swapped afterwards.
    pub(crate) fn coarse_advance(
        &self,
        lattice: &LatticeModel,
        objects: &ObjectTable,
        levels: &mut [Level],
        lev: usize,
        interpolation: Interpolation,
    ) -> SweepTotals {
        self.coarse_calculate_flux_areas(lattice, levels, lev);

        let (lower, upper) = levels.split_at_mut(lev);
        let coarser = lower.last();
        let level = &mut upper[0];
        let params = level.params();
        let sx = params.space.size()[0];
        let stride = level.stride();
        let n = lattice.num_df();

        let totals = {
            let (src, dst) = level.split();
            let (cells, flags) = dst.into_parts();
            let cx = CellContext { lattice, params: &params, objects, src };

            cells
                .par_chunks_mut(sx * stride)
                .zip(flags.par_chunks_mut(sx))
                .enumerate()
                .filter(|(row, _)| params.space.is_interior_row(*row))
                .map(|(row, (cells, flags))| {
                    let mut totals = SweepTotals::default();
                    for i in 1..sx - 1 {
                        let index = row * sx + i;
                        let cell = &mut cells[i * stride..(i + 1) * stride];
                        let mut flag = src.flag(index);

                        if flag.intersects(CellFlags::GR_FROM_COARSE) {
                            let unused_nb = (1..n).any(|l| src.flag(params.neighbor(index, l)).intersects(CellFlags::UNUSED));
                            if !unused_nb {
                                flag = flag.rebased(CellFlags::FLUID | CellFlags::GR_NORM);
                                totals.promoted.push(index);
                            }
                        }
                        flags[i] = flag;

                        if flag.intersects(CellFlags::GR_FROM_COARSE) {
                            match coarser {
                                Some(coarser) => {
                                    let p = params.space.coords(index);
                                    interpolate_into(lattice, coarser, &params, p, interpolation, cell);
                                    totals.interpolated_cells += 1;
                                }
                                None => cell.copy_from_slice(src.cell(index)),
                            }
                            continue;
                        }
                        if flag.contains(CellFlags::FLUID | CellFlags::GR_FROM_FINE) {
                            cell.copy_from_slice(src.cell(index));
                            continue;
                        }
                        if !flag.intersects(CellFlags::FLUID) {
                            continue;
                        }

                        let mut m = [0.0; MAX_DF];
                        stream_coarse(&cx, index, &mut m);
                        let collision = collide(lattice, &mut m[..n], params.gravity, params.omega, params.csmago);
                        totals.check(index, &collision);
                        totals.track_velocity(&collision);
                        totals.used_cells += 1;

                        let flux = src.flux(index);
                        cell[..n].copy_from_slice(&m[..n]);
                        cell[n + AUX_FFRAC] = 1.0;
                        cell[n + AUX_MASS] = collision.rho;
                        cell[n + AUX_FLUX] = flux;
                        flags[i].insert(CellFlags::NO_BND_FLUID);
                        totals.volume += flux;
                        totals.mass += flux * collision.rho;
                    }
                    totals
                })
                .reduce(SweepTotals::default, SweepTotals::merge)
        };

        let s = level.set_curr();
        for &index in &totals.promoted {
            let flag = level.flag(s, index).rebased(CellFlags::FLUID | CellFlags::GR_NORM);
            level.set_flag(s, index, flag);
        }
        level.swap();
        level.lsteps += 1;
        level.time += level.time_step;
        level.lmass = totals.mass * level.cell_factor;
        level.lvolume = totals.volume * level.cell_factor;
        totals
    }

    /// Restrict the fine level onto the FromFine cells of coarse level
    /// `lev`, and mark coarse fluid cells above the fine border as ToFine.
    pub fn coarse_restrict_from_fine(&self, lattice: &LatticeModel, levels: &mut [Level], lev: usize) {
        let (lower, upper) = levels.split_at_mut(lev + 1);
        let coarse = &mut lower[lev];
        let fine = &upper[0];
        let s = coarse.set_curr();
        let fine_set = fine.curr();
        let n = lattice.num_df();

        for p in coarse.space().iter_interior() {
            let index = coarse.index(p);
            let flag = coarse.flag(s, index);
            let fc = fine_center(coarse, fine, index);

            if flag.contains(CellFlags::FLUID | CellFlags::GR_FROM_FINE) {
                let mut df = [0.0; MAX_DF];
                for (l, w) in self.restriction.iter().enumerate() {
                    let src = fine_set.dfs(fine.neighbor(fc, l));
                    for m in 0..n {
                        df[m] += w * src[m];
                    }
                }
                let (rho, u) = lattice.moments(&df[..n]);
                let mut feq = [0.0; MAX_DF];
                lattice.equilibrium_into(rho, u, &mut feq[..n]);

                let (omega_c, omega_f) = if coarse.csmago > 0.0 {
                    let q = lattice.noneq_stress(&df[..n], &feq[..n]);
                    (lattice.les_omega(coarse.omega, coarse.csmago, q), lattice.les_omega(fine.omega, fine.csmago, q))
                } else {
                    (coarse.omega, fine.omega)
                };
                let scale = (coarse.time_step / fine.time_step) * (1.0 / omega_c - 1.0) / (1.0 / omega_f - 1.0);

                let cell = coarse.cell_mut(s, index);
                for l in 0..n {
                    cell[l] = feq[l] + (df[l] - feq[l]) * scale;
                }
                cell[n + AUX_FFRAC] = 1.0;
                cell[n + AUX_MASS] = rho;
            } else if flag.intersects(CellFlags::FLUID) {
                let to_fine = fine.flag(fine.set_curr(), fc).intersects(CellFlags::GR_FROM_COARSE);
                let mut flag = flag;
                flag.set(CellFlags::GR_TO_FINE, to_fine);
                coarse.set_flag(s, index, flag);
            }
        }
    }

    /// Hand coarse cells over to the fine level where the fine level has
    /// grown, and extend the fine level's FromCoarse border accordingly.
    /// Returns the number of changed cells.
    pub fn perform_refinement(
        &self,
        lattice: &LatticeModel,
        levels: &mut [Level],
        lev: usize,
        max_level: usize,
        interpolation: Interpolation,
    ) -> usize {
        if lev + 1 > max_level {
            return 0;
        }
        let num_dir = lattice.num_dir();
        let req = required_flag(lev, max_level);
        let (mut coarser, coarse, fine) = level_triple(levels, lev);
        let src = coarse.set_other();
        let dst = coarse.set_curr();
        let fs = fine.set_curr();
        let space = coarse.space();
        let interior: Vec<usize> = space.iter_interior().map(|p| coarse.index(p)).collect();
        let mut changes = 0;

        for &index in &interior {
            if !coarse.flag(src, index).intersects(CellFlags::GR_FROM_FINE) {
                continue;
            }
            let fc = fine_center(coarse, fine, index);
            if qualifies(fine.flag(fs, fc), req) {
                continue;
            }
            let flag = coarse.flag(dst, index).rebased(CellFlags::EMPTY);
            coarse.set_flag(dst, index, flag);
            changes += 1;
            for l in 1..num_dir {
                let nb = coarse.neighbor(index, l);
                let f = coarse.flag(src, nb);
                if f.intersects(CellFlags::FLUID) && !f.intersects(CellFlags::GR_FROM_FINE) {
                    coarse.set_flag(dst, nb, f.rebased(CellFlags::FLUID | CellFlags::GR_FROM_FINE));
                }
            }
        }

        for &index in &interior {
            if !coarse.flag(src, index).intersects(CellFlags::GR_FROM_COARSE) {
                continue;
            }
            let mut unused_nb = false;
            let mut norm_nb = false;
            for l in 1..num_dir {
                let f = coarse.flag(src, coarse.neighbor(index, l));
                unused_nb |= f.intersects(CellFlags::UNUSED);
                norm_nb |= f.intersects(CellFlags::GR_NORM);
            }
            let base = coarse.flag(dst, index);
            if !unused_nb {
                coarse.set_flag(dst, index, base.rebased(CellFlags::FLUID | CellFlags::GR_NORM));
                changes += 1;
            }
            if !norm_nb {
                coarse.set_flag(dst, index, base.rebased(CellFlags::UNUSED));
                changes += 1;
            }

            let fc = fine_center(coarse, fine, index);
            if !fine.flag(fs, fc).intersects(CellFlags::GR_FROM_COARSE) {
                continue;
            }
            coarse.set_flag(dst, index, base.rebased(CellFlags::FLUID | CellFlags::GR_NORM));
            changes += 1;
            if let Some(coarser) = coarser.as_deref_mut() {
                let p = space.coords(index);
                let parent = coarser.index([p[0] / 2, p[1] / 2, p[2] / 2]);
                let s = coarser.set_curr();
                coarser.remove_flag(s, parent, CellFlags::GR_TO_FINE);
            }
            for l in 1..num_dir {
                let nb = coarse.neighbor(index, l);
                let f = coarse.flag(src, nb);
                if f.intersects(CellFlags::GR_NORM) {
                    let borders_unused = (1..num_dir).any(|m| coarse.flag(src, coarse.neighbor(nb, m)).intersects(CellFlags::UNUSED));
                    if borders_unused {
                        coarse.set_flag(dst, nb, f.rebased(CellFlags::FLUID | CellFlags::GR_FROM_COARSE));
                    }
                } else if f.intersects(CellFlags::UNUSED) {
                    if let Some(coarser) = coarser.as_deref() {
                        self.interpolate_cell(lattice, coarser, coarse, dst, nb, CellFlags::FLUID | CellFlags::GR_FROM_COARSE, interpolation);
                        changes += 1;
                    }
                }
            }
        }

        let setf = if lev + 1 < max_level { CellFlags::FLUID | CellFlags::GR_NORM } else { CellFlags::FLUID };
        for &index in &interior {
            if !coarse.flag(dst, index).intersects(CellFlags::GR_FROM_FINE) {
                continue;
            }
            let fc = fine_center(coarse, fine, index);
            if !fine.flag(fs, fc).intersects(CellFlags::GR_FROM_COARSE) {
                continue;
            }
            let f = fine.flag(fs, fc);
            fine.set_flag(fs, fc, f.rebased(setf));
            changes += 1;
            for l in 1..num_dir {
                let b = fine.neighbor(fc, l);
                let f = fine.flag(fs, b);
                if f.intersects(CellFlags::GR_FROM_COARSE) {
                    fine.set_flag(fs, b, f.rebased(setf));
                } else if f.intersects(CellFlags::UNUSED) {
                    self.interpolate_cell(lattice, coarse, fine, fs, b, setf, interpolation);
                    changes += 1;
                }
            }
            for l in 1..num_dir {
                let b = fine.neighbor(fc, l);
                let f = fine.flag(fs, b);
                if !f.intersects(CellFlags::FLUID) || f.intersects(CellFlags::GR_FROM_COARSE) {
                    continue;
                }
                for m in 1..num_dir {
                    let c = fine.neighbor(b, m);
                    if fine.flag(fs, c).intersects(CellFlags::UNUSED) {
                        self.interpolate_cell(lattice, coarse, fine, fs, c, CellFlags::FLUID | CellFlags::GR_FROM_COARSE, interpolation);
                        changes += 1;
                    }
                }
            }
        }
        changes
    }

    /// Let the coarse level take over regions where the fine level is bulk
    /// fluid: FromFine cells become regular coarse cells and the fine cells
    /// beneath complete coarse cubes become Unused. Interface mass removed on
    /// the fine level is added to `fix_mass`. Returns the number of changed
    /// cells.
    pub fn perform_coarsening(
        &self,
        lattice: &LatticeModel,
        levels: &mut [Level],
        lev: usize,
        max_level: usize,
        fix_mass: &mut f64,
    ) -> usize {
        if lev + 1 > max_level {
            return 0;
        }
        let num_dir = lattice.num_dir();
        let dim = lattice.dimension();
        let req = required_flag(lev, max_level);
        let (_, coarse, fine) = level_triple(levels, lev);
        let s = coarse.set_curr();
        let fs = fine.set_curr();
        let fo = fine.set_other();
        let space = coarse.space();
        let interior: Vec<usize> = space.iter_interior().map(|p| coarse.index(p)).collect();
        let mut changes = 0;

        for &index in &interior {
            if !coarse.flag(s, index).intersects(CellFlags::GR_FROM_FINE) {
                continue;
            }
            let fc = fine_center(coarse, fine, index);
            let fine_ok = (0..num_dir).all(|l| qualifies(fine.flag(fs, fine.neighbor(fc, l)), req));
            let coarse_ok = (1..num_dir).all(|l| coarse.flag(s, coarse.neighbor(index, l)).intersects(CellFlags::FLUID));
            if !(fine_ok && coarse_ok) {
                continue;
            }
            let f = coarse.flag(s, index);
            coarse.set_flag(s, index, f.rebased(CellFlags::FLUID | CellFlags::GR_NORM));
            changes += 1;

            let p = space.coords(index);
            let dzs: &[i64] = if dim == 3 { &[-1, 1] } else { &[0] };
            for &dx in &[-1i64, 1] {
                for &dy in &[-1i64, 1] {
                    for &dz in dzs {
                        let cube_ok = [[dx, 0, 0], [0, dy, 0], [0, 0, dz], [dx, dy, 0], [dx, 0, dz], [0, dy, dz], [dx, dy, dz]]
                            .iter()
                            .all(|d| {
                                let q = coarse.index([
                                    (p[0] as i64 + d[0]) as usize,
                                    (p[1] as i64 + d[1]) as usize,
                                    (p[2] as i64 + d[2]) as usize,
                                ]);
                                coarse.flag(s, q).intersects(CellFlags::GR_NORM | CellFlags::GR_FROM_COARSE)
                            });
                        if !cube_ok {
                            continue;
                        }
                        let corner = fine.index([
                            (2 * p[0] as i64 + dx) as usize,
                            (2 * p[1] as i64 + dy) as usize,
                            (2 * p[2] as i64 + dz) as usize,
                        ]);
                        changes += 1;
                        let f = fine.flag(fs, corner);
                        fine.set_flag(fs, corner, f.rebased(CellFlags::UNUSED));
                        fine.set_flag(fo, corner, f.rebased(CellFlags::UNUSED));

                        for l in 1..num_dir {
                            let b = fine.neighbor(corner, l);
                            let f = fine.flag(fs, b);
                            if f.intersects(CellFlags::FLUID) {
                                fine.set_flag(fs, b, f.rebased(CellFlags::FLUID | CellFlags::GR_FROM_COARSE));
                            } else if f.intersects(CellFlags::INTER) {
                                *fix_mass += fine.mass(fs, b);
                                fine.set_flag(fs, b, f.rebased(CellFlags::FLUID | CellFlags::GR_FROM_COARSE));
                            }
                        }
                        for l in 1..num_dir {
                            let b = fine.neighbor(corner, l);
                            let f = fine.flag(fs, b);
                            if f.intersects(CellFlags::UNUSED | CellFlags::BND) {
                                continue;
                            }
                            let enclosed = (1..num_dir).all(|m| {
                                fine.flag(fs, fine.neighbor(b, m)).intersects(CellFlags::UNUSED | CellFlags::GR_FROM_COARSE)
                            });
                            if enclosed {
                                changes += 1;
                                fine.set_flag(fs, b, f.rebased(CellFlags::UNUSED));
                                fine.set_flag(fo, b, f.rebased(CellFlags::UNUSED));
                            }
                        }
                    }
                }
            }
        }

        for &index in &interior {
            if !coarse.flag(s, index).intersects(CellFlags::EMPTY) {
                continue;
            }
            let fc = fine_center(coarse, fine, index);
            if qualifies(fine.flag(fs, fc), req) {
                let f = coarse.flag(s, index);
                coarse.set_flag(s, index, f.rebased(CellFlags::FLUID | CellFlags::GR_FROM_FINE));
                changes += 1;
            }
        }
        changes
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::index_space::IndexSpace;
    use crate::lattice::LatticeKind;

    fn pair(lattice: &LatticeModel) -> Vec<Level> {
        let fine_space = IndexSpace::new([16, 16, 1], 2).unwrap();
        let mut coarse = Level::allocate(0, 1, fine_space.coarsen(), lattice).unwrap();
        let mut fine = Level::allocate(1, 1, fine_space, lattice).unwrap();
        fine.omega = 1.5;
        fine.time_step = 1.0;
        coarse.omega = 1.0 / (2.0 * (1.0 / 1.5 - 0.5) + 0.5);
        coarse.time_step = 2.0;
        vec![coarse, fine]
    }

    #[test]
    fn linear_interpolation_stays_within_sources() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let mut levels = pair(&lattice);
        let coarse_space = levels[0].space();
        for p in coarse_space.iter() {
            let index = levels[0].index(p);
            let rho = 1.0 + 0.01 * p[0] as f64 + 0.003 * p[1] as f64;
            levels[0].init_cell(index, CellFlags::FLUID, &lattice, rho, rho, [0.01, 0.0, 0.0]);
        }
        let params = levels[1].params();
        let mut out = vec![0.0; levels[1].stride()];
        for &p in &[[5usize, 7usize, 0usize], [6, 7, 0], [5, 6, 0], [9, 9, 0]] {
            interpolate_into(&lattice, &levels[0], &params, p, Interpolation { order: 1, time_blend: 0.0 }, &mut out);
            let rho: f64 = out[..9].iter().sum();
            let sources: Vec<f64> = [[0, 0], [1, 0], [0, 1], [1, 1]]
                .iter()
                .map(|d| levels[0].curr().density(coarse_space.index(p[0] / 2 + d[0], p[1] / 2 + d[1], 0)))
                .collect();
            let lo = sources.iter().cloned().fold(f64::MAX, f64::min);
            let hi = sources.iter().cloned().fold(f64::MIN, f64::max);
            assert!(rho >= lo - 1e-12 && rho <= hi + 1e-12, "{} not in [{}, {}]", rho, lo, hi);
        }
    }

    #[test]
    fn interpolation_of_equilibrium_is_equilibrium() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let mut levels = pair(&lattice);
        for p in levels[0].space().iter() {
            let index = levels[0].index(p);
            levels[0].init_cell(index, CellFlags::FLUID, &lattice, 1.02, 1.02, [0.0, 0.02, 0.0]);
        }
        let params = levels[1].params();
        let mut out = vec![0.0; levels[1].stride()];
        interpolate_into(&lattice, &levels[0], &params, [7, 7, 0], Interpolation { order: 2, time_blend: 0.0 }, &mut out);
        for l in 0..9 {
            assert!((out[l] - lattice.equilibrium(l, 1.02, [0.0, 0.02, 0.0])).abs() < 1e-12);
        }
    }

    #[test]
    fn restriction_reproduces_uniform_fine_state() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let mut levels = pair(&lattice);
        for p in levels[1].space().iter() {
            let index = levels[1].index(p);
            levels[1].init_cell(index, CellFlags::FLUID | CellFlags::NO_BND_FLUID, &lattice, 1.01, 1.01, [0.01, 0.0, 0.0]);
        }
        let target = levels[0].index([3, 3, 0]);
        levels[0].init_cell(target, CellFlags::FLUID | CellFlags::GR_FROM_FINE, &lattice, 1.0, 1.0, [0.0; 3]);

        let refiner = Refiner::new(&lattice);
        refiner.coarse_restrict_from_fine(&lattice, &mut levels, 0);
        assert!((levels[0].curr().density(target) - 1.01).abs() < 1e-12);
    }

    #[test]
    fn flux_area_of_fully_coarse_cell_is_one() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let mut levels = pair(&lattice);
        let target = levels[0].index([3, 3, 0]);
        levels[0].init_cell(target, CellFlags::FLUID | CellFlags::GR_NORM, &lattice, 1.0, 1.0, [0.0; 3]);
        let fc = levels[1].index([6, 6, 0]);
        levels[1].init_cell(fc, CellFlags::UNUSED, &lattice, 1.0, 0.0, [0.0; 3]);

        let refiner = Refiner::new(&lattice);
        refiner.coarse_calculate_flux_areas(&lattice, &mut levels, 0);
        assert_eq!(levels[0].curr().flux(target), 1.0);

        levels[1].init_cell(fc, CellFlags::FLUID | CellFlags::GR_FROM_COARSE, &lattice, 1.0, 1.0, [0.0; 3]);
        refiner.coarse_calculate_flux_areas(&lattice, &mut levels, 0);
        // center plus the eight Empty fine neighbors
        assert!((levels[0].curr().flux(target) - 1.0).abs() < 1e-12);
    }
}
