use log::warn;
use crate::flags::CellFlags;
use crate::kernel::{collide, stream_with_boundaries, CellContext, SweepTotals};
use crate::lattice::{LatticeModel, LBM_EPSILON, MAX_DF};
use crate::level::{CellSet, Level, AUX_FFRAC, AUX_FLUX, AUX_MASS};

/// Excess above the density at which an interface cell counts as full,
/// and the deficit below zero at which it counts as empty.
const FILL_THRESHOLD: f64 = 0.025;

/// Interface cells cut off from fluid (or gas) are converted once their
/// fill fraction passes these bounds.
const ISOLATED_FULL: f64 = 0.9;
const ISOLATED_EMPTY: f64 = 0.1;

const TRANSIENT: CellFlags = CellFlags::from_bits(
    CellFlags::NO_NB_FLUID.bits()
        | CellFlags::NO_NB_EMPTY.bits()
        | CellFlags::NO_DELETE.bits()
        | CellFlags::NO_INTERPOL_SRC.bits()
        | CellFlags::NO_BND_FLUID.bits(),
);

/// Counts from one flag reinitialization.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReinitReport {
    pub filled: usize,
    pub emptied: usize,
    pub new_interface: usize,
}

/// Surface normal of a cell from the fill fractions of its axis
/// neighbors; it points from the fluid toward the gas.
pub fn surface_normal(lattice: &LatticeModel, offsets: &[isize], set: CellSet, index: usize) -> [f64; 3] {
    let frac = |l: usize| {
        let nb = crate::index_space::IndexSpace::shifted(index, offsets[l]);
        if set.flag(nb).intersects(CellFlags::FLUID | CellFlags::INTER) {
            set.ffrac(nb)
        } else {
            0.0
        }
    };
    let z = if lattice.dimension() == 3 { 0.5 * (frac(6) - frac(5)) } else { 0.0 };
    [0.5 * (frac(4) - frac(3)), 0.5 * (frac(2) - frac(1)), z]
}

/// Share of excess mass a full (`forward`) or empty cell hands to its
/// neighbor in direction `l`.
pub fn mass_weight(lattice: &LatticeModel, normal: [f64; 3], l: usize, forward: bool) -> f64 {
    let e = lattice.normalized(l);
    let scal = e[0] * normal[0] + e[1] * normal[1] + e[2] * normal[2];
    if forward {
        if scal < LBM_EPSILON { 0.0 } else { scal }
    } else if scal > -LBM_EPSILON {
        0.0
    } else {
        -scal
    }
}

/// Average density and velocity of the neighbors that may serve as an
/// interpolation source: fluid cells, and interface cells which were not
/// just created. Falls back to the rest state if there are none.
pub fn average_neighbors(lattice: &LatticeModel, offsets: &[isize], set: CellSet, index: usize) -> Option<(f64, [f64; 3])> {
    let mut rho = 0.0;
    let mut u = [0.0; 3];
    let mut count = 0;

    for l in 1..lattice.num_df() {
        let nb = crate::index_space::IndexSpace::shifted(index, offsets[l]);
        let f = set.flag(nb);
        if f.intersects(CellFlags::FLUID) || (f.intersects(CellFlags::INTER) && !f.intersects(CellFlags::NO_INTERPOL_SRC)) {
            let (r, v) = lattice.moments(set.dfs(nb));
            rho += r;
            for a in 0..3 {
                u[a] += v[a];
            }
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }
    let c = count as f64;
    Some((rho / c, [u[0] / c, u[1] / c, u[2] / c]))
}

// ============================================================================
/// Update of one interface cell within a fine sweep: stream, exchange mass
/// with the neighbors, reconstruct populations coming from the gas side,
/// collide, and decide whether the cell has filled or emptied.
#[allow(clippy::too_many_arguments)]
pub(crate) fn interface_cell(
    cx: &CellContext,
    index: usize,
    old: CellFlags,
    nbflag: &[CellFlags; MAX_DF],
    nbored: CellFlags,
    cell: &mut [f64],
    flag: &mut CellFlags,
    totals: &mut SweepTotals,
) {
    let lattice = cx.lattice;
    let params = cx.params;
    let src = cx.src;
    let n = lattice.num_df();

    let mut new_flag = old & !TRANSIENT;
    let mut m = [0.0; MAX_DF];
    stream_with_boundaries(cx, index, &mut m);

    if !nbored.intersects(CellFlags::FLUID) {
        new_flag.insert(CellFlags::NO_NB_FLUID);
    }
    if !nbored.intersects(CellFlags::EMPTY) {
        new_flag.insert(CellFlags::NO_NB_EMPTY);
    }

    let my_frac = src.ffrac(index);
    let my_flux = src.flux(index);
    let mut mass = src.mass(index);
    let mut recons = [false; MAX_DF];
    let self_bits = old & (CellFlags::NO_NB_FLUID | CellFlags::NO_NB_EMPTY);

    for l in 1..n {
        let nb = params.neighbor(index, l);
        let nbf = nbflag[l];
        let nbdf = m[lattice.inverse(l)];
        let mydf = src.df(index, l);

        if nbf.intersects(CellFlags::FLUID) {
            mass += nbdf - mydf;
        } else if nbf.intersects(CellFlags::INTER) {
            let mynbfac = src.flux(nb) / my_flux;
            let nbnbfac = 1.0 / mynbfac;
            let nb_bits = nbf & (CellFlags::NO_NB_FLUID | CellFlags::NO_NB_EMPTY);
            let exchange = interface_exchange(self_bits, nb_bits, nbnbfac * nbdf, mynbfac * mydf);
            mass += exchange * (my_frac + src.ffrac(nb)) * 0.5;
        } else {
            recons[l] = true;
        }
    }

    let normal = surface_normal(lattice, &params.offsets, src, index);
    if normal[0].abs() + normal[1].abs() + normal[2].abs() > LBM_EPSILON {
        for l in 1..n {
            let e = lattice.vector_f(l);
            if e[0] * normal[0] + e[1] * normal[1] + e[2] * normal[2] > LBM_EPSILON {
                recons[l] = true;
            }
        }
    }

    let (_, u_old) = lattice.moments(src.dfs(index));
    for l in 1..n {
        if recons[l] {
            let inv = lattice.inverse(l);
            m[inv] = lattice.equilibrium(l, 1.0, u_old) + lattice.equilibrium(inv, 1.0, u_old) - src.df(index, l);
        }
    }

    let collision = collide(lattice, &mut m[..n], params.gravity, params.omega, params.csmago);
    let rho = collision.rho;
    totals.check(index, &collision);
    totals.track_velocity(&collision);

    if old.intersects(CellFlags::INFLOW) && my_frac < 0.5 {
        mass += 0.25;
        totals.initial_mass_delta += 0.25;
    }

    let mut filled = is_filled(mass, rho);
    let mut emptied = is_emptied(mass, rho);

    if old.intersects(CellFlags::OUTFLOW) {
        totals.initial_mass_delta -= mass;
        mass = 0.0;
        filled = false;
        emptied = true;
    }

    let has_inter_nb = nbored.intersects(CellFlags::INTER);
    if !filled
        && old.intersects(CellFlags::NO_NB_EMPTY)
        && new_flag.intersects(CellFlags::NO_NB_EMPTY)
        && (mass > rho * ISOLATED_FULL || !has_inter_nb)
    {
        filled = true;
    }
    if !emptied
        && old.intersects(CellFlags::NO_NB_FLUID)
        && new_flag.intersects(CellFlags::NO_NB_FLUID)
        && (mass < rho * ISOLATED_EMPTY || !has_inter_nb)
    {
        emptied = true;
    }
    if filled {
        totals.filled.push(index);
    } else if emptied {
        totals.emptied.push(index);
    }

    let mut flux = 0.5 * n as f64;
    for l in 1..n {
        if nbflag[l].intersects(CellFlags::FLUID | CellFlags::INTER | CellFlags::BND) {
            flux += lattice.weight(l);
        }
    }

    let ffrac = mass / rho;
    cell[..n].copy_from_slice(&m[..n]);
    cell[n + AUX_FFRAC] = ffrac;
    cell[n + AUX_MASS] = mass;
    cell[n + AUX_FLUX] = flux;
    *flag = new_flag;
    totals.mass += mass;
    totals.volume += ffrac;
}

fn is_filled(mass: f64, rho: f64) -> bool {
    mass >= rho * (1.0 + FILL_THRESHOLD)
}

fn is_emptied(mass: f64, rho: f64) -> bool {
    mass <= -rho * FILL_THRESHOLD
}

/// Mass moved between two interface cells. Cells without fluid neighbors
/// only take in, cells without gas neighbors only give away, so that mass
/// drains from the gas side toward the fluid side.
fn interface_exchange(self_bits: CellFlags, nb_bits: CellFlags, inflow: f64, outflow: f64) -> f64 {
    const NONE: CellFlags = CellFlags::NONE;
    const NO_FLUID: CellFlags = CellFlags::NO_NB_FLUID;
    const NO_EMPTY: CellFlags = CellFlags::NO_NB_EMPTY;

    match (self_bits, nb_bits) {
        (NONE, NO_FLUID) => inflow,
        (NONE, NO_EMPTY) => -outflow,
        (NO_FLUID, NONE) | (NO_FLUID, NO_EMPTY) => -outflow,
        (NO_EMPTY, NONE) | (NO_EMPTY, NO_FLUID) => inflow,
        _ => inflow - outflow,
    }
}

// ============================================================================
/// Turn the filled and emptied interface cells of the last sweep into fluid
/// and gas, grow the interface around them, and hand their excess mass to
/// the neighboring interface cells. Runs on the current buffer of the
/// finest level after the swap. Every pass first decides from an unchanged
/// view of the grid, then applies.
pub fn reinit_flags(
    lattice: &LatticeModel,
    level: &mut Level,
    mut filled: Vec<usize>,
    mut emptied: Vec<usize>,
    fix_mass: &mut f64,
) -> ReinitReport {
    let work = level.set_curr();
    let other = level.set_other();
    let offsets = *level.offsets();
    let n = lattice.num_df();

    filled.sort_unstable();
    filled.dedup();
    emptied.sort_unstable();
    emptied.dedup();

    let mut new_interface = Vec::new();

    // Filled cells: gas neighbors join the interface, interface neighbors
    // must not empty in this pass.
    let mut created = Vec::new();
    let mut protected = Vec::new();
    {
        let set = level.set(work);
        for &c in &filled {
            for l in 1..n {
                let nb = level.neighbor(c, l);
                let f = set.flag(nb);
                if f.intersects(CellFlags::EMPTY) {
                    created.push(nb);
                } else if f.intersects(CellFlags::INTER) {
                    protected.push(nb);
                }
            }
        }
    }
    created.sort_unstable();
    created.dedup();

    let seeds: Vec<(usize, f64, [f64; 3])> = {
        let set = level.set(work);
        created
            .iter()
            .map(|&c| match average_neighbors(lattice, &offsets, set, c) {
                Some((rho, u)) => (c, rho, u),
                None => {
                    warn!("new interface cell {:?} has no fluid neighbor", level.space().coords(c));
                    (c, 1.0, [0.0; 3])
                }
            })
            .collect()
    };
    for (c, rho, u) in seeds {
        let flag = level.flag(work, c).rebased(CellFlags::INTER | CellFlags::NO_INTERPOL_SRC | CellFlags::NO_DELETE);
        level.write_equilibrium(work, c, lattice, rho, 0.0, u);
        level.set_flag(work, c, flag);
        new_interface.push(c);
    }
    for &c in &protected {
        level.insert_flag(work, c, CellFlags::NO_DELETE);
        new_interface.push(c);
    }
    for &c in &filled {
        let flag = level.flag(work, c).rebased(CellFlags::FLUID);
        level.set_flag(work, c, flag);
    }

    // Emptied cells next to a cell that just filled stay in the interface.
    emptied.retain(|&c| {
        if level.flag(work, c).contains(CellFlags::INTER | CellFlags::NO_DELETE) {
            new_interface.push(c);
            false
        } else {
            true
        }
    });

    let mut converted = Vec::new();
    for &c in &emptied {
        for l in 1..n {
            let nb = level.neighbor(c, l);
            let f = level.flag(work, nb);
            if f.intersects(CellFlags::FLUID) {
                converted.push(nb);
            } else if f.intersects(CellFlags::INTER) {
                new_interface.push(nb);
            }
        }
    }
    converted.sort_unstable();
    converted.dedup();
    for &c in &converted {
        let rho = level.density(work, c);
        let flag = level.flag(work, c).rebased(CellFlags::INTER);
        level.set_flag(work, c, flag);
        level.set_mass(work, c, rho);
        level.set_ffrac(work, c, 1.0);
        new_interface.push(c);
    }
    for &c in &emptied {
        let flag = level.flag(work, c).rebased(CellFlags::EMPTY);
        level.set_flag(work, c, flag);
    }

    // Distribution weights, from the grid as it is now.
    let distribute = |level: &Level, c: usize, forward: bool| -> Vec<(usize, f64)> {
        let set = level.set(work);
        let normal = surface_normal(lattice, &offsets, set, c);
        (1..n)
            .map(|l| level.neighbor(c, l))
            .zip(1..n)
            .filter(|(nb, _)| set.flag(*nb).intersects(CellFlags::INTER))
            .map(|(nb, l)| (nb, mass_weight(lattice, normal, l, forward)))
            .collect()
    };
    let full_targets: Vec<Vec<(usize, f64)>> = filled.iter().map(|&c| distribute(level, c, true)).collect();
    let empty_targets: Vec<Vec<(usize, f64)>> = emptied.iter().map(|&c| distribute(level, c, false)).collect();

    for (&c, targets) in filled.iter().zip(&full_targets) {
        let rho = level.density(work, c);
        let excess = level.mass(work, c) - rho;
        spread_mass(level, work, targets, excess, fix_mass);
        level.set_mass(work, c, rho);
        level.set_ffrac(work, c, 1.0);
    }
    for (&c, targets) in emptied.iter().zip(&empty_targets) {
        let excess = level.mass(work, c);
        spread_mass(level, work, targets, excess, fix_mass);
        level.set_mass(work, c, 0.0);
        level.set_ffrac(work, c, 0.0);
        let flag = level.flag(other, c).rebased(CellFlags::EMPTY);
        level.set_flag(other, c, flag);
    }

    new_interface.sort_unstable();
    new_interface.dedup();
    new_interface.retain(|&c| level.flag(work, c).intersects(CellFlags::INTER));

    if !new_interface.is_empty() {
        let share = *fix_mass / new_interface.len() as f64;
        for &c in &new_interface {
            let mut nbored = CellFlags::NONE;
            for l in 1..n {
                nbored |= level.flag(work, level.neighbor(c, l));
            }
            let mut flag = level.flag(work, c);
            if !nbored.intersects(CellFlags::FLUID) {
                flag.insert(CellFlags::NO_NB_FLUID);
            }
            if !nbored.intersects(CellFlags::EMPTY) {
                flag.insert(CellFlags::NO_NB_EMPTY);
            }
            if !level.flag(other, c).intersects(CellFlags::INTER) {
                flag.insert(CellFlags::NO_DELETE);
            }
            level.set_flag(work, c, flag);

            let mass = level.mass(work, c) + share;
            let rho = level.density(work, c);
            level.set_mass(work, c, mass);
            level.set_ffrac(work, c, mass / rho);
            level.set_flux(work, c, 0.5 * n as f64);
        }
        *fix_mass = 0.0;
    }

    ReinitReport {
        filled: filled.len(),
        emptied: emptied.len(),
        new_interface: new_interface.len(),
    }
}

fn spread_mass(level: &mut Level, s: usize, targets: &[(usize, f64)], excess: f64, fix_mass: &mut f64) {
    if targets.is_empty() {
        *fix_mass += excess;
        return;
    }
    let total: f64 = targets.iter().map(|(_, w)| w).sum();
    for &(nb, w) in targets {
        let share = if total > 0.0 { w / total } else { 1.0 / targets.len() as f64 };
        let mass = level.mass(s, nb) + excess * share;
        level.set_mass(s, nb, mass);
    }
}

// ============================================================================
/// Surround the initial fluid with interface cells and remove interface
/// cells that separate nothing. Works on both buffers of the finest level.
pub fn init_free_surfaces(lattice: &LatticeModel, level: &mut Level, fill: f64) {
    let work = level.set_curr();
    let offsets = *level.offsets();
    let space = level.space();
    let n = lattice.num_df();

    let mut created = Vec::new();
    for p in space.iter_interior() {
        let index = level.index(p);
        if !level.flag(work, index).intersects(CellFlags::FLUID) {
            continue;
        }
        for l in 1..n {
            let nb = level.neighbor(index, l);
            if level.flag(work, nb).intersects(CellFlags::EMPTY) && space.is_interior(space.coords(nb)) {
                created.push(nb);
            }
        }
    }
    created.sort_unstable();
    created.dedup();
    let seeds: Vec<(usize, f64, [f64; 3])> = created
        .iter()
        .map(|&c| {
            let (rho, u) = average_neighbors(lattice, &offsets, level.set(work), c).unwrap_or((1.0, [0.0; 3]));
            (c, rho, u)
        })
        .collect();
    for (c, rho, u) in seeds {
        let flag = level.flag(work, c).rebased(CellFlags::INTER);
        level.init_cell(c, flag, lattice, rho, fill * rho, u);
    }

    // Interface cells without fluid, without a neighboring interface, or
    // without gas next to them are not part of a surface.
    enum Fix {
        ToEmpty(usize),
        ToFluid(usize, f64, [f64; 3]),
    }
    let fixes: Vec<Fix> = {
        let set = level.set(work);
        space
            .iter_interior()
            .map(|p| level.index(p))
            .filter(|&c| set.flag(c).intersects(CellFlags::INTER))
            .filter_map(|c| {
                let mut nbored = CellFlags::NONE;
                for l in 1..n {
                    nbored |= set.flag(level.neighbor(c, l));
                }
                if !nbored.intersects(CellFlags::EMPTY) {
                    let (rho, u) = average_neighbors(lattice, &offsets, set, c).unwrap_or((1.0, [0.0; 3]));
                    Some(Fix::ToFluid(c, rho, u))
                } else if !nbored.intersects(CellFlags::FLUID) || !nbored.intersects(CellFlags::INTER) {
                    Some(Fix::ToEmpty(c))
                } else {
                    None
                }
            })
            .collect()
    };
    for fix in fixes {
        match fix {
            Fix::ToEmpty(c) => {
                let flag = level.flag(work, c).rebased(CellFlags::EMPTY);
                level.init_cell(c, flag, lattice, 1.0, 0.0, [0.0; 3]);
            }
            Fix::ToFluid(c, rho, u) => {
                let flag = level.flag(work, c).rebased(CellFlags::FLUID);
                level.init_cell(c, flag, lattice, rho, rho, u);
            }
        }
    }

    for index in 0..space.len() {
        for s in 0..2 {
            let f = level.flag(s, index);
            if f.intersects(CellFlags::BND | CellFlags::EMPTY) {
                level.set_ffrac(s, index, 0.0);
                level.set_mass(s, index, 0.0);
            }
        }
    }
}

/// Average the interface fill over each cell's neighborhood. Both buffers
/// hold the same state before the first step, so each pass writes the other
/// buffer and swaps.
pub fn smooth_surface(lattice: &LatticeModel, level: &mut Level, passes: usize) {
    let space = level.space();
    let num_dir = lattice.num_dir();

    for _ in 0..passes {
        let updates: Vec<(usize, f64)> = {
            let set = level.curr();
            space
                .iter_interior()
                .map(|p| level.index(p))
                .filter(|&c| set.flag(c).intersects(CellFlags::INTER))
                .map(|c| {
                    let total: f64 = (0..num_dir)
                        .map(|l| {
                            let nb = level.neighbor(c, l);
                            let f = set.flag(nb);
                            if f.intersects(CellFlags::FLUID) {
                                1.0
                            } else if f.intersects(CellFlags::INTER) {
                                set.mass(nb)
                            } else {
                                0.0
                            }
                        })
                        .sum();
                    (c, total / num_dir as f64)
                })
                .collect()
        };
        let other = level.set_other();
        for index in 0..space.len() {
            level.copy_cell_to_other(index);
        }
        for (c, mass) in updates {
            let rho = level.density(other, c);
            level.set_mass(other, c, mass * rho);
            level.set_ffrac(other, c, mass);
        }
        level.swap();
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::index_space::IndexSpace;
    use crate::lattice::LatticeKind;

    /// A closed 2D box with fluid in the columns `x < fluid_x`.
    fn column(lattice: &LatticeModel, size: [usize; 3], fluid_x: usize) -> Level {
        let space = IndexSpace::new(size, 2).unwrap();
        let mut level = Level::allocate(0, 0, space, lattice).unwrap();
        for p in space.iter() {
            let index = level.index(p);
            let flag = if !space.is_interior(p) {
                CellFlags::BND | CellFlags::BND_NOSLIP
            } else if p[0] < fluid_x {
                CellFlags::FLUID
            } else {
                CellFlags::EMPTY
            };
            let mass = if flag == CellFlags::FLUID { 1.0 } else { 0.0 };
            level.init_cell(index, flag, lattice, 1.0, mass, [0.0; 3]);
        }
        level
    }

    #[test]
    fn exchange_table_is_antisymmetric() {
        let bits = [CellFlags::NONE, CellFlags::NO_NB_FLUID, CellFlags::NO_NB_EMPTY];
        for &a in &bits {
            for &b in &bits {
                // The neighbor sees the same populations with roles swapped.
                let mine = interface_exchange(a, b, 0.3, 0.2);
                let theirs = interface_exchange(b, a, 0.2, 0.3);
                assert!((mine + theirs).abs() < 1e-14, "{:?} {:?}", a, b);
            }
        }
    }

    #[test]
    fn fill_thresholds_include_their_bounds() {
        for &rho in &[1.0, 0.97, 1.03] {
            assert!(is_filled(rho * (1.0 + FILL_THRESHOLD), rho));
            assert!(!is_filled(rho, rho));
            assert!(is_emptied(-rho * FILL_THRESHOLD, rho));
            assert!(!is_emptied(0.0, rho));
        }
    }

    #[test]
    fn interface_surrounds_initial_fluid() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let mut level = column(&lattice, [12, 10, 1], 5);
        init_free_surfaces(&lattice, &mut level, 0.45);

        for j in 1..9 {
            let f = level.flag(0, level.index([5, j, 0]));
            assert!(f.intersects(CellFlags::INTER), "{:?}", f);
            assert!((level.ffrac(1, level.index([5, j, 0])) - 0.45).abs() < 1e-12);
            assert!(level.flag(0, level.index([6, j, 0])).intersects(CellFlags::EMPTY));
            assert!(level.flag(0, level.index([4, j, 0])).intersects(CellFlags::FLUID));
        }
    }

    #[test]
    fn mass_weights_follow_the_normal() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let normal = [1.0, 0.0, 0.0];
        assert!(mass_weight(&lattice, normal, 3, true) > 0.0);
        assert_eq!(mass_weight(&lattice, normal, 4, true), 0.0);
        assert!(mass_weight(&lattice, normal, 4, false) > 0.0);
        assert_eq!(mass_weight(&lattice, normal, 3, false), 0.0);
    }

    #[test]
    fn filling_a_cell_conserves_mass() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let mut level = column(&lattice, [12, 10, 1], 5);
        init_free_surfaces(&lattice, &mut level, 0.45);

        let total = |level: &Level, fix: f64| -> f64 {
            let s = level.set_curr();
            let space = level.space();
            space
                .iter()
                .map(|p| level.index(p))
                .map(|c| {
                    let f = level.flag(s, c);
                    if f.intersects(CellFlags::FLUID) {
                        level.density(s, c)
                    } else if f.intersects(CellFlags::INTER) {
                        level.mass(s, c)
                    } else {
                        0.0
                    }
                })
                .sum::<f64>()
                + fix
        };

        let target = level.index([5, 4, 0]);
        let s = level.set_curr();
        level.set_mass(s, target, 1.2);
        let before = total(&level, 0.0);

        let mut fix_mass = 0.0;
        let report = reinit_flags(&lattice, &mut level, vec![target], vec![], &mut fix_mass);
        assert_eq!(report.filled, 1);
        assert!(level.flag(s, target).intersects(CellFlags::FLUID));
        assert!(level.flag(s, level.index([6, 4, 0])).intersects(CellFlags::INTER));
        assert!((total(&level, fix_mass) - before).abs() < 1e-12);
    }

    #[test]
    fn emptying_a_cell_converts_fluid_neighbors() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let mut level = column(&lattice, [12, 10, 1], 5);
        init_free_surfaces(&lattice, &mut level, 0.45);

        let target = level.index([5, 4, 0]);
        let s = level.set_curr();
        let mut fix_mass = 0.0;
        let report = reinit_flags(&lattice, &mut level, vec![], vec![target], &mut fix_mass);
        assert_eq!(report.emptied, 1);
        assert!(level.flag(s, target).intersects(CellFlags::EMPTY));
        assert!(level.flag(s, level.index([4, 4, 0])).intersects(CellFlags::INTER));
        for p in level.space().iter() {
            assert!(level.flag(s, level.index(p)).is_consistent());
        }
    }

    #[test]
    fn smoothing_keeps_fill_in_unit_range() {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let mut level = column(&lattice, [12, 10, 1], 5);
        init_free_surfaces(&lattice, &mut level, 0.45);
        smooth_surface(&lattice, &mut level, 2);
        let c = level.index([5, 4, 0]);
        let f = level.ffrac(level.set_curr(), c);
        assert!(f > 0.0 && f < 1.0);
    }
}
