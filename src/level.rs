use crate::error::Error;
use crate::flags::CellFlags;
use crate::index_space::IndexSpace;
use crate::lattice::{LatticeModel, MAX_DIR};

/// Offset of the fill fraction behind a cell's distribution functions.
pub const AUX_FFRAC: usize = 0;

/// Offset of the cell mass behind a cell's distribution functions.
pub const AUX_MASS: usize = 1;

/// Offset of the flux-area normalization behind a cell's distribution
/// functions.
pub const AUX_FLUX: usize = 2;

pub const NUM_AUX: usize = 3;

/// Selects one of the two buffers of a level relative to the current one.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Buffer {
    Current,
    Other,
}

/// The scalar parameters of a level, copied out so they can travel into a
/// parallel sweep while the cell arrays are borrowed.
///
#[derive(Clone, Copy, Debug)]
pub struct LevelParams {
    pub id: usize,
    pub space: IndexSpace,
    pub omega: f64,
    pub time_step: f64,
    pub gravity: [f64; 3],
    pub csmago: f64,
    pub num_df: usize,
    pub offsets: [isize; MAX_DIR],
}

impl LevelParams {
    pub fn neighbor(&self, index: usize, l: usize) -> usize {
        IndexSpace::shifted(index, self.offsets[l])
    }
}

/// Read access to one buffer of a level.
///
#[derive(Clone, Copy)]
pub struct CellSet<'a> {
    cells: &'a [f64],
    flags: &'a [CellFlags],
    stride: usize,
    num_df: usize,
}

impl<'a> CellSet<'a> {
    pub fn cell(&self, index: usize) -> &'a [f64] {
        &self.cells[index * self.stride..(index + 1) * self.stride]
    }

    pub fn dfs(&self, index: usize) -> &'a [f64] {
        &self.cells[index * self.stride..index * self.stride + self.num_df]
    }

    pub fn df(&self, index: usize, l: usize) -> f64 {
        self.cells[index * self.stride + l]
    }

    pub fn ffrac(&self, index: usize) -> f64 {
        self.cells[index * self.stride + self.num_df + AUX_FFRAC]
    }

    pub fn mass(&self, index: usize) -> f64 {
        self.cells[index * self.stride + self.num_df + AUX_MASS]
    }

    pub fn flux(&self, index: usize) -> f64 {
        self.cells[index * self.stride + self.num_df + AUX_FLUX]
    }

    pub fn density(&self, index: usize) -> f64 {
        self.dfs(index).iter().sum()
    }

    pub fn flag(&self, index: usize) -> CellFlags {
        self.flags[index]
    }
}

/// Write access to one buffer of a level.
///
pub struct CellSetMut<'a> {
    cells: &'a mut [f64],
    flags: &'a mut [CellFlags],
    stride: usize,
}

impl<'a> CellSetMut<'a> {
    pub fn cell_mut(&mut self, index: usize) -> &mut [f64] {
        &mut self.cells[index * self.stride..(index + 1) * self.stride]
    }

    pub fn set_flag(&mut self, index: usize, flag: CellFlags) {
        self.flags[index] = flag
    }

    pub fn into_parts(self) -> (&'a mut [f64], &'a mut [CellFlags]) {
        (self.cells, self.flags)
    }
}




/**
 * One uniform grid of the hierarchy. Each cell stores `num_df` distribution
 * functions followed by fill fraction, mass and flux, in two buffers that
 * alternate as source and destination of a sweep.
 */
pub struct Level {
    pub id: usize,
    pub node_size: f64,
    pub omega: f64,
    pub time_step: f64,
    pub gravity: [f64; 3],
    pub csmago: f64,
    pub nu: f64,
    pub lsteps: u64,
    pub lmass: f64,
    pub lvolume: f64,
    pub time: f64,
    pub cell_factor: f64,
    space: IndexSpace,
    num_df: usize,
    stride: usize,
    set_curr: usize,
    offsets: [isize; MAX_DIR],
    cells: [Vec<f64>; 2],
    flags: [Vec<CellFlags>; 2],
}




// ============================================================================
impl Level {

    /**
     * Reserve both buffers for a level and initialize every cell as Empty
     * with the rest equilibrium.
     */
    pub fn allocate(id: usize, max_level: usize, space: IndexSpace, lattice: &LatticeModel) -> Result<Self, Error> {
        let num_df = lattice.num_df();
        let stride = num_df + NUM_AUX;
        let n = space.len();

        let mut template = vec![0.0; stride];
        template[..num_df].copy_from_slice(lattice.rest_equilibrium());

        let mut buffers = Vec::with_capacity(2);
        let mut flag_buffers = Vec::with_capacity(2);

        for _ in 0..2 {
            let mut cells: Vec<f64> = Vec::new();
            let mut flags: Vec<CellFlags> = Vec::new();
            cells
                .try_reserve_exact(n * stride)
                .and_then(|_| flags.try_reserve_exact(n))
                .map_err(|_| Error::Allocation { level: id, cells: n })?;

            for _ in 0..n {
                cells.extend_from_slice(&template);
            }
            flags.resize(n, CellFlags::EMPTY);
            buffers.push(cells);
            flag_buffers.push(flags);
        }

        let mut offsets = [0; MAX_DIR];
        for (l, o) in offsets.iter_mut().enumerate().take(lattice.num_dir()) {
            *o = space.offset(lattice.vector(l));
        }
        let cells1 = buffers.pop().unwrap_or_default();
        let cells0 = buffers.pop().unwrap_or_default();
        let flags1 = flag_buffers.pop().unwrap_or_default();
        let flags0 = flag_buffers.pop().unwrap_or_default();

        Ok(Self {
            id,
            node_size: 0.0,
            omega: 1.0,
            time_step: 0.0,
            gravity: [0.0; 3],
            csmago: 0.0,
            nu: 0.0,
            lsteps: 0,
            lmass: 0.0,
            lvolume: 0.0,
            time: 0.0,
            cell_factor: 2f64.powi((space.dim() * (max_level - id)) as i32),
            space,
            num_df,
            stride,
            set_curr: 0,
            offsets,
            cells: [cells0, cells1],
            flags: [flags0, flags1],
        })
    }

    pub fn space(&self) -> IndexSpace {
        self.space
    }

    pub fn num_df(&self) -> usize {
        self.num_df
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn set_curr(&self) -> usize {
        self.set_curr
    }

    pub fn set_other(&self) -> usize {
        self.set_curr ^ 1
    }

    pub fn swap(&mut self) {
        self.set_curr ^= 1
    }

    pub fn offsets(&self) -> &[isize; MAX_DIR] {
        &self.offsets
    }

    pub fn neighbor(&self, index: usize, l: usize) -> usize {
        IndexSpace::shifted(index, self.offsets[l])
    }

    pub fn index(&self, p: [usize; 3]) -> usize {
        self.space.index(p[0], p[1], p[2])
    }

    pub fn buffer(&self, buffer: Buffer) -> usize {
        match buffer {
            Buffer::Current => self.set_curr,
            Buffer::Other => self.set_curr ^ 1,
        }
    }

    pub fn params(&self) -> LevelParams {
        LevelParams {
            id: self.id,
            space: self.space,
            omega: self.omega,
            time_step: self.time_step,
            gravity: self.gravity,
            csmago: self.csmago,
            num_df: self.num_df,
            offsets: self.offsets,
        }
    }

    pub fn set(&self, s: usize) -> CellSet<'_> {
        CellSet {
            cells: &self.cells[s],
            flags: &self.flags[s],
            stride: self.stride,
            num_df: self.num_df,
        }
    }

    pub fn curr(&self) -> CellSet<'_> {
        self.set(self.set_curr)
    }

    pub fn other(&self) -> CellSet<'_> {
        self.set(self.set_curr ^ 1)
    }

    /**
     * Borrow the current buffer for reading and the other one for writing.
     */
    pub fn split(&mut self) -> (CellSet<'_>, CellSetMut<'_>) {
        let stride = self.stride;
        let num_df = self.num_df;
        let (c0, c1) = self.cells.split_at_mut(1);
        let (f0, f1) = self.flags.split_at_mut(1);
        let (src_c, dst_c, src_f, dst_f) = if self.set_curr == 0 {
            (&c0[0], &mut c1[0], &f0[0], &mut f1[0])
        } else {
            (&c1[0], &mut c0[0], &f1[0], &mut f0[0])
        };
        let src = CellSet { cells: src_c, flags: src_f, stride, num_df };
        let dst = CellSetMut { cells: dst_c, flags: dst_f, stride };
        (src, dst)
    }

    pub fn flag(&self, s: usize, index: usize) -> CellFlags {
        self.flags[s][index]
    }

    pub fn set_flag(&mut self, s: usize, index: usize, flag: CellFlags) {
        self.flags[s][index] = flag
    }

    pub fn insert_flag(&mut self, s: usize, index: usize, flag: CellFlags) {
        self.flags[s][index].insert(flag)
    }

    pub fn remove_flag(&mut self, s: usize, index: usize, flag: CellFlags) {
        self.flags[s][index].remove(flag)
    }

    /// Set a flag in both buffers.
    pub fn set_flag_both(&mut self, index: usize, flag: CellFlags) {
        self.flags[0][index] = flag;
        self.flags[1][index] = flag;
    }

    pub fn cell(&self, s: usize, index: usize) -> &[f64] {
        &self.cells[s][index * self.stride..(index + 1) * self.stride]
    }

    pub fn cell_mut(&mut self, s: usize, index: usize) -> &mut [f64] {
        &mut self.cells[s][index * self.stride..(index + 1) * self.stride]
    }

    pub fn density(&self, s: usize, index: usize) -> f64 {
        self.cell(s, index)[..self.num_df].iter().sum()
    }

    pub fn ffrac(&self, s: usize, index: usize) -> f64 {
        self.cell(s, index)[self.num_df + AUX_FFRAC]
    }

    pub fn mass(&self, s: usize, index: usize) -> f64 {
        self.cell(s, index)[self.num_df + AUX_MASS]
    }

    pub fn set_mass(&mut self, s: usize, index: usize, mass: f64) {
        let n = self.num_df;
        self.cell_mut(s, index)[n + AUX_MASS] = mass
    }

    pub fn set_ffrac(&mut self, s: usize, index: usize, ffrac: f64) {
        let n = self.num_df;
        self.cell_mut(s, index)[n + AUX_FFRAC] = ffrac
    }

    pub fn set_flux(&mut self, s: usize, index: usize, flux: f64) {
        let n = self.num_df;
        self.cell_mut(s, index)[n + AUX_FLUX] = flux
    }

    /**
     * Write the equilibrium for `rho` and `u` into one buffer along with the
     * given mass; the fill fraction becomes `mass / rho`.
     */
    pub fn write_equilibrium(&mut self, s: usize, index: usize, lattice: &LatticeModel, rho: f64, mass: f64, u: [f64; 3]) {
        let n = self.num_df;
        let cell = self.cell_mut(s, index);
        lattice.equilibrium_into(rho, u, &mut cell[..n]);
        cell[n + AUX_MASS] = mass;
        cell[n + AUX_FFRAC] = if rho != 0.0 { mass / rho } else { 0.0 };
        cell[n + AUX_FLUX] = 0.5 * n as f64;
    }

    /**
     * Initialize a cell in both buffers.
     */
    pub fn init_cell(&mut self, index: usize, flag: CellFlags, lattice: &LatticeModel, rho: f64, mass: f64, u: [f64; 3]) {
        for s in 0..2 {
            self.write_equilibrium(s, index, lattice, rho, mass, u);
            self.flags[s][index] = flag;
        }
    }

    /**
     * Copy every flag of the current buffer into the other one.
     */
    pub fn copy_flags_to_other(&mut self) {
        let (f0, f1) = self.flags.split_at_mut(1);
        if self.set_curr == 0 {
            f1[0].copy_from_slice(&f0[0]);
        } else {
            f0[0].copy_from_slice(&f1[0]);
        }
    }

    /**
     * Copy a whole cell (values and flag) from the current into the other
     * buffer.
     */
    pub fn copy_cell_to_other(&mut self, index: usize) {
        let stride = self.stride;
        let (c0, c1) = self.cells.split_at_mut(1);
        let range = index * stride..(index + 1) * stride;
        if self.set_curr == 0 {
            c1[0][range.clone()].copy_from_slice(&c0[0][range]);
        } else {
            c0[0][range.clone()].copy_from_slice(&c1[0][range]);
        }
        let f = self.flags[self.set_curr][index];
        self.flags[self.set_curr ^ 1][index] = f;
    }

    pub fn flags_slice(&self, s: usize) -> &[CellFlags] {
        &self.flags[s]
    }

    pub fn cells_slice(&self, s: usize) -> &[f64] {
        &self.cells[s]
    }

    pub(crate) fn restore(&mut self, s: usize, cells: Vec<f64>, flags: Vec<CellFlags>) -> Result<(), Error> {
        if cells.len() != self.cells[s].len() || flags.len() != self.flags[s].len() {
            return Err(Error::Snapshot(format!("level {} buffer size mismatch", self.id)));
        }
        self.cells[s] = cells;
        self.flags[s] = flags;
        Ok(())
    }

    pub(crate) fn set_current_buffer(&mut self, s: usize) {
        self.set_curr = s & 1
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::lattice::LatticeKind;

    fn level() -> (Level, LatticeModel) {
        let lattice = LatticeModel::new(LatticeKind::D2Q9);
        let level = Level::allocate(0, 0, IndexSpace::new([8, 6, 1], 2).unwrap(), &lattice).unwrap();
        (level, lattice)
    }

    #[test]
    fn allocation_starts_empty_at_rest() {
        let (level, _) = level();
        for index in 0..level.space().len() {
            assert_eq!(level.flag(0, index), CellFlags::EMPTY);
            assert!((level.density(1, index) - 1.0).abs() < 1e-14);
        }
        assert_eq!(level.cell_factor, 1.0);
    }

    #[test]
    fn swap_exchanges_source_and_destination() {
        let (mut level, lattice) = level();
        let index = level.index([3, 2, 0]);
        {
            let (src, mut dst) = level.split();
            assert_eq!(src.flag(index), CellFlags::EMPTY);
            dst.set_flag(index, CellFlags::FLUID);
            lattice.equilibrium_into(1.1, [0.0; 3], dst.cell_mut(index));
        }
        level.swap();
        assert_eq!(level.curr().flag(index), CellFlags::FLUID);
        assert!((level.curr().density(index) - 1.1).abs() < 1e-12);
        assert_eq!(level.other().flag(index), CellFlags::EMPTY);
    }

    #[test]
    fn init_cell_writes_both_buffers() {
        let (mut level, lattice) = level();
        let index = level.index([1, 1, 0]);
        level.init_cell(index, CellFlags::INTER, &lattice, 1.0, 0.45, [0.0; 3]);
        for s in 0..2 {
            assert_eq!(level.flag(s, index), CellFlags::INTER);
            assert!((level.ffrac(s, index) - 0.45).abs() < 1e-14);
        }
    }

    #[test]
    fn neighbors_follow_lattice_vectors() {
        let (level, lattice) = level();
        let index = level.index([3, 2, 0]);
        for l in 0..lattice.num_dir() {
            let e = lattice.vector(l);
            let p = [(3 + e[0]) as usize, (2 + e[1]) as usize, 0];
            assert_eq!(level.neighbor(index, l), level.index(p));
        }
    }
}
