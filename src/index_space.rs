use core::ops::Range;
use serde::{Deserialize, Serialize};
use crate::error::Error;




/**
 * The extents of one grid level: a box of cells starting at the origin,
 * stored x-fastest. Two-dimensional spaces have unit depth. The outermost
 * layer of cells on each (active) axis is the boundary layer; everything
 * else is the interior.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpace {
    size: [usize; 3],
    dim: usize,
}




// ============================================================================
impl IndexSpace {


    pub fn new(size: [usize; 3], dim: usize) -> Result<Self, Error> {
        if dim != 2 && dim != 3 {
            return Err(Error::InvalidParameter(format!("index space of dimension {}", dim)));
        }
        if let Some(axis) = (0..3).find(|&a| size[a] == 0) {
            return Err(Error::GridSize { axis, size: 0, reason: "index space has zero volume" });
        }
        if dim == 2 && size[2] != 1 {
            return Err(Error::GridSize { axis: 2, size: size[2], reason: "2D index space must have unit depth" });
        }
        Ok(Self { size, dim })
    }


    /**
     * Return the number of indexes on each axis.
     */
    pub fn size(&self) -> [usize; 3] {
        self.size
    }


    pub fn dim(&self) -> usize {
        self.dim
    }


    /**
     * Return the number of cells in this index space.
     */
    pub fn len(&self) -> usize {
        self.size[0] * self.size[1] * self.size[2]
    }


    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }


    /**
     * Number of rows (runs of cells along the x axis).
     */
    pub fn num_rows(&self) -> usize {
        self.size[1] * self.size[2]
    }


    /**
     * Return the linear offset of the given coordinates.
     */
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        (k * self.size[1] + j) * self.size[0] + i
    }


    /**
     * Return the coordinates of a linear offset.
     */
    pub fn coords(&self, index: usize) -> [usize; 3] {
        let i = index % self.size[0];
        let j = (index / self.size[0]) % self.size[1];
        let k = index / (self.size[0] * self.size[1]);
        [i, j, k]
    }


    /**
     * Signed linear distance covered by the displacement `e`.
     */
    pub fn offset(&self, e: [i32; 3]) -> isize {
        let sx = self.size[0] as isize;
        let sy = self.size[1] as isize;
        e[0] as isize + sx * (e[1] as isize + sy * e[2] as isize)
    }


    /**
     * Apply a precomputed signed offset to a linear index. Callers only use
     * this on interior cells, so the result stays in range.
     */
    pub fn shifted(index: usize, offset: isize) -> usize {
        (index as isize + offset) as usize
    }


    /**
     * Determine whether this index space contains the given (signed)
     * coordinates.
     */
    pub fn contains(&self, p: [i64; 3]) -> bool {
        (0..3).all(|a| p[a] >= 0 && (p[a] as usize) < self.size[a])
    }


    /**
     * The ranges of interior coordinates on each axis. In 2D the single z
     * layer counts as interior.
     */
    pub fn interior(&self) -> [Range<usize>; 3] {
        let k = if self.dim == 2 { 0..1 } else { 1..self.size[2] - 1 };
        [1..self.size[0] - 1, 1..self.size[1] - 1, k]
    }


    pub fn is_interior(&self, p: [usize; 3]) -> bool {
        let r = self.interior();
        (0..3).all(|a| r[a].contains(&p[a]))
    }


    /**
     * Whether the row with linear row number `row = k * size_y + j` lies in
     * the interior.
     */
    pub fn is_interior_row(&self, row: usize) -> bool {
        let r = self.interior();
        r[1].contains(&(row % self.size[1])) && r[2].contains(&(row / self.size[1]))
    }


    /**
     * Return an iterator which traverses all cells in memory order (the x
     * index increases fastest).
     */
    pub fn iter(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        let [sx, sy, sz] = self.size;
        (0..sz).flat_map(move |k| (0..sy).flat_map(move |j| (0..sx).map(move |i| [i, j, k])))
    }


    /**
     * Return an iterator over the interior cells in memory order.
     */
    pub fn iter_interior(&self) -> impl Iterator<Item = [usize; 3]> {
        let [ri, rj, rk] = self.interior();
        rk.flat_map(move |k| {
            let ri = ri.clone();
            rj.clone().flat_map(move |j| ri.clone().map(move |i| [i, j, k]))
        })
    }


    /**
     * The index space of the next coarser level: half the extent on every
     * active axis.
     */
    pub fn coarsen(&self) -> Self {
        let z = if self.dim == 2 { 1 } else { self.size[2] / 2 };
        Self { size: [self.size[0] / 2, self.size[1] / 2, z], dim: self.dim }
    }
}
