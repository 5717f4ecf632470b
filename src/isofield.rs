use rayon::prelude::*;
use crate::config::IsoWeightMethod;
use crate::flags::CellFlags;
use crate::level::Level;

/// Value of nodes no fluid has been splatted onto.
pub const ISO_BACKGROUND: f64 = -0.42;

/// The 27 splat weights in x-fastest order over offsets -1..=1, normalized
/// to sum 1.
pub fn iso_weights(method: IsoWeightMethod) -> [f64; 27] {
    let mut w = [0.0; 27];
    let mut n = 0;

    for ak in -1i32..=1 {
        for aj in -1i32..=1 {
            for ai in -1i32..=1 {
                let d = ((ai * ai + aj * aj + ak * ak) as f64).sqrt();
                w[n] = match method {
                    IsoWeightMethod::Uniform => 1.0,
                    IsoWeightMethod::Linear => 3f64.sqrt() - d,
                    IsoWeightMethod::Quadratic => (3f64.sqrt() - d).powi(2),
                    IsoWeightMethod::CenterOnly => if d == 0.0 { 1.0 } else { 0.0 },
                };
                n += 1;
            }
        }
    }
    let total: f64 = w.iter().sum();
    for x in w.iter_mut() {
        *x /= total
    }
    w
}




/**
 * A scalar field over the finest grid plus a one-node border on every side,
 * for iso-surface extraction. Fluid cells contribute 1 and interface cells
 * their fill fraction, spread over their 27 neighboring nodes.
 */
#[derive(Clone, Debug)]
pub struct IsoField {
    size: [usize; 3],
    values: Vec<f64>,
}




// ============================================================================
impl IsoField {

    /**
     * Accumulate the field from the current buffer of a level. Nodes are
     * gathered in parallel, one z-y row per task.
     */
    pub fn from_level(level: &Level, method: IsoWeightMethod) -> Self {
        let weights = iso_weights(method);
        let space = level.space();
        let cell_size = space.size();
        let size = [cell_size[0] + 2, cell_size[1] + 2, cell_size[2] + 2];
        let set = level.curr();

        let contribution = |p: [i64; 3]| -> f64 {
            if !space.contains(p) {
                return 0.0;
            }
            let q = [p[0] as usize, p[1] as usize, p[2] as usize];
            if !space.is_interior(q) {
                return 0.0;
            }
            let index = space.index(q[0], q[1], q[2]);
            let flag = set.flag(index);
            if flag.intersects(CellFlags::FLUID) {
                1.0
            } else if flag.intersects(CellFlags::INTER) {
                set.ffrac(index)
            } else {
                0.0
            }
        };

        let mut values = vec![ISO_BACKGROUND; size[0] * size[1] * size[2]];
        values
            .par_chunks_mut(size[0])
            .enumerate()
            .for_each(|(row, values)| {
                let y = (row % size[1]) as i64;
                let z = (row / size[1]) as i64;
                for (x, value) in values.iter_mut().enumerate() {
                    let mut n = 0;
                    for c in -1..=1 {
                        for b in -1..=1 {
                            for a in -1..=1 {
                                let w = weights[n];
                                n += 1;
                                if w != 0.0 {
                                    *value += w * contribution([x as i64 - 1 - a, y - 1 - b, z - 1 - c]);
                                }
                            }
                        }
                    }
                }
            });

        Self { size, values }
    }

    pub fn size(&self) -> [usize; 3] {
        self.size
    }

    /// The node at field coordinates `p`; node `(i + 1, j + 1, k + 1)`
    /// sits on cell `(i, j, k)`.
    pub fn get(&self, p: [usize; 3]) -> f64 {
        self.values[(p[2] * self.size[1] + p[1]) * self.size[0] + p[0]]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}
