use serde::{Deserialize, Serialize};

/// Largest number of distribution functions carried by any lattice model.
pub const MAX_DF: usize = 19;

/// Largest number of neighbor directions (DF directions plus corners).
pub const MAX_DIR: usize = 27;

/// Regularization constant used by the free-surface heuristics.
pub const LBM_EPSILON: f64 = 1e-5;

const D2Q9_VECTORS: [[i32; 3]; 9] = [
    [0, 0, 0],
    [0, 1, 0],
    [0, -1, 0],
    [1, 0, 0],
    [-1, 0, 0],
    [1, 1, 0],
    [-1, 1, 0],
    [1, -1, 0],
    [-1, -1, 0],
];

const D3Q27_VECTORS: [[i32; 3]; 27] = [
    [0, 0, 0],
    [0, 1, 0],
    [0, -1, 0],
    [1, 0, 0],
    [-1, 0, 0],
    [0, 0, 1],
    [0, 0, -1],
    [1, 1, 0],
    [-1, 1, 0],
    [1, -1, 0],
    [-1, -1, 0],
    [0, 1, 1],
    [0, 1, -1],
    [0, -1, 1],
    [0, -1, -1],
    [1, 0, 1],
    [1, 0, -1],
    [-1, 0, 1],
    [-1, 0, -1],
    [1, 1, 1],
    [-1, 1, 1],
    [1, -1, 1],
    [-1, -1, 1],
    [1, 1, -1],
    [-1, 1, -1],
    [1, -1, -1],
    [-1, -1, -1],
];

/// Selects the discrete velocity set.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatticeKind {
    D2Q9,
    D3Q19,
}

/// Immutable descriptor of a discrete velocity set. Directions `0..num_df`
/// carry distribution functions, direction 0 is the rest population, and
/// directions `num_df..num_dir` are the corner directions used only when
/// scanning a cell's full neighborhood.
///
#[derive(Clone, Debug)]
pub struct LatticeModel {
    kind: LatticeKind,
    dim: usize,
    num_df: usize,
    num_dir: usize,
    vectors: Vec<[i32; 3]>,
    weights: Vec<f64>,
    inverse: Vec<usize>,
    mirror: [Vec<usize>; 3],
    rest: Vec<f64>,
}

// ============================================================================
impl LatticeModel {
    pub fn new(kind: LatticeKind) -> Self {
        let (dim, num_df, vectors): (usize, usize, &[[i32; 3]]) = match kind {
            LatticeKind::D2Q9 => (2, 9, &D2Q9_VECTORS),
            LatticeKind::D3Q19 => (3, 19, &D3Q27_VECTORS),
        };
        let weights: Vec<f64> = vectors
            .iter()
            .enumerate()
            .map(|(l, e)| if l < num_df { direction_weight(dim, e) } else { 0.0 })
            .collect();
        let inverse = vectors
            .iter()
            .map(|e| lookup(vectors, [-e[0], -e[1], -e[2]]))
            .collect();
        let reflect = |axis: usize| -> Vec<usize> {
            vectors
                .iter()
                .map(|e| {
                    let mut m = *e;
                    m[axis] = -m[axis];
                    lookup(vectors, m)
                })
                .collect()
        };
        let mirror = [reflect(0), reflect(1), reflect(2)];
        let rest = weights[..num_df].to_vec();

        Self {
            kind,
            dim,
            num_df,
            num_dir: vectors.len(),
            vectors: vectors.to_vec(),
            weights,
            inverse,
            mirror,
            rest,
        }
    }

    pub fn kind(&self) -> LatticeKind {
        self.kind
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Number of directions carrying distribution functions.
    pub fn num_df(&self) -> usize {
        self.num_df
    }

    /// Number of neighbor directions, including the rest direction and the
    /// corners.
    pub fn num_dir(&self) -> usize {
        self.num_dir
    }

    pub fn vector(&self, l: usize) -> [i32; 3] {
        self.vectors[l]
    }

    pub fn vector_f(&self, l: usize) -> [f64; 3] {
        let e = self.vectors[l];
        [e[0] as f64, e[1] as f64, e[2] as f64]
    }

    /// Unit vector along direction `l`; zero for the rest direction.
    pub fn normalized(&self, l: usize) -> [f64; 3] {
        let e = self.vector_f(l);
        let len = (e[0] * e[0] + e[1] * e[1] + e[2] * e[2]).sqrt();
        if len > 0.0 {
            [e[0] / len, e[1] / len, e[2] / len]
        } else {
            e
        }
    }

    pub fn weight(&self, l: usize) -> f64 {
        self.weights[l]
    }

    pub fn inverse(&self, l: usize) -> usize {
        self.inverse[l]
    }

    /// The direction obtained by negating component `axis` of `e_l`.
    pub fn mirror(&self, l: usize, axis: usize) -> usize {
        self.mirror[axis][l]
    }

    /// Equilibrium distribution at unit density and zero velocity.
    pub fn rest_equilibrium(&self) -> &[f64] {
        &self.rest
    }

    pub fn equilibrium(&self, l: usize, rho: f64, u: [f64; 3]) -> f64 {
        let e = self.vector_f(l);
        let eu = e[0] * u[0] + e[1] * u[1] + e[2] * u[2];
        let usqr = u[0] * u[0] + u[1] * u[1] + u[2] * u[2];
        self.weights[l] * (rho - 1.5 * usqr + 3.0 * eu + 4.5 * eu * eu)
    }

    /// Fill the first `num_df` entries of `out` with the equilibrium
    /// distribution.
    pub fn equilibrium_into(&self, rho: f64, u: [f64; 3], out: &mut [f64]) {
        for (l, f) in out.iter_mut().take(self.num_df).enumerate() {
            *f = self.equilibrium(l, rho, u);
        }
    }

    /// Density and (incompressible) momentum of a set of distribution
    /// functions.
    pub fn moments(&self, df: &[f64]) -> (f64, [f64; 3]) {
        let mut rho = 0.0;
        let mut u = [0.0; 3];
        for l in 0..self.num_df {
            let e = self.vectors[l];
            rho += df[l];
            u[0] += e[0] as f64 * df[l];
            u[1] += e[1] as f64 * df[l];
            u[2] += e[2] as f64 * df[l];
        }
        (rho, u)
    }

    /// Magnitude of the non-equilibrium momentum flux tensor, the input to
    /// the Smagorinsky model.
    pub fn noneq_stress(&self, df: &[f64], feq: &[f64]) -> f64 {
        let mut diagonal = 0.0;
        let mut off_diagonal = 0.0;

        for a in 0..self.dim {
            for b in 0..=a {
                let mut s = 0.0;
                for l in 0..self.num_df {
                    let e = self.vectors[l];
                    s += (e[a] * e[b]) as f64 * (df[l] - feq[l]);
                }
                if a == b {
                    diagonal += s * s;
                } else {
                    off_diagonal += s * s;
                }
            }
        }
        (diagonal + 2.0 * off_diagonal).sqrt()
    }

    /// Relaxation rate including the Smagorinsky eddy viscosity.
    pub fn les_omega(&self, omega: f64, csmago: f64, q: f64) -> f64 {
        if csmago <= 0.0 {
            return omega;
        }
        let nu = (2.0 / omega - 1.0) / 6.0;
        let nu_t = (-nu + (nu * nu + 18.0 * csmago * csmago * q).sqrt()) / 6.0;
        1.0 / (3.0 * (nu + nu_t) + 0.5)
    }

    /// Normalized Gaussian weights used to restrict fine distribution
    /// functions onto a coarse cell.
    pub fn restriction_weights(&self) -> Vec<f64> {
        let cutoff = (-2.0 * self.dim as f64).exp();
        let raw: Vec<f64> = (0..self.num_df)
            .map(|l| {
                let e = self.vector_f(l);
                (-(e[0] * e[0] + e[1] * e[1] + e[2] * e[2])).exp() - cutoff
            })
            .collect();
        let total: f64 = raw.iter().sum();
        raw.into_iter().map(|w| w / total).collect()
    }

    /// Fraction of a coarse cell's volume covered by the fine cell in
    /// direction `l` of its fine center, for every neighbor direction.
    pub fn coarse_flux_areas(&self) -> Vec<f64> {
        (0..self.num_dir)
            .map(|l| {
                let nonzero = self.vectors[l].iter().filter(|c| **c != 0).count();
                0.5f64.powi(self.dim as i32) * 0.5f64.powi(nonzero as i32)
            })
            .collect()
    }
}

fn direction_weight(dim: usize, e: &[i32; 3]) -> f64 {
    let nonzero = e.iter().filter(|c| **c != 0).count();
    match (dim, nonzero) {
        (2, 0) => 4.0 / 9.0,
        (2, 1) => 1.0 / 9.0,
        (2, _) => 1.0 / 36.0,
        (_, 0) => 1.0 / 3.0,
        (_, 1) => 1.0 / 18.0,
        (_, _) => 1.0 / 36.0,
    }
}

fn lookup(vectors: &[[i32; 3]], target: [i32; 3]) -> usize {
    match vectors.iter().position(|e| *e == target) {
        Some(l) => l,
        None => panic!("direction table is not closed under reflection: {:?}", target),
    }
}
