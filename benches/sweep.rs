#![feature(test)]
extern crate test;

use fsgr::config::SolverConfig;
use fsgr::geometry::{GeometryInput, VoxelTag};
use fsgr::lattice::LatticeKind;
use fsgr::Solver;

const N: usize = 64;




fn dam_break(kind: LatticeKind, refine: usize) -> Solver {
    let (size, dim) = match kind {
        LatticeKind::D2Q9 => ([N, N, 1], 2),
        LatticeKind::D3Q19 => ([N / 2, N / 2, N / 2], 3),
    };
    let mut config = SolverConfig::in_lattice_units(kind, size[0], 0.02, [0.0, -1e-4, 0.0]);
    config.max_refine = refine;

    let mut geometry = GeometryInput::new(size, dim).unwrap();
    let z = if dim == 2 { 0..1 } else { 1..size[2] };
    geometry.fill_box([1, 1, z.start], [size[0] / 2, size[1] / 2, z.end], VoxelTag::Fluid);
    Solver::new(config, &geometry).unwrap()
}




// ============================================================================
#[bench]
fn stream_collide_d2q9(b: &mut test::Bencher) {
    let mut solver = dam_break(LatticeKind::D2Q9, 0);
    b.iter(|| solver.step().unwrap());
}




// ============================================================================
#[bench]
fn stream_collide_d2q9_two_levels(b: &mut test::Bencher) {
    let mut solver = dam_break(LatticeKind::D2Q9, 1);
    b.iter(|| solver.step().unwrap());
}




// ============================================================================
#[bench]
fn stream_collide_d3q19(b: &mut test::Bencher) {
    let mut solver = dam_break(LatticeKind::D3Q19, 0);
    b.iter(|| solver.step().unwrap());
}




// ============================================================================
#[bench]
fn iso_field_d3q19(b: &mut test::Bencher) {
    let solver = dam_break(LatticeKind::D3Q19, 0);
    b.iter(|| solver.iso_field());
}
