//! Fsgr is the numerical core of a free-surface Lattice-Boltzmann fluid
//! solver on adaptive grids. Distribution functions are advanced on a
//! hierarchy of uniform levels, each twice as coarse as the next, where
//! the finest level resolves the free surface and the coarser levels take
//! over the bulk fluid. The surface is tracked with a mass / fill-fraction
//! scheme, and the time step adapts to the observed flow speed.
//!
//! A simulation is set up from a voxel classification of the domain
//! ([`geometry::GeometryInput`]) and a [`config::SolverConfig`], then driven
//! one step at a time through [`solver::Solver::step`].

pub mod config;
pub mod controller;
pub mod error;
pub mod flags;
pub mod free_surface;
pub mod geometry;
pub mod index_space;
pub mod isofield;
pub mod kernel;
pub mod lattice;
pub mod level;
pub mod refinement;
pub mod snapshot;
pub mod solver;
pub mod stats;

pub use error::Error;
pub use solver::Solver;
