use serde::{Deserialize, Serialize};
use crate::error::Error;
use crate::geometry::BoundaryKind;
use crate::lattice::LatticeKind;

/// Largest supported refinement depth; the hierarchy then has five levels.
pub const MAX_REFINE: usize = 4;

/// Splat weights used when accumulating the iso-surface field.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsoWeightMethod {
    /// Every tap weighs the same.
    Uniform,
    /// Weights fall off linearly with distance.
    Linear,
    /// Weights fall off quadratically with distance.
    Quadratic,
    /// Only the center tap.
    CenterOnly,
}

/// Solver settings in physical units, plus switches for optional model
/// features.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub lattice: LatticeKind,
    pub max_refine: usize,
    /// Physical extent of the domain along x, in meters.
    pub domain_size: f64,
    /// Kinematic viscosity in m²/s.
    pub viscosity: f64,
    /// Gravity in m/s².
    pub gravity: [f64; 3],
    /// Physical duration of one finest-level step, in seconds.
    pub step_time: f64,
    pub min_step_time: f64,
    pub max_step_time: f64,
    /// Largest lattice velocity the time adaptation aims to stay below.
    pub max_lattice_speed: f64,
    pub time_adaptation: bool,
    /// Smagorinsky constant; zero disables the turbulence model.
    pub smagorinsky: f64,
    pub domain_boundary: BoundaryKind,
    /// 1 (linear) or 2 (cubic) spatial interpolation from coarse levels.
    pub interpolation_order: usize,
    /// Blend the two coarse buffers when a coarse level has just stepped.
    pub time_interpolation: bool,
    pub iso_weight_method: IsoWeightMethod,
    pub surface_smoothing: usize,
    /// Start with a hydrostatic density gradient in resting fluid.
    pub standing_fluid: bool,
    /// Turn out-of-range densities or velocities into a solver panic.
    pub strict_checks: bool,
    /// Fill fraction of the interface cells created around the initial
    /// fluid.
    pub interface_fill: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            lattice: LatticeKind::D3Q19,
            max_refine: 0,
            domain_size: 0.1,
            viscosity: 1e-6,
            gravity: [0.0, -9.81, 0.0],
            step_time: 2e-3,
            min_step_time: 1e-5,
            max_step_time: 1e-2,
            max_lattice_speed: 0.1,
            time_adaptation: true,
            smagorinsky: 0.02,
            domain_boundary: BoundaryKind::NoSlip,
            interpolation_order: 1,
            time_interpolation: false,
            iso_weight_method: IsoWeightMethod::Linear,
            surface_smoothing: 0,
            standing_fluid: true,
            strict_checks: false,
            interface_fill: 0.45,
        }
    }
}

// ============================================================================
impl SolverConfig {
    /// A configuration whose physical units coincide with lattice units for
    /// a finest grid `size_x` cells wide: cell size 1, step time 1.
    pub fn in_lattice_units(lattice: LatticeKind, size_x: usize, viscosity: f64, gravity: [f64; 3]) -> Self {
        Self {
            lattice,
            domain_size: size_x as f64,
            viscosity,
            gravity,
            step_time: 1.0,
            min_step_time: 0.05,
            max_step_time: 1.0,
            time_adaptation: false,
            smagorinsky: 0.0,
            standing_fluid: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_refine > MAX_REFINE {
            return Err(Error::TooManyLevels { requested: self.max_refine + 1, max: MAX_REFINE + 1 });
        }
        let positive = [
            ("domain_size", self.domain_size),
            ("viscosity", self.viscosity),
            ("step_time", self.step_time),
            ("min_step_time", self.min_step_time),
            ("max_step_time", self.max_step_time),
            ("max_lattice_speed", self.max_lattice_speed),
        ];
        for (name, value) in positive.iter() {
            if !(value.is_finite() && *value > 0.0) {
                return Err(Error::InvalidParameter(format!("{} must be positive, got {}", name, value)));
            }
        }
        if self.min_step_time > self.max_step_time {
            return Err(Error::InvalidParameter(format!(
                "min_step_time {} exceeds max_step_time {}",
                self.min_step_time, self.max_step_time
            )));
        }
        if self.max_lattice_speed >= 0.5 {
            return Err(Error::InvalidParameter(format!("max_lattice_speed {} is not below 0.5", self.max_lattice_speed)));
        }
        if !(self.smagorinsky >= 0.0) {
            return Err(Error::InvalidParameter(format!("smagorinsky constant {} is negative", self.smagorinsky)));
        }
        if self.interpolation_order != 1 && self.interpolation_order != 2 {
            return Err(Error::InvalidParameter(format!("interpolation order {} is not 1 or 2", self.interpolation_order)));
        }
        if !(self.interface_fill > 0.0 && self.interface_fill <= 1.0) {
            return Err(Error::InvalidParameter(format!("interface_fill {} outside (0, 1]", self.interface_fill)));
        }
        if let BoundaryKind::PartSlip(p) = self.domain_boundary {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::InvalidParameter(format!("domain part slip {} outside [0, 1]", p)));
            }
        }
        if self.gravity.iter().any(|g| !g.is_finite()) {
            return Err(Error::InvalidParameter("gravity is not finite".to_string()));
        }
        Ok(())
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SolverConfig::default().validate().is_ok());
        assert!(SolverConfig::in_lattice_units(LatticeKind::D2Q9, 32, 0.05, [0.0, -1e-4, 0.0]).validate().is_ok());
    }

    #[test]
    fn too_many_levels_are_rejected() {
        let config = SolverConfig { max_refine: 5, ..SolverConfig::default() };
        match config.validate() {
            Err(Error::TooManyLevels { requested: 6, max: 5 }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_parameters_are_rejected() {
        assert!(SolverConfig { viscosity: 0.0, ..SolverConfig::default() }.validate().is_err());
        assert!(SolverConfig { interpolation_order: 3, ..SolverConfig::default() }.validate().is_err());
        assert!(SolverConfig { min_step_time: 1.0, ..SolverConfig::default() }.validate().is_err());
        assert!(SolverConfig { domain_boundary: BoundaryKind::PartSlip(1.5), ..SolverConfig::default() }.validate().is_err());
    }
}
