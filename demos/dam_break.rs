use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use clap::Parser;
use log::{info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use fsgr::config::SolverConfig;
use fsgr::geometry::{GeometryInput, VoxelTag};
use fsgr::lattice::LatticeKind;
use fsgr::snapshot::Snapshot;
use fsgr::Solver;




#[derive(Debug, Parser)]
#[clap(version = "0.1", author = "J. Zrake <jzrake@clemson.edu>")]

/**
 * A column of water collapsing in a closed box
 */
struct Opts {
    /// Cells along the x axis of the finest grid
    #[clap(short = 'n', long, default_value = "64")]
    resolution: usize,

    /// Extra refinement levels below the finest grid
    #[clap(short = 'r', long, default_value = "0")]
    refine: usize,

    /// Number of finest-level steps to take
    #[clap(short = 's', long, default_value = "1000")]
    steps: u64,

    /// Width of the box in meters
    #[clap(long, default_value = "0.1")]
    domain_size: f64,

    /// Kinematic viscosity in m^2/s
    #[clap(long, default_value = "1e-6")]
    viscosity: f64,

    /// Run in three dimensions with the D3Q19 lattice
    #[clap(long)]
    three_d: bool,

    /// Stop at the first invariant violation
    #[clap(long)]
    strict: bool,

    /// Log statistics every this many steps
    #[clap(long, default_value = "100", value_parser = clap::value_parser!(u64).range(1..))]
    log_every: u64,

    /// Continue from a snapshot instead of starting a new run
    #[clap(long)]
    restart: Option<String>,

    /// Where to write the final snapshot (.cbor or .msgpack)
    #[clap(short = 'o', long, default_value = "state.cbor")]
    output: String,
}




// ============================================================================
impl Opts {
    fn config(&self) -> SolverConfig {
        SolverConfig {
            lattice: if self.three_d { LatticeKind::D3Q19 } else { LatticeKind::D2Q9 },
            max_refine: self.refine,
            domain_size: self.domain_size,
            viscosity: self.viscosity,
            strict_checks: self.strict,
            ..SolverConfig::default()
        }
    }

    /// The box is as high as it is wide; the water fills the lower half of
    /// its left quarter.
    fn geometry(&self) -> Result<GeometryInput, fsgr::Error> {
        let n = self.resolution;
        let (size, dim) = if self.three_d { ([n, n, n / 2], 3) } else { ([n, n, 1], 2) };
        let z0 = if self.three_d { 1 } else { 0 };
        let mut geometry = GeometryInput::new(size, dim)?;
        geometry.fill_box([1, 1, z0], [n / 4, n / 2, size[2]], VoxelTag::Fluid);
        Ok(geometry)
    }
}




// ============================================================================
fn run(opts: Opts) -> Result<(), fsgr::Error> {
    let mut solver = match &opts.restart {
        Some(path) => Solver::from_snapshot(Snapshot::load(path)?)?,
        None => Solver::new(opts.config(), &opts.geometry()?)?,
    };

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;

    for _ in 0..opts.steps {
        if stop.load(Ordering::Relaxed) {
            warn!("interrupted at step {}", solver.state().step_count);
            break;
        }
        solver.step()?;

        if solver.stats().steps % opts.log_every == 0 {
            let com = solver.center_of_mass();
            info!("{} t={:.4}s com=({:.2}, {:.2})", solver.stats(), solver.state().time, com[0], com[1]);
        }
    }
    solver.snapshot().save(&opts.output)
}

fn main() {
    SimpleLogger::new().with_level(LevelFilter::Info).init().unwrap();

    let opts = Opts::parse();
    info!("{:?}", opts);

    if let Err(e) = run(opts) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log_interval_must_be_positive() {
        assert!(Opts::try_parse_from(&["dam_break", "--log-every", "0"]).is_err());
        let opts = Opts::try_parse_from(&["dam_break", "--log-every", "25"]).unwrap();
        assert_eq!(opts.log_every, 25);
        assert_eq!(Opts::try_parse_from(&["dam_break"]).unwrap().log_every, 100);
    }
}
