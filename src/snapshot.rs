use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use log::info;
use serde::{Deserialize, Serialize};
use crate::config::SolverConfig;
use crate::controller::{self, Parameters, TimeAdaptation};
use crate::error::Error;
use crate::flags::CellFlags;
use crate::geometry::{ObjectTable, Obstacle};
use crate::index_space::IndexSpace;
use crate::lattice::LatticeModel;
use crate::level::Level;
use crate::refinement::Refiner;
use crate::solver::{level_spaces, SimulationState, Solver};
use crate::stats::SimulationStats;




/// Both buffers of one level along with its step bookkeeping.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LevelSnapshot {
    pub id: usize,
    pub set_curr: usize,
    pub lsteps: u64,
    pub time: f64,
    pub lmass: f64,
    pub lvolume: f64,
    pub cells: [Vec<f64>; 2],
    pub flags: [Vec<CellFlags>; 2],
}




/**
 * The complete state of a solver: everything needed to continue a run
 * exactly where it stopped. Level parameters that follow from the
 * configuration and the step time are recomputed on restore.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub config: SolverConfig,
    pub size: [usize; 3],
    pub obstacles: Vec<Obstacle>,
    pub step_time: f64,
    pub state: SimulationState,
    pub stats: SimulationStats,
    pub levels: Vec<LevelSnapshot>,
}




// ============================================================================
impl Snapshot {
    pub fn write_cbor<W: Write>(&self, writer: W) -> Result<(), Error> {
        ciborium::ser::into_writer(self, writer).map_err(|e| Error::Snapshot(format!("{:?}", e)))
    }

    pub fn read_cbor<R: Read>(reader: R) -> Result<Self, Error> {
        ciborium::de::from_reader(reader).map_err(|e| Error::Snapshot(format!("{:?}", e)))
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, Error> {
        rmp_serde::encode::to_vec(self).map_err(|e| Error::Snapshot(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, Error> {
        rmp_serde::decode::from_slice(bytes).map_err(|e| Error::Snapshot(e.to_string()))
    }

    /**
     * Write the snapshot to a file: MessagePack if the extension is
     * `msgpack` or `mpk`, CBOR otherwise.
     */
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);

        if is_msgpack(path) {
            writer.write_all(&self.to_msgpack()?)?;
        } else {
            self.write_cbor(&mut writer)?;
        }
        writer.flush()?;
        info!("write {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);

        if is_msgpack(path) {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            Self::from_msgpack(&bytes)
        } else {
            Self::read_cbor(reader)
        }
    }
}

fn is_msgpack(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("msgpack") | Some("mpk"))
}




// ============================================================================
impl Solver {

    /// Capture the current state; the solver is left untouched.
    pub fn snapshot(&self) -> Snapshot {
        let levels = self
            .levels
            .iter()
            .map(|level| LevelSnapshot {
                id: level.id,
                set_curr: level.set_curr(),
                lsteps: level.lsteps,
                time: level.time,
                lmass: level.lmass,
                lvolume: level.lvolume,
                cells: [level.cells_slice(0).to_vec(), level.cells_slice(1).to_vec()],
                flags: [level.flags_slice(0).to_vec(), level.flags_slice(1).to_vec()],
            })
            .collect();

        Snapshot {
            config: self.config.clone(),
            size: self.levels[self.levels.len() - 1].space().size(),
            obstacles: self.obstacles.clone(),
            step_time: self.params.step_time,
            state: self.state.clone(),
            stats: self.stats.clone(),
            levels,
        }
    }

    /**
     * Rebuild a solver from a snapshot. The level layout is derived again
     * from the configuration and must match the stored buffers.
     */
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, Error> {
        let Snapshot { config, size, obstacles, step_time, state, stats, levels: stored } = snapshot;
        config.validate()?;

        let lattice = LatticeModel::new(config.lattice);
        let finest = IndexSpace::new(size, lattice.dimension())?;
        let max_level = config.max_refine;
        let spaces = level_spaces(max_level, finest)?;

        if stored.len() != spaces.len() {
            return Err(Error::Snapshot(format!("{} levels stored, {} expected", stored.len(), spaces.len())));
        }
        let params = Parameters::from_config(&config, size[0], step_time)?;
        let objects = ObjectTable::new(&obstacles, config.domain_boundary, |v| params.lattice_velocity(v));
        let mut levels = Vec::with_capacity(spaces.len());

        for (space, stored) in spaces.into_iter().zip(stored) {
            let mut level = Level::allocate(stored.id, max_level, space, &lattice)?;
            let [cells0, cells1] = stored.cells;
            let [flags0, flags1] = stored.flags;
            level.restore(0, cells0, flags0)?;
            level.restore(1, cells1, flags1)?;
            level.set_current_buffer(stored.set_curr);
            level.lsteps = stored.lsteps;
            level.time = stored.time;
            level.lmass = stored.lmass;
            level.lvolume = stored.lvolume;
            levels.push(level);
        }
        controller::init_level_omegas(&mut levels, &params, config.smagorinsky);

        Ok(Self {
            refiner: Refiner::new(&lattice),
            config,
            lattice,
            obstacles,
            objects,
            params,
            levels,
            adaptation: TimeAdaptation::new(),
            state,
            stats,
        })
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::{GeometryInput, VoxelTag};
    use crate::lattice::LatticeKind;
    use crate::level::Buffer;

    fn solver() -> Solver {
        let config = SolverConfig::in_lattice_units(LatticeKind::D2Q9, 16, 0.05, [0.0, -1e-4, 0.0]);
        let mut geometry = GeometryInput::new([16, 16, 1], 2).unwrap();
        geometry.fill_box([1, 1, 0], [7, 9, 1], VoxelTag::Fluid);
        Solver::new(config, &geometry).unwrap()
    }

    #[test]
    fn cbor_snapshot_resumes_the_run() {
        let mut a = solver();
        for _ in 0..5 {
            a.step().unwrap();
        }
        let mut bytes = Vec::new();
        a.snapshot().write_cbor(&mut bytes).unwrap();
        let mut b = Solver::from_snapshot(Snapshot::read_cbor(bytes.as_slice()).unwrap()).unwrap();

        for _ in 0..5 {
            a.step().unwrap();
            b.step().unwrap();
        }
        assert_eq!(a.state().step_count, b.state().step_count);
        for p in a.levels()[0].space().iter() {
            assert_eq!(a.flag(0, p, Buffer::Current).unwrap(), b.flag(0, p, Buffer::Current).unwrap());
            assert_eq!(a.mass(0, p, Buffer::Current).unwrap(), b.mass(0, p, Buffer::Current).unwrap());
        }
    }

    #[test]
    fn msgpack_snapshot_keeps_both_buffers() {
        let mut a = solver();
        a.step().unwrap();
        let bytes = a.snapshot().to_msgpack().unwrap();
        let b = Solver::from_snapshot(Snapshot::from_msgpack(&bytes).unwrap()).unwrap();

        for buffer in [Buffer::Current, Buffer::Other].iter() {
            for l in 0..9 {
                assert_eq!(a.df(0, [3, 3, 0], l, *buffer).unwrap(), b.df(0, [3, 3, 0], l, *buffer).unwrap());
            }
        }
        assert_eq!(a.state().initial_mass, b.state().initial_mass);
    }

    #[test]
    fn mismatched_levels_are_rejected() {
        let mut snapshot = solver().snapshot();
        snapshot.levels.clear();
        assert!(matches!(Solver::from_snapshot(snapshot), Err(Error::Snapshot(_))));
    }
}
