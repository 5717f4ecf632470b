use serde::{Deserialize, Serialize};
use crate::error::Error;
use crate::flags::CellFlags;
use crate::index_space::IndexSpace;

/// Largest number of obstacle objects; the object id must fit the flag
/// bits, with one id reserved for the domain boundary.
pub const MAX_OBJECTS: usize = 255;

/// How a boundary treats populations streaming into it.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum BoundaryKind {
    NoSlip,
    FreeSlip,
    /// Blend of bounce-back (weight given) and free slip (the remainder).
    PartSlip(f64),
}

impl BoundaryKind {
    pub fn flags(self) -> CellFlags {
        match self {
            BoundaryKind::NoSlip => CellFlags::BND | CellFlags::BND_NOSLIP,
            BoundaryKind::FreeSlip => CellFlags::BND | CellFlags::BND_FREESLIP,
            BoundaryKind::PartSlip(_) => CellFlags::BND | CellFlags::BND_PARTSLIP,
        }
    }

    pub fn part_slip(self) -> f64 {
        match self {
            BoundaryKind::NoSlip => 1.0,
            BoundaryKind::FreeSlip => 0.0,
            BoundaryKind::PartSlip(p) => p,
        }
    }
}

/// An object referenced by voxel tags: an obstacle, or the source or sink
/// of an inflow / outflow region.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub name: String,
    pub boundary: BoundaryKind,
    /// Velocity in m/s; used by inflow regions.
    pub velocity: [f64; 3],
}

impl Obstacle {
    pub fn wall(name: &str, boundary: BoundaryKind) -> Self {
        Self { name: name.to_string(), boundary, velocity: [0.0; 3] }
    }

    pub fn inflow(name: &str, velocity: [f64; 3]) -> Self {
        Self { name: name.to_string(), boundary: BoundaryKind::NoSlip, velocity }
    }
}

/// The classification of one finest-grid voxel.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoxelTag {
    Empty,
    Fluid,
    Obstacle(usize),
    Inflow(usize),
    Outflow(usize),
}

/// The voxelized scene handed to the solver: one tag per cell of the
/// finest grid plus the table of objects the tags refer to. The outermost
/// layer of voxels is replaced by the domain boundary.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeometryInput {
    space: IndexSpace,
    tags: Vec<VoxelTag>,
    objects: Vec<Obstacle>,
}

// ============================================================================
impl GeometryInput {
    pub fn new(size: [usize; 3], dim: usize) -> Result<Self, Error> {
        let space = IndexSpace::new(size, dim)?;
        Ok(Self { space, tags: vec![VoxelTag::Empty; space.len()], objects: Vec::new() })
    }

    pub fn space(&self) -> IndexSpace {
        self.space
    }

    pub fn objects(&self) -> &[Obstacle] {
        &self.objects
    }

    pub fn add_object(&mut self, object: Obstacle) -> usize {
        self.objects.push(object);
        self.objects.len() - 1
    }

    pub fn get(&self, p: [usize; 3]) -> VoxelTag {
        self.tags[self.space.index(p[0], p[1], p[2])]
    }

    pub fn set(&mut self, p: [usize; 3], tag: VoxelTag) {
        let n = self.space.index(p[0], p[1], p[2]);
        self.tags[n] = tag
    }

    /// Tag every voxel in the half-open box `lo..hi`, clipped to the grid.
    pub fn fill_box(&mut self, lo: [usize; 3], hi: [usize; 3], tag: VoxelTag) {
        let size = self.space.size();
        for k in lo[2]..hi[2].min(size[2]) {
            for j in lo[1]..hi[1].min(size[1]) {
                for i in lo[0]..hi[0].min(size[0]) {
                    self.set([i, j, k], tag)
                }
            }
        }
    }

    /// Tag every voxel whose center lies within `radius` of `center`.
    pub fn fill_sphere(&mut self, center: [f64; 3], radius: f64, tag: VoxelTag) {
        let space = self.space;
        for p in space.iter() {
            let d: f64 = (0..space.dim())
                .map(|a| {
                    let x = p[a] as f64 + 0.5 - center[a];
                    x * x
                })
                .sum();
            if d <= radius * radius {
                self.set(p, tag)
            }
        }
    }

    pub fn count(&self, tag: VoxelTag) -> usize {
        self.tags.iter().filter(|t| **t == tag).count()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.objects.len() >= MAX_OBJECTS {
            return Err(Error::Geometry(format!("{} objects, at most {} supported", self.objects.len(), MAX_OBJECTS - 1)));
        }
        for tag in &self.tags {
            match *tag {
                VoxelTag::Obstacle(id) | VoxelTag::Inflow(id) | VoxelTag::Outflow(id) if id >= self.objects.len() => {
                    return Err(Error::Geometry(format!("voxel refers to unknown object {}", id)));
                }
                _ => {}
            }
        }
        for object in &self.objects {
            if let BoundaryKind::PartSlip(p) = object.boundary {
                if !(0.0..=1.0).contains(&p) {
                    return Err(Error::Geometry(format!("part slip value {} of {} outside [0, 1]", p, object.name)));
                }
            }
        }
        Ok(())
    }

    /// The flag a voxel starts with, before interface cells are added.
    pub fn initial_flag(&self, tag: VoxelTag) -> CellFlags {
        match tag {
            VoxelTag::Empty => CellFlags::EMPTY,
            VoxelTag::Fluid => CellFlags::FLUID,
            VoxelTag::Obstacle(id) => self.objects[id].boundary.flags().with_object(id),
            VoxelTag::Inflow(id) => (CellFlags::FLUID | CellFlags::INFLOW).with_object(id),
            VoxelTag::Outflow(id) => (CellFlags::EMPTY | CellFlags::OUTFLOW).with_object(id),
        }
    }
}




/**
 * Per-object data needed by the sweeps, in lattice units: one entry per
 * geometry object followed by one for the domain boundary.
 */
#[derive(Clone, Debug, Default)]
pub struct ObjectTable {
    speeds: Vec<[f64; 3]>,
    part_slip: Vec<f64>,
}

impl ObjectTable {
    pub fn new(objects: &[Obstacle], domain: BoundaryKind, to_lattice: impl Fn([f64; 3]) -> [f64; 3]) -> Self {
        let mut speeds: Vec<[f64; 3]> = objects.iter().map(|o| to_lattice(o.velocity)).collect();
        let mut part_slip: Vec<f64> = objects.iter().map(|o| o.boundary.part_slip()).collect();
        speeds.push([0.0; 3]);
        part_slip.push(domain.part_slip());
        Self { speeds, part_slip }
    }

    pub fn domain_id(&self) -> usize {
        self.speeds.len() - 1
    }

    pub fn speed(&self, id: usize) -> [f64; 3] {
        self.speeds.get(id).copied().unwrap_or([0.0; 3])
    }

    pub fn part_slip(&self, id: usize) -> f64 {
        self.part_slip.get(id).copied().unwrap_or(1.0)
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_object_is_rejected() {
        let mut geometry = GeometryInput::new([8, 8, 1], 2).unwrap();
        geometry.set([2, 2, 0], VoxelTag::Obstacle(0));
        assert!(geometry.validate().is_err());
        geometry.add_object(Obstacle::wall("block", BoundaryKind::FreeSlip));
        assert!(geometry.validate().is_ok());
    }

    #[test]
    fn boxes_are_clipped() {
        let mut geometry = GeometryInput::new([8, 8, 1], 2).unwrap();
        geometry.fill_box([4, 0, 0], [20, 2, 1], VoxelTag::Fluid);
        assert_eq!(geometry.count(VoxelTag::Fluid), 8);
    }

    #[test]
    fn object_flags_carry_their_id() {
        let mut geometry = GeometryInput::new([8, 8, 1], 2).unwrap();
        geometry.add_object(Obstacle::wall("a", BoundaryKind::NoSlip));
        let id = geometry.add_object(Obstacle::wall("b", BoundaryKind::PartSlip(0.3)));
        let flag = geometry.initial_flag(VoxelTag::Obstacle(id));
        assert!(flag.contains(CellFlags::BND | CellFlags::BND_PARTSLIP));
        assert_eq!(flag.object_id(), 1);

        let table = ObjectTable::new(geometry.objects(), BoundaryKind::FreeSlip, |v| v);
        assert_eq!(table.part_slip(1), 0.3);
        assert_eq!(table.domain_id(), 2);
        assert_eq!(table.part_slip(table.domain_id()), 0.0);
    }
}
