use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};




#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]

/**
 * Per-cell classification bits. The low byte holds the base type and
 * boundary subtype, the next bits the transient neighbor summaries, the
 * refinement roles and in/outflow markers. Bits 24 and up carry the id of
 * the obstacle a cell belongs to.
 */
pub struct CellFlags(u32);




/**
 * The mutually exclusive base types a cell can have.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellType {
    Unused,
    Empty,
    Boundary,
    Fluid,
    Interface,
}




// ============================================================================
impl CellFlags {
    pub const NONE: Self = Self(0);
    pub const UNUSED: Self = Self(1 << 0);
    pub const EMPTY: Self = Self(1 << 1);
    pub const BND: Self = Self(1 << 2);
    pub const BND_NOSLIP: Self = Self(1 << 3);
    pub const BND_FREESLIP: Self = Self(1 << 4);
    pub const BND_PARTSLIP: Self = Self(1 << 5);
    pub const NO_INTERPOL_SRC: Self = Self(1 << 6);
    pub const FLUID: Self = Self(1 << 7);
    pub const INTER: Self = Self(1 << 8);
    pub const NO_NB_FLUID: Self = Self(1 << 9);
    pub const NO_NB_EMPTY: Self = Self(1 << 10);
    pub const NO_DELETE: Self = Self(1 << 11);
    pub const NO_BND_FLUID: Self = Self(1 << 12);
    pub const GR_NORM: Self = Self(1 << 13);
    pub const GR_FROM_FINE: Self = Self(1 << 14);
    pub const GR_FROM_COARSE: Self = Self(1 << 15);
    pub const GR_TO_FINE: Self = Self(1 << 16);
    pub const INFLOW: Self = Self(1 << 17);
    pub const OUTFLOW: Self = Self(1 << 18);

    pub const BASE_TYPES: Self = Self(Self::UNUSED.0 | Self::EMPTY.0 | Self::BND.0 | Self::FLUID.0 | Self::INTER.0);
    pub const ROLES: Self = Self(Self::GR_NORM.0 | Self::GR_FROM_FINE.0 | Self::GR_FROM_COARSE.0);

    /// Bits that survive a change of base type: the boundary subtype,
    /// in/outflow markers and the object id.
    pub const PERSISTENT: Self = Self(
        Self::BND_NOSLIP.0 | Self::BND_FREESLIP.0 | Self::BND_PARTSLIP.0 | Self::INFLOW.0 | Self::OUTFLOW.0 | OBJECT_MASK,
    );

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0
    }

    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.insert(other)
        } else {
            self.remove(other)
        }
    }

    pub fn object_id(self) -> usize {
        (self.0 >> OBJECT_SHIFT) as usize
    }

    pub fn with_object(self, id: usize) -> Self {
        Self((self.0 & !OBJECT_MASK) | ((id as u32) << OBJECT_SHIFT))
    }

    /// Replace the base type and every transient bit, keeping the
    /// persistent ones.
    pub fn rebased(self, flags: Self) -> Self {
        (self & Self::PERSISTENT) | flags
    }

    pub fn cell_type(self) -> Option<CellType> {
        if !self.is_consistent() {
            return None;
        }
        Some(if self.intersects(Self::UNUSED) {
            CellType::Unused
        } else if self.intersects(Self::EMPTY) {
            CellType::Empty
        } else if self.intersects(Self::BND) {
            CellType::Boundary
        } else if self.intersects(Self::FLUID) {
            CellType::Fluid
        } else {
            CellType::Interface
        })
    }

    /// Exactly one base type and at most one refinement role.
    pub fn is_consistent(self) -> bool {
        (self & Self::BASE_TYPES).0.count_ones() == 1 && (self & Self::ROLES).0.count_ones() <= 1
    }
}

const OBJECT_SHIFT: u32 = 24;
const OBJECT_MASK: u32 = 0xff << OBJECT_SHIFT;




// ============================================================================
impl BitOr for CellFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for CellFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for CellFlags {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl BitOrAssign for CellFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl BitAndAssign for CellFlags {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0
    }
}

impl fmt::Debug for CellFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 19] = [
            "UNUSED", "EMPTY", "BND", "NOSLIP", "FREESLIP", "PARTSLIP", "NO_INTERPOL_SRC", "FLUID", "INTER",
            "NO_NB_FLUID", "NO_NB_EMPTY", "NO_DELETE", "NO_BND_FLUID", "GR_NORM", "FROM_FINE", "FROM_COARSE",
            "TO_FINE", "INFLOW", "OUTFLOW",
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "CellFlags({}", names.join("|"))?;
        if self.object_id() != 0 {
            write!(f, " obj={}", self.object_id())?;
        }
        write!(f, ")")
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::CellFlags as F;
    use super::CellType;

    #[test]
    fn base_type_is_exclusive() {
        assert!(F::FLUID.is_consistent());
        assert!((F::FLUID | F::GR_NORM | F::GR_TO_FINE).is_consistent());
        assert!(!(F::FLUID | F::INTER).is_consistent());
        assert!(!(F::FLUID | F::GR_FROM_FINE | F::GR_FROM_COARSE).is_consistent());
        assert!(!F::NONE.is_consistent());
        assert_eq!((F::FLUID | F::INTER).cell_type(), None);
    }

    #[test]
    fn object_id_round_trips_and_survives_rebase() {
        let f = (F::BND | F::BND_PARTSLIP).with_object(7);
        assert_eq!(f.object_id(), 7);
        assert_eq!(f.cell_type(), Some(CellType::Boundary));

        let g = (F::EMPTY | F::OUTFLOW).with_object(3).rebased(F::INTER | F::NO_DELETE);
        assert_eq!(g.object_id(), 3);
        assert!(g.contains(F::INTER | F::NO_DELETE | F::OUTFLOW));
        assert!(!g.intersects(F::EMPTY));
    }

    #[test]
    fn set_and_remove_bits() {
        let mut f = F::INTER;
        f.set(F::NO_NB_FLUID, true);
        assert!(f.contains(F::INTER | F::NO_NB_FLUID));
        f.set(F::NO_NB_FLUID, false);
        assert_eq!(f, F::INTER);
        f.remove(F::INTER);
        assert_eq!(f, F::NONE);
    }
}
