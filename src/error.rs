use std::error;
use std::fmt;
use std::io;




#[derive(Debug)]

/**
 * Error to represent invalid solver configuration, failed allocation, a
 * broken internal invariant detected during a step, or a failure to persist
 * solver state.
 */
pub enum Error {
    TooManyLevels { requested: usize, max: usize },
    GridSize { axis: usize, size: usize, reason: &'static str },
    InvalidParameter(String),
    Geometry(String),
    Allocation { level: usize, cells: usize },
    Panic { level: usize, cell: [usize; 3], reason: String },
    Snapshot(String),
    Io(io::Error),
}




// ============================================================================
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        use Error::*;

        match self {
            TooManyLevels { requested, max } => write!(fmt, "{} refinement levels requested, at most {} supported", requested, max),
            GridSize { axis, size, reason } => write!(fmt, "grid extent {} on axis {}: {}", size, axis, reason),
            InvalidParameter(p) => write!(fmt, "invalid parameter: {}", p),
            Geometry(g) => write!(fmt, "invalid geometry: {}", g),
            Allocation { level, cells } => write!(fmt, "could not allocate {} cells for level {}", cells, level),
            Panic { level, cell, reason } => write!(fmt, "solver panic on level {} at {:?}: {}", level, cell, reason),
            Snapshot(s) => write!(fmt, "snapshot: {}", s),
            Io(e) => write!(fmt, "io: {}", e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
