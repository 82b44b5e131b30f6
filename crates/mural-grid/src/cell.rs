//! Grid cell coordinates and world-to-cell addressing.

use crate::MAX_CELL;

/// A cell position on the shared grid.
///
/// Both axes are clamped to `[0, GRID_EXTENT)`. There is at most one
/// live record per cell; `(x, y)` is the unique key everywhere downstream
/// (cache, store, change bus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cell {
    /// Horizontal cell index.
    pub x: u32,
    /// Vertical cell index.
    pub y: u32,
}

impl Cell {
    /// Create a new cell position, saturating both axes to the grid.
    pub const fn new(x: u32, y: u32) -> Self {
        Self {
            x: if x > MAX_CELL { MAX_CELL } else { x },
            y: if y > MAX_CELL { MAX_CELL } else { y },
        }
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// World-to-cell projection.
///
/// The world is a fixed linear metric space; a cell covers a square of
/// `cell_edge` world units. Projection is deterministic, pure, and total:
/// any finite input maps to exactly one in-range cell, and out-of-range
/// input saturates to the nearest boundary cell rather than erroring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Addressing {
    cell_edge: f64,
}

impl Default for Addressing {
    fn default() -> Self {
        Self { cell_edge: 1.0 }
    }
}

impl Addressing {
    /// Create an addressing with the given cell edge length in world units.
    ///
    /// Non-positive or non-finite edges fall back to 1.0.
    #[must_use]
    pub fn new(cell_edge: f64) -> Self {
        if cell_edge.is_finite() && cell_edge > 0.0 {
            Self { cell_edge }
        } else {
            Self::default()
        }
    }

    /// Edge length of one cell in world units.
    #[must_use]
    pub const fn cell_edge(&self) -> f64 {
        self.cell_edge
    }

    /// Project a world coordinate to its cell.
    ///
    /// Divides by the cell edge, floors, and clamps each axis
    /// independently. NaN saturates to 0 on that axis.
    #[must_use]
    pub fn to_cell(&self, wx: f64, wy: f64) -> Cell {
        Cell {
            x: Self::clamp_axis(wx / self.cell_edge),
            y: Self::clamp_axis(wy / self.cell_edge),
        }
    }

    /// World coordinate of a cell's origin corner (inverse of `to_cell`
    /// up to the floor).
    #[must_use]
    pub fn to_world(&self, cell: Cell) -> (f64, f64) {
        (
            f64::from(cell.x) * self.cell_edge,
            f64::from(cell.y) * self.cell_edge,
        )
    }

    fn clamp_axis(v: f64) -> u32 {
        if v.is_nan() || v < 0.0 {
            return 0;
        }
        let floored = v.floor();
        if floored > f64::from(MAX_CELL) {
            MAX_CELL
        } else {
            floored as u32
        }
    }
}
