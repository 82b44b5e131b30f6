//! Mural Grid
//!
//! Integer addressing for the shared painting grid, plus stroke
//! rasterization between pointer samples.
//!
//! # Addressing
//!
//! The grid is a bounded square of integer cells. External coordinates
//! (screen or world space) are projected into cells by [`Addressing`]:
//! divide by the cell edge length, floor, and saturate each axis to the
//! valid range. Out-of-range input never errors - it lands on the
//! boundary cell.
//!
//! # Rasterization
//!
//! Fast pointer motion delivers sparse samples. [`line_cells`] fills the
//! gap between two samples with the Bresenham line of intermediate cells,
//! so a stroke is continuous regardless of sampling cadence.

mod cell;
mod line;

pub use cell::{Addressing, Cell};
pub use line::line_cells;

/// Number of cells along each axis. Valid coordinates are `0..GRID_EXTENT`.
pub const GRID_EXTENT: u32 = 2_000_000;

/// Largest valid coordinate on either axis.
pub const MAX_CELL: u32 = GRID_EXTENT - 1;

// GRID_EXTENT must leave headroom for i64 deltas in the rasterizer.
const _: () = assert!((GRID_EXTENT as i64) < i64::MAX / 2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_constants_agree() {
        assert_eq!(MAX_CELL, GRID_EXTENT - 1);
    }
}
