//! Bresenham stroke rasterization.
//!
//! Pointer samples arrive sparsely during fast motion. Painting only the
//! sampled cells leaves gaps, so each pair of consecutive samples is
//! expanded into the full line of intermediate cells.
//!
//! The sequence always contains both endpoints, has exactly
//! `max(|dx|, |dy|) + 1` cells, and is direction-symmetric: rasterizing
//! `to -> from` yields the reverse of `from -> to`.

use crate::Cell;

/// Rasterize the ordered line of cells between two samples, inclusive.
///
/// Integer Bresenham over the canonical endpoint ordering. Canonicalizing
/// first (smaller endpoint drives the error term) is what makes the
/// output symmetric under endpoint swap; raw Bresenham rounds error ties
/// differently in each direction.
#[must_use]
pub fn line_cells(from: Cell, to: Cell) -> Vec<Cell> {
    if (from.x, from.y) > (to.x, to.y) {
        let mut cells = raster(to, from);
        cells.reverse();
        return cells;
    }
    raster(from, to)
}

/// Raw Bresenham walk from `from` to `to`.
fn raster(from: Cell, to: Cell) -> Vec<Cell> {
    let dx = i64::from(to.x).abs_diff(i64::from(from.x)) as i64;
    let dy = -(i64::from(to.y).abs_diff(i64::from(from.y)) as i64);
    let sx: i64 = if from.x <= to.x { 1 } else { -1 };
    let sy: i64 = if from.y <= to.y { 1 } else { -1 };

    let mut x = i64::from(from.x);
    let mut y = i64::from(from.y);
    let mut err = dx + dy;

    let mut cells = Vec::with_capacity((dx.max(-dy) + 1) as usize);
    loop {
        cells.push(Cell::new(x as u32, y as u32));
        if x == i64::from(to.x) && y == i64::from(to.y) {
            return cells;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}
