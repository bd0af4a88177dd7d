// ============================================================================
// TILE LAYOUT: regular grids with overlap, overlap detection
// ============================================================================

use crate::error::{MaskError, MaskResult};
use crate::geometry::{Point, Polygon};
use crate::grid::WindowRect;

/// A regular grid of equally sized tiles over a pixel-space region.
#[derive(Clone, Debug, PartialEq)]
pub struct GridLayout {
    /// Region to tile, in parent-raster pixels.
    pub bounds: WindowRect,
    pub tile_height: u32,
    pub tile_width: u32,
    /// Share of a tile repeated by its neighbour, 0..100.
    pub overlap_percent: f64,
    /// A (row, col) where some tile has its corner; defaults to the bounds origin.
    pub start: Option<(u32, u32)>,
}

impl GridLayout {
    pub fn new(bounds: WindowRect, tile_height: u32, tile_width: u32, overlap_percent: f64) -> Self {
        Self { bounds, tile_height, tile_width, overlap_percent, start: None }
    }

    fn spacing(&self, size: u32) -> MaskResult<u32> {
        if !(0.0..100.0).contains(&self.overlap_percent) {
            return Err(layout_error(format!(
                "overlap must be in [0, 100), got {}",
                self.overlap_percent
            )));
        }
        let spacing = ((1.0 - self.overlap_percent / 100.0) * size as f64) as u32;
        if spacing == 0 {
            return Err(layout_error(format!(
                "{}% overlap leaves no spacing between {}-pixel tiles",
                self.overlap_percent, size
            )));
        }
        Ok(spacing)
    }

    /// Upper-left corners (row, col), row-major. The first and last tile on
    /// each axis sit flush with the bounds.
    pub fn positions(&self) -> MaskResult<Vec<(u32, u32)>> {
        if self.tile_height == 0 || self.tile_width == 0 {
            return Err(layout_error("tile size must be positive".to_string()));
        }
        let (start_row, start_col) = self.start.unwrap_or((self.bounds.row, self.bounds.col));
        let rows = axis_starts(
            self.bounds.row,
            self.bounds.row_end(),
            self.tile_height,
            self.spacing(self.tile_height)?,
            start_row,
            "row",
        )?;
        let cols = axis_starts(
            self.bounds.col,
            self.bounds.col_end(),
            self.tile_width,
            self.spacing(self.tile_width)?,
            start_col,
            "column",
        )?;
        Ok(rows.iter().flat_map(|&r| cols.iter().map(move |&c| (r, c))).collect())
    }

    pub fn rects(&self) -> MaskResult<Vec<WindowRect>> {
        Ok(self
            .positions()?
            .into_iter()
            .map(|(row, col)| WindowRect::new(row, col, self.tile_height, self.tile_width))
            .collect())
    }
}

fn layout_error(message: String) -> MaskError {
    MaskError::format("tile layout", None, message)
}

fn axis_starts(lo: u32, hi: u64, size: u32, spacing: u32, start: u32, axis: &str) -> MaskResult<Vec<u32>> {
    if (hi - lo as u64) < size as u64 {
        return Err(layout_error(format!(
            "{} extent {} is smaller than the tile size {}",
            axis,
            hi - lo as u64,
            size
        )));
    }
    let last = (hi - size as u64) as u32;
    if start < lo || start > last {
        return Err(layout_error(format!(
            "start {} {} is outside [{}, {}]",
            axis, start, lo, last
        )));
    }
    let mut out = vec![lo, last];
    let mut p = start;
    while p < last {
        out.push(p);
        p = match p.checked_add(spacing) {
            Some(n) => n,
            None => break,
        };
    }
    let mut p = start;
    while p > lo {
        out.push(p);
        p = p.saturating_sub(spacing);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// For every tile, the indices of the other tiles it shares area with.
pub fn overlaps(rects: &[WindowRect]) -> Vec<Vec<usize>> {
    rects
        .iter()
        .enumerate()
        .map(|(i, a)| {
            rects
                .iter()
                .enumerate()
                .filter(|&(j, b)| j != i && a.intersects(b))
                .map(|(j, _)| j)
                .collect()
        })
        .collect()
}

/// Keep tiles whose centre lies inside `area` (pixel coordinates, x = col).
pub fn retain_inside(rects: Vec<WindowRect>, area: &Polygon) -> Vec<WindowRect> {
    rects
        .into_iter()
        .filter(|r| {
            let centre = Point::new(
                r.col as f64 + r.width as f64 / 2.0,
                r.row as f64 + r.height as f64 / 2.0,
            );
            area.contains(centre)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_covers_bounds_edges() {
        let layout = GridLayout::new(WindowRect::new(0, 0, 250, 100), 100, 100, 10.0);
        let pos = layout.positions().unwrap();
        let rows: Vec<u32> = pos.iter().map(|p| p.0).collect::<std::collections::BTreeSet<_>>().into_iter().collect();
        // spacing 90: 0, 90, plus the flush-bottom 150
        assert_eq!(rows, vec![0, 90, 150]);
        assert!(pos.iter().all(|&(_, c)| c == 0));
        assert_eq!(pos.len(), 3);
    }

    #[test]
    fn explicit_start_extends_both_ways() {
        let mut layout = GridLayout::new(WindowRect::new(10, 0, 100, 20), 20, 20, 50.0);
        layout.start = Some((45, 0));
        let rows: Vec<u32> = layout.positions().unwrap().into_iter().map(|p| p.0).collect();
        assert_eq!(rows, vec![10, 15, 25, 35, 45, 55, 65, 75, 85, 90]);
    }

    #[test]
    fn invalid_layouts_fail() {
        let too_small = GridLayout::new(WindowRect::new(0, 0, 10, 10), 20, 20, 0.0);
        assert!(matches!(too_small.positions(), Err(MaskError::Format { .. })));
        let all_overlap = GridLayout::new(WindowRect::new(0, 0, 10, 10), 1, 1, 99.0);
        assert!(all_overlap.positions().is_err());
        let mut bad_start = GridLayout::new(WindowRect::new(0, 0, 10, 10), 5, 5, 0.0);
        bad_start.start = Some((6, 0));
        assert!(bad_start.positions().is_err());
    }

    #[test]
    fn overlap_lists_are_symmetric_and_skip_touching_tiles() {
        let rects = vec![
            WindowRect::new(0, 0, 10, 10),
            WindowRect::new(0, 9, 10, 10),
            WindowRect::new(0, 19, 10, 10),
            WindowRect::new(20, 0, 10, 10),
        ];
        let o = overlaps(&rects);
        assert_eq!(o[0], vec![1]);
        assert_eq!(o[1], vec![0]);
        assert!(o[2].is_empty());
        assert!(o[3].is_empty());
    }

    #[test]
    fn retain_inside_uses_tile_centres() {
        let rects = GridLayout::new(WindowRect::new(0, 0, 20, 20), 10, 10, 0.0).rects().unwrap();
        let triangle = Polygon::new(
            vec![Point::new(0.0, 0.0), Point::new(20.0, 0.0), Point::new(0.0, 20.0)],
            vec![],
        );
        let kept = retain_inside(rects, &triangle);
        assert_eq!(kept.len(), 3);
        assert!(!kept.contains(&WindowRect::new(10, 10, 10, 10)));
    }
}
