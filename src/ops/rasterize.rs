// ============================================================================
// POLYGON RASTERIZATION
// ============================================================================
//
// A cell belongs to a footprint when its centre does. Polygons use an
// even-odd scanline fill at row centres; strokes use the distance from the
// cell centre to the path. Later polygons overwrite earlier ones.

use image::{GrayImage, Luma};

use crate::error::{MaskError, MaskResult};
use crate::geometry::{Point, Polygon, ValuedPolygon, segment_distance_sq};
use crate::grid::{Band, GridWindow};

/// Slack for cells whose centre sits exactly on a stroke's edge.
const STROKE_EPS: f64 = 1e-9;

/// Anything that can report which cells of a window it covers.
pub trait Footprint {
    /// Calls `emit(row, col_start, col_end)` for each half-open run of
    /// covered cells in a `height` x `width` grid. Runs may repeat.
    fn spans(&self, height: u32, width: u32, emit: &mut dyn FnMut(u32, u32, u32));
}

/// Cells covered by `footprint`, 255 where covered.
pub fn coverage(footprint: &dyn Footprint, height: u32, width: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    footprint.spans(height, width, &mut |row, c0, c1| {
        for col in c0..c1 {
            mask.put_pixel(col, row, Luma([255u8]));
        }
    });
    mask
}

// ============================================================================
// POLYGON FOOTPRINT
// ============================================================================

/// A polygon (all rings) in window-local pixel coordinates.
#[derive(Clone, Debug)]
pub struct PixelPolygon {
    rings: Vec<Vec<(f64, f64)>>,
}

impl PixelPolygon {
    pub fn from_geo(window: &GridWindow, polygon: &Polygon) -> MaskResult<Self> {
        let rings = polygon
            .rings()
            .map(|ring| {
                ring.iter()
                    .map(|p| window.geo_to_local(p.x, p.y))
                    .collect::<MaskResult<Vec<_>>>()
            })
            .collect::<MaskResult<Vec<_>>>()?;
        Ok(Self { rings })
    }

    fn row_range(&self, height: u32) -> (u32, u32) {
        let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
        for &(_, y) in self.rings.iter().flatten() {
            lo = lo.min(y);
            hi = hi.max(y);
        }
        if !lo.is_finite() || !hi.is_finite() {
            return (0, 0);
        }
        let first = (lo - 0.5).ceil().clamp(0.0, height as f64) as u32;
        let last = (hi - 0.5).ceil().clamp(0.0, height as f64) as u32;
        (first, last.max(first))
    }
}

impl Footprint for PixelPolygon {
    fn spans(&self, height: u32, width: u32, emit: &mut dyn FnMut(u32, u32, u32)) {
        let (first, last) = self.row_range(height);
        let mut nodes: Vec<f64> = Vec::new();
        for row in first..last {
            let yc = row as f64 + 0.5;
            nodes.clear();
            for ring in &self.rings {
                let n = ring.len();
                for i in 0..n {
                    let (ax, ay) = ring[i];
                    let (bx, by) = ring[(i + 1) % n];
                    // half-open: an edge owns its lower endpoint only
                    if (ay <= yc) != (by <= yc) {
                        nodes.push(ax + (yc - ay) / (by - ay) * (bx - ax));
                    }
                }
            }
            nodes.sort_by(f64::total_cmp);
            for pair in nodes.chunks_exact(2) {
                let c0 = (pair[0] - 0.5).ceil().clamp(0.0, width as f64) as u32;
                let c1 = (pair[1] - 0.5).ceil().clamp(0.0, width as f64) as u32;
                if c1 > c0 {
                    emit(row, c0, c1);
                }
            }
        }
    }
}

// ============================================================================
// STROKE FOOTPRINT
// ============================================================================

/// A polyline of pixel width `width`, in window-local pixel coordinates.
#[derive(Clone, Debug)]
pub struct Stroke {
    points: Vec<(f64, f64)>,
    radius: f64,
}

impl Stroke {
    pub fn from_geo(window: &GridWindow, path: &[Point], width: u32) -> MaskResult<Self> {
        if path.is_empty() {
            return Err(MaskError::geometry("stroke path is empty"));
        }
        if width == 0 {
            return Err(MaskError::geometry("stroke width must be at least 1 pixel"));
        }
        if let Some(p) = path.iter().find(|p| !p.is_finite()) {
            return Err(MaskError::geometry(format!(
                "stroke has a non-finite point ({}, {})",
                p.x, p.y
            )));
        }
        let points = path
            .iter()
            .map(|p| window.geo_to_local(p.x, p.y))
            .collect::<MaskResult<Vec<_>>>()?;
        Ok(Self { points, radius: width as f64 / 2.0 })
    }

    fn segments(&self) -> impl Iterator<Item = ((f64, f64), (f64, f64))> + '_ {
        let single = (self.points.len() == 1).then(|| (self.points[0], self.points[0]));
        single
            .into_iter()
            .chain(self.points.windows(2).map(|w| (w[0], w[1])))
    }
}

impl Footprint for Stroke {
    fn spans(&self, height: u32, width: u32, emit: &mut dyn FnMut(u32, u32, u32)) {
        let mut mask = GrayImage::new(width, height);
        let r_sq = self.radius * self.radius + STROKE_EPS;
        let clamp_h = |v: f64| v.clamp(0.0, height as f64) as u32;
        let clamp_w = |v: f64| v.clamp(0.0, width as f64) as u32;

        for (a, b) in self.segments() {
            let row0 = clamp_h((a.1.min(b.1) - self.radius - 0.5).floor());
            let row1 = clamp_h((a.1.max(b.1) + self.radius + 0.5).ceil());
            let col0 = clamp_w((a.0.min(b.0) - self.radius - 0.5).floor());
            let col1 = clamp_w((a.0.max(b.0) + self.radius + 0.5).ceil());
            for row in row0..row1 {
                for col in col0..col1 {
                    let centre = (col as f64 + 0.5, row as f64 + 0.5);
                    if segment_distance_sq(centre, a, b) <= r_sq {
                        mask.put_pixel(col, row, Luma([255u8]));
                    }
                }
            }
        }

        for row in 0..height {
            let mut col = 0;
            while col < width {
                if mask.get_pixel(col, row).0[0] == 0 {
                    col += 1;
                    continue;
                }
                let start = col;
                while col < width && mask.get_pixel(col, row).0[0] != 0 {
                    col += 1;
                }
                emit(row, start, col);
            }
        }
    }
}

/// Each part of a multi-part selection covers its cells independently.
impl<F: Footprint> Footprint for Vec<F> {
    fn spans(&self, height: u32, width: u32, emit: &mut dyn FnMut(u32, u32, u32)) {
        for part in self {
            part.spans(height, width, emit);
        }
    }
}

// ============================================================================
// WRITERS
// ============================================================================

/// What happens to cells no polygon covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillMode {
    /// Keep their current value.
    Update,
    /// Reset them to this value (normally the null class).
    Replace(u16),
}

fn fill(data: &mut Band, footprint: &dyn Footprint, value: u16) -> usize {
    let (w, h) = data.dimensions();
    let mut changed = 0;
    footprint.spans(h, w, &mut |row, c0, c1| {
        for col in c0..c1 {
            let px = data.get_pixel_mut(col, row);
            if px.0[0] != value {
                px.0[0] = value;
                changed += 1;
            }
        }
    });
    changed
}

/// New window where each cell takes the value of the last polygon covering
/// its centre. Fails before writing anything if a value does not fit.
pub fn rasterize(
    window: &GridWindow,
    band: usize,
    polygons: &[ValuedPolygon],
    mode: FillMode,
) -> MaskResult<GridWindow> {
    let pixel_type = window.pixel_type();
    if let FillMode::Replace(null) = mode {
        pixel_type.check(null)?;
    }
    let mut footprints = Vec::with_capacity(polygons.len());
    for p in polygons {
        pixel_type.check(p.value)?;
        footprints.push(PixelPolygon::from_geo(window, &p.polygon)?);
    }

    let mut out = window.clone();
    let data = out.band_mut(band)?;
    if let FillMode::Replace(null) = mode {
        for px in data.pixels_mut() {
            *px = Luma([null]);
        }
    }
    for (fp, p) in footprints.iter().zip(polygons) {
        fill(data, fp, p.value);
    }
    Ok(out)
}

/// In-place partial update: only covered cells are touched.
/// Returns how many cells changed value.
pub fn paint(window: &mut GridWindow, band: usize, footprint: &dyn Footprint, value: u16) -> MaskResult<usize> {
    window.pixel_type().check(value)?;
    let data = window.band_mut(band)?;
    Ok(fill(data, footprint, value))
}
