// ============================================================================
// POLYGON SYNTHESIS: one region per connected equal-valued component
// ============================================================================
//
// 1. Label components with a BFS flood fill (4- or 8-neighbour).
// 2. Emit a directed unit edge on every cell side whose neighbour is outside
//    the window or carries another label. Edges keep their cell on the right
//    (y pointing down), so outer boundaries come out clockwise on screen and
//    holes counter-clockwise.
// 3. Chain edges into rings. Where two cells of one label meet only at a
//    corner, the turn taken decides whether they are joined (8-neighbour:
//    turn left) or kept apart (4-neighbour: turn right).
// 4. Drop collinear vertices, classify rings by the sign of their area and
//    move them into geographic space.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{MaskError, MaskResult, SizeWarning};
use crate::geometry::{Point, Polygon, Ring, ValuedPolygon};
use crate::grid::{Band, GridWindow};
use crate::log_warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Connectivity {
    /// Cells join through shared sides only.
    Four,
    /// Cells also join through shared corners.
    Eight,
}

impl Connectivity {
    fn offsets(self) -> &'static [(isize, isize)] {
        match self {
            Connectivity::Four => &[(1, 0), (-1, 0), (0, 1), (0, -1)],
            Connectivity::Eight => &[
                (1, 0),
                (-1, 0),
                (0, 1),
                (0, -1),
                (1, 1),
                (1, -1),
                (-1, 1),
                (-1, -1),
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SynthesisOptions {
    pub connectivity: Connectivity,
    /// Region count above which a `SizeWarning` is attached.
    pub warn_threshold: usize,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            connectivity: Connectivity::Eight,
            warn_threshold: 10_000,
        }
    }
}

/// Regions of one band, in order of each component's first cell
/// (row-major).
#[derive(Clone, Debug)]
pub struct Synthesis {
    pub regions: Vec<ValuedPolygon>,
    pub warning: Option<SizeWarning>,
}

const UNLABELLED: u32 = u32::MAX;

// ============================================================================
// STEP 1: CONNECTED COMPONENTS
// ============================================================================

/// Per-cell component labels and the value of each component.
pub fn label_components(band: &Band, connectivity: Connectivity) -> (Vec<u32>, Vec<u16>) {
    let (w, h) = (band.width() as usize, band.height() as usize);
    let raw = band.as_raw();
    let mut labels = vec![UNLABELLED; w * h];
    let mut values: Vec<u16> = Vec::new();
    let mut queue: VecDeque<usize> = VecDeque::new();

    for start in 0..w * h {
        if labels[start] != UNLABELLED {
            continue;
        }
        let label = values.len() as u32;
        let value = raw[start];
        values.push(value);
        labels[start] = label;
        queue.push_back(start);

        while let Some(idx) = queue.pop_front() {
            let (x, y) = ((idx % w) as isize, (idx / w) as isize);
            for &(dx, dy) in connectivity.offsets() {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                    continue;
                }
                let n = ny as usize * w + nx as usize;
                if labels[n] == UNLABELLED && raw[n] == value {
                    labels[n] = label;
                    queue.push_back(n);
                }
            }
        }
    }

    (labels, values)
}

// ============================================================================
// STEP 2: BOUNDARY EDGES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dir {
    E,
    S,
    W,
    N,
}

impl Dir {
    fn left(self) -> Dir {
        match self {
            Dir::E => Dir::N,
            Dir::N => Dir::W,
            Dir::W => Dir::S,
            Dir::S => Dir::E,
        }
    }

    fn right(self) -> Dir {
        match self {
            Dir::E => Dir::S,
            Dir::S => Dir::W,
            Dir::W => Dir::N,
            Dir::N => Dir::E,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Edge {
    from: usize,
    to: usize,
    dir: Dir,
    label: u32,
}

/// Edges plus a per-vertex index of outgoing edges (CSR layout).
struct EdgeSet {
    edges: Vec<Edge>,
    offsets: Vec<usize>,
    outgoing: Vec<usize>,
    stride: usize,
}

impl EdgeSet {
    fn build(labels: &[u32], w: usize, h: usize) -> Self {
        let stride = w + 1;
        let vertex = |x: usize, y: usize| y * stride + x;
        let mut edges = Vec::new();

        for y in 0..h {
            for x in 0..w {
                let label = labels[y * w + x];
                let differs = |nx: isize, ny: isize| {
                    nx < 0
                        || ny < 0
                        || nx >= w as isize
                        || ny >= h as isize
                        || labels[ny as usize * w + nx as usize] != label
                };
                let (xi, yi) = (x as isize, y as isize);
                if differs(xi, yi - 1) {
                    edges.push(Edge { from: vertex(x, y), to: vertex(x + 1, y), dir: Dir::E, label });
                }
                if differs(xi + 1, yi) {
                    edges.push(Edge { from: vertex(x + 1, y), to: vertex(x + 1, y + 1), dir: Dir::S, label });
                }
                if differs(xi, yi + 1) {
                    edges.push(Edge { from: vertex(x + 1, y + 1), to: vertex(x, y + 1), dir: Dir::W, label });
                }
                if differs(xi - 1, yi) {
                    edges.push(Edge { from: vertex(x, y + 1), to: vertex(x, y), dir: Dir::N, label });
                }
            }
        }

        let vertex_count = stride * (h + 1);
        let mut offsets = vec![0usize; vertex_count + 1];
        for e in &edges {
            offsets[e.from + 1] += 1;
        }
        for i in 0..vertex_count {
            offsets[i + 1] += offsets[i];
        }
        let mut fill = offsets.clone();
        let mut outgoing = vec![0usize; edges.len()];
        for (i, e) in edges.iter().enumerate() {
            outgoing[fill[e.from]] = i;
            fill[e.from] += 1;
        }

        Self { edges, offsets, outgoing, stride }
    }

    fn outgoing(&self, v: usize) -> &[usize] {
        &self.outgoing[self.offsets[v]..self.offsets[v + 1]]
    }

    fn xy(&self, v: usize) -> (i64, i64) {
        ((v % self.stride) as i64, (v / self.stride) as i64)
    }

    /// Next edge of the same label after `e`.
    fn successor(&self, e: usize, connectivity: Connectivity) -> Option<usize> {
        let edge = self.edges[e];
        let mut candidates = self
            .outgoing(edge.to)
            .iter()
            .copied()
            .filter(|&o| self.edges[o].label == edge.label);
        let first = candidates.next()?;
        let Some(second) = candidates.next() else { return Some(first) };
        let wanted = match connectivity {
            Connectivity::Eight => edge.dir.left(),
            Connectivity::Four => edge.dir.right(),
        };
        if self.edges[second].dir == wanted { Some(second) } else { Some(first) }
    }
}

// ============================================================================
// STEP 3: RING TRACING
// ============================================================================

struct TracedRing {
    label: u32,
    /// Corner vertices in pixel units, without the closing repeat.
    vertices: Vec<(i64, i64)>,
    /// Twice the signed area; positive for outer boundaries.
    twice_area: i64,
    /// Centre of a cell just inside the ring, used to place stray holes.
    inner_sample: (f64, f64),
}

fn trace_rings(set: &EdgeSet, connectivity: Connectivity) -> MaskResult<Vec<TracedRing>> {
    let mut visited = vec![false; set.edges.len()];
    let mut rings = Vec::new();
    let mut dirs: Vec<Dir> = Vec::new();
    let mut starts: Vec<usize> = Vec::new();

    for e0 in 0..set.edges.len() {
        if visited[e0] {
            continue;
        }
        dirs.clear();
        starts.clear();
        let mut e = e0;
        loop {
            if visited[e] {
                return Err(MaskError::Raster(format!(
                    "boundary tracing revisited an edge at vertex {:?}",
                    set.xy(set.edges[e].from)
                )));
            }
            visited[e] = true;
            dirs.push(set.edges[e].dir);
            starts.push(set.edges[e].from);
            let next = set.successor(e, connectivity).ok_or_else(|| {
                MaskError::Raster(format!(
                    "boundary tracing found an open ring at vertex {:?}",
                    set.xy(set.edges[e].to)
                ))
            })?;
            if next == e0 {
                break;
            }
            e = next;
        }

        // keep only corners
        let n = dirs.len();
        let mut vertices = Vec::new();
        for i in 0..n {
            let prev = dirs[(i + n - 1) % n];
            if dirs[i] != prev {
                vertices.push(set.xy(starts[i]));
            }
        }

        let m = vertices.len();
        let mut twice_area = 0i64;
        for i in 0..m {
            let (x0, y0) = vertices[i];
            let (x1, y1) = vertices[(i + 1) % m];
            twice_area += x0 * y1 - x1 * y0;
        }

        let first = set.edges[e0];
        let (fx, fy) = set.xy(first.from);
        let (fx, fy) = (fx as f64, fy as f64);
        let inner_sample = match first.dir {
            Dir::E => (fx + 0.5, fy + 0.5),
            Dir::S => (fx - 0.5, fy + 0.5),
            Dir::W => (fx - 0.5, fy - 0.5),
            Dir::N => (fx + 0.5, fy - 0.5),
        };

        rings.push(TracedRing { label: first.label, vertices, twice_area, inner_sample });
    }

    Ok(rings)
}

fn pixel_ring_contains(ring: &[(i64, i64)], (px, py): (f64, f64)) -> bool {
    let mut inside = false;
    let n = ring.len();
    let mut j = n.saturating_sub(1);
    for i in 0..n {
        let (ax, ay) = (ring[i].0 as f64, ring[i].1 as f64);
        let (bx, by) = (ring[j].0 as f64, ring[j].1 as f64);
        if (ay > py) != (by > py) {
            let x = ax + (py - ay) / (by - ay) * (bx - ax);
            if px < x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

// ============================================================================
// STEP 4: ASSEMBLY
// ============================================================================

/// Synthesize the regions of one band of `window`.
pub fn synthesize(window: &GridWindow, band: usize, options: &SynthesisOptions) -> MaskResult<Synthesis> {
    let data = window.band(band)?;
    let (w, h) = (data.width() as usize, data.height() as usize);
    let (labels, values) = label_components(data, options.connectivity);
    let set = EdgeSet::build(&labels, w, h);
    let rings = trace_rings(&set, options.connectivity)?;

    let mut exteriors: Vec<Vec<TracedRing>> = (0..values.len()).map(|_| Vec::new()).collect();
    let mut holes: Vec<Vec<TracedRing>> = (0..values.len()).map(|_| Vec::new()).collect();
    for ring in rings {
        let label = ring.label as usize;
        if ring.twice_area > 0 {
            exteriors[label].push(ring);
        } else {
            holes[label].push(ring);
        }
    }

    let flip = window.transform().flips_orientation();
    let to_geo = |ring: &TracedRing| -> Ring {
        let mut pts: Ring = ring
            .vertices
            .iter()
            .map(|&(x, y)| Point::from(window.local_to_geo(x as f64, y as f64)))
            .collect();
        if let Some(&first) = pts.first() {
            pts.push(first);
        }
        // exteriors counter-clockwise in a y-up geographic frame
        if flip {
            pts.reverse();
        }
        pts
    };

    let mut regions = Vec::with_capacity(values.len());
    for (label, value) in values.iter().copied().enumerate() {
        let outer = &exteriors[label];
        if outer.is_empty() {
            return Err(MaskError::Raster(format!(
                "component {} (value {}) has no outer boundary",
                label, value
            )));
        }
        let mut parts: Vec<Vec<Ring>> = outer.iter().map(|_| Vec::new()).collect();
        for hole in &holes[label] {
            let owner = if outer.len() == 1 {
                0
            } else {
                outer
                    .iter()
                    .position(|o| pixel_ring_contains(&o.vertices, hole.inner_sample))
                    .unwrap_or(0)
            };
            parts[owner].push(to_geo(hole));
        }
        for (ext, hole_rings) in outer.iter().zip(parts) {
            regions.push(ValuedPolygon::new(
                Polygon { exterior: to_geo(ext), holes: hole_rings },
                value,
            ));
        }
    }

    let warning = if regions.len() > options.warn_threshold {
        let warning = SizeWarning { regions: regions.len(), threshold: options.warn_threshold };
        log_warn!("window {:?}: {}", window.rect(), warning);
        Some(warning)
    } else {
        None
    };

    Ok(Synthesis { regions, warning })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::signed_area;
    use crate::grid::{GeoTransform, PixelType, WindowRect};

    fn window(rows: &[&[u16]]) -> GridWindow {
        GridWindow::from_rows(rows, PixelType::U8).unwrap()
    }

    fn run(w: &GridWindow, connectivity: Connectivity) -> Synthesis {
        let options = SynthesisOptions { connectivity, warn_threshold: 1000 };
        synthesize(w, 0, &options).unwrap()
    }

    #[test]
    fn uniform_window_is_one_rectangle() {
        let w = window(&[&[4, 4, 4], &[4, 4, 4]]);
        let s = run(&w, Connectivity::Eight);
        assert_eq!(s.regions.len(), 1);
        let r = &s.regions[0];
        assert_eq!(r.value, 4);
        // four corners plus closing point: collinear vertices merged
        assert_eq!(r.polygon.exterior.len(), 5);
        assert!(r.polygon.holes.is_empty());
        assert_eq!(r.polygon.area(), 6.0);
    }

    #[test]
    fn enclosed_cell_becomes_a_hole() {
        let w = window(&[&[1, 1, 1], &[1, 2, 1], &[1, 1, 1]]);
        let s = run(&w, Connectivity::Four);
        assert_eq!(s.regions.len(), 2);
        let outer = &s.regions[0];
        assert_eq!(outer.value, 1);
        assert_eq!(outer.polygon.holes.len(), 1);
        assert_eq!(outer.polygon.area(), 8.0);
        assert_eq!(s.regions[1].value, 2);
        assert_eq!(s.regions[1].polygon.area(), 1.0);
    }

    #[test]
    fn diagonal_cells_follow_connectivity() {
        let w = window(&[&[1, 0], &[0, 1]]);
        let eight = run(&w, Connectivity::Eight);
        // 1s joined; the 0s are also corner-connected and joined
        assert_eq!(eight.regions.len(), 2);
        assert!(eight.regions.iter().all(|r| r.polygon.holes.is_empty()));
        let four = run(&w, Connectivity::Four);
        assert_eq!(four.regions.len(), 4);
        assert!(four.regions.iter().all(|r| r.polygon.area() == 1.0));
    }

    #[test]
    fn ring_with_diagonal_pinch_keeps_one_exterior() {
        // value 1 forms a loop whose hole touches the outside at a corner
        let w = window(&[
            &[1, 1, 1, 0],
            &[1, 0, 0, 1],
            &[1, 0, 0, 1],
            &[1, 1, 1, 1],
        ]);
        let four = run(&w, Connectivity::Four);
        let ones: Vec<_> = four.regions.iter().filter(|r| r.value == 1).collect();
        assert_eq!(ones.len(), 1);
        assert_eq!(ones[0].polygon.area(), 11.0);
        assert!(ones[0].polygon.holes.is_empty());
        assert_eq!(four.regions.iter().filter(|r| r.value == 0).count(), 2);

        // the corner-touching 0 joins the inner block; the 1-loop gets a hole
        let eight = run(&w, Connectivity::Eight);
        let zeros: Vec<_> = eight.regions.iter().filter(|r| r.value == 0).collect();
        assert_eq!(zeros.len(), 1);
        assert_eq!(zeros[0].polygon.area(), 5.0);
        let ones: Vec<_> = eight.regions.iter().filter(|r| r.value == 1).collect();
        assert_eq!(ones.len(), 1);
        assert_eq!(ones[0].polygon.holes.len(), 1);
        assert_eq!(ones[0].polygon.area(), 11.0);
    }

    #[test]
    fn exteriors_are_counter_clockwise_in_geographic_frame() {
        let band = Band::from_fn(3, 3, |x, y| image::Luma([((x + y) % 2) as u16]));
        let w = GridWindow::new(
            WindowRect::new(10, 10, 3, 3),
            PixelType::U8,
            GeoTransform::north_up(1000.0, 2000.0, 5.0, 5.0),
            vec![band],
            vec!["1".into()],
        )
        .unwrap();
        let s = run(&w, Connectivity::Four);
        assert_eq!(s.regions.len(), 9);
        for r in &s.regions {
            assert!(signed_area(&r.polygon.exterior) > 0.0);
            assert_eq!(r.polygon.area(), 25.0);
        }
    }

    #[test]
    fn size_warning_over_threshold() {
        let w = window(&[&[1, 2, 3, 4]]);
        let options = SynthesisOptions { connectivity: Connectivity::Four, warn_threshold: 3 };
        let s = synthesize(&w, 0, &options).unwrap();
        assert_eq!(s.warning, Some(SizeWarning { regions: 4, threshold: 3 }));
        let options = SynthesisOptions { connectivity: Connectivity::Four, warn_threshold: 4 };
        assert!(synthesize(&w, 0, &options).unwrap().warning.is_none());
    }

    #[test]
    fn missing_band_is_not_found() {
        let w = window(&[&[1]]);
        assert!(matches!(
            synthesize(&w, 3, &SynthesisOptions::default()),
            Err(MaskError::NotFound(_))
        ));
    }
}
