// ============================================================================
// GEOMETRY: points, rings, polygons with holes, validation
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{MaskError, MaskResult};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Point { x, y }
    }
}

/// Closed ring: the last point repeats the first.
pub type Ring = Vec<Point>;

/// Exterior ring plus holes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Ring,
    #[serde(default)]
    pub holes: Vec<Ring>,
}

/// Multi-part selection; each part is filled independently.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultiPolygon(pub Vec<Polygon>);

/// A polygon tagged with one class value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValuedPolygon {
    pub polygon: Polygon,
    pub value: u16,
}

impl ValuedPolygon {
    pub fn new(polygon: Polygon, value: u16) -> Self {
        Self { polygon, value }
    }
}

/// Append the first point if the ring is open.
pub fn close_ring(mut ring: Ring) -> Ring {
    if let (Some(&first), Some(&last)) = (ring.first(), ring.last())
        && first != last
    {
        ring.push(first);
    }
    ring
}

/// Shoelace area; positive for counter-clockwise in a y-up frame
/// (clockwise on screen when y points down).
pub fn signed_area(ring: &[Point]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    sum / 2.0
}

/// Even-odd test against a single ring.
pub fn ring_contains(ring: &[Point], p: Point) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (ring[i], ring[j]);
        if (a.y > p.y) != (b.y > p.y) {
            let x = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if p.x < x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

impl Polygon {
    /// Build from an exterior ring; closes it if needed.
    pub fn new(exterior: Ring, holes: Vec<Ring>) -> Self {
        Self {
            exterior: close_ring(exterior),
            holes: holes.into_iter().map(close_ring).collect(),
        }
    }

    /// Axis-aligned rectangle from two opposite corners.
    pub fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self::new(
            vec![
                Point::new(x0, y0),
                Point::new(x1, y0),
                Point::new(x1, y1),
                Point::new(x0, y1),
            ],
            Vec::new(),
        )
    }

    pub fn rings(&self) -> impl Iterator<Item = &Ring> {
        std::iter::once(&self.exterior).chain(self.holes.iter())
    }

    /// Exterior area minus hole areas.
    pub fn area(&self) -> f64 {
        signed_area(&self.exterior).abs() - self.holes.iter().map(|h| signed_area(h).abs()).sum::<f64>()
    }

    /// Even-odd containment over all rings.
    pub fn contains(&self, p: Point) -> bool {
        self.rings().filter(|r| ring_contains(r, p)).count() % 2 == 1
    }

    pub fn map_points(&self, mut f: impl FnMut(Point) -> Point) -> Polygon {
        Polygon {
            exterior: self.exterior.iter().map(|&p| f(p)).collect(),
            holes: self
                .holes
                .iter()
                .map(|h| h.iter().map(|&p| f(p)).collect())
                .collect(),
        }
    }

    pub fn reversed(&self) -> Polygon {
        let rev = |r: &Ring| r.iter().rev().copied().collect::<Ring>();
        Polygon {
            exterior: rev(&self.exterior),
            holes: self.holes.iter().map(rev).collect(),
        }
    }

    /// Rejects rings with fewer than three distinct vertices, non-finite
    /// coordinates, zero area or crossing edges.
    pub fn validate(&self) -> MaskResult<()> {
        validate_ring(&self.exterior, "exterior")?;
        for (i, hole) in self.holes.iter().enumerate() {
            validate_ring(hole, &format!("hole {}", i + 1))?;
        }
        Ok(())
    }
}

/// Ring vertices without consecutive duplicates and without the closing point.
fn distinct_vertices(ring: &[Point]) -> Vec<Point> {
    let mut out: Vec<Point> = Vec::with_capacity(ring.len());
    for &p in ring {
        if out.last() != Some(&p) {
            out.push(p);
        }
    }
    while out.len() > 1 && out.first() == out.last() {
        out.pop();
    }
    out
}

fn validate_ring(ring: &[Point], what: &str) -> MaskResult<()> {
    if let Some(p) = ring.iter().find(|p| !p.is_finite()) {
        return Err(MaskError::geometry(format!("{} has a non-finite vertex ({}, {})", what, p.x, p.y)));
    }
    let pts = distinct_vertices(ring);
    if pts.len() < 3 {
        return Err(MaskError::geometry(format!(
            "{} has {} distinct vertices, at least 3 are needed",
            what,
            pts.len()
        )));
    }
    if signed_area(&pts) == 0.0 {
        return Err(MaskError::geometry(format!("{} encloses no area", what)));
    }
    if let Some((i, j)) = find_self_intersection(&pts) {
        return Err(MaskError::geometry(format!(
            "{} crosses itself (edges {} and {})",
            what,
            i + 1,
            j + 1
        )));
    }
    Ok(())
}

fn orient(a: Point, b: Point, c: Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Proper crossings and collinear overlaps count; touching at a shared
/// vertex does not.
fn segments_cross(a: Point, b: Point, c: Point, d: Point) -> bool {
    let o1 = orient(a, b, c);
    let o2 = orient(a, b, d);
    let o3 = orient(c, d, a);
    let o4 = orient(c, d, b);
    if o1 * o2 < 0.0 && o3 * o4 < 0.0 {
        return true;
    }
    // collinear overlap longer than a point
    if o1 == 0.0 && o2 == 0.0 {
        let shared = [c, d].iter().filter(|&&p| on_segment(a, b, p) && p != a && p != b).count()
            + [a, b].iter().filter(|&&p| on_segment(c, d, p) && p != c && p != d).count();
        return shared > 0 || (a == c && b == d) || (a == d && b == c);
    }
    // a vertex landing strictly inside the other edge
    (o1 == 0.0 && on_segment(a, b, c) && c != a && c != b)
        || (o2 == 0.0 && on_segment(a, b, d) && d != a && d != b)
        || (o3 == 0.0 && on_segment(c, d, a) && a != c && a != d)
        || (o4 == 0.0 && on_segment(c, d, b) && b != c && b != d)
}

/// Indices of the first pair of non-adjacent crossing edges.
fn find_self_intersection(pts: &[Point]) -> Option<(usize, usize)> {
    let n = pts.len();
    for i in 0..n {
        let (a, b) = (pts[i], pts[(i + 1) % n]);
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            let (c, d) = (pts[j], pts[(j + 1) % n]);
            if adjacent {
                // only a fold-back over the shared vertex matters
                let shared = if j == i + 1 { b } else { a };
                let (p, q) = if j == i + 1 { (a, d) } else { (c, b) };
                if orient(p, shared, q) == 0.0 && (p.x - shared.x) * (q.x - shared.x) + (p.y - shared.y) * (q.y - shared.y) > 0.0 {
                    return Some((i, j));
                }
                continue;
            }
            if segments_cross(a, b, c, d) {
                return Some((i, j));
            }
        }
    }
    None
}

/// Squared distance from `p` to segment `a`-`b`.
pub fn segment_distance_sq(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a.0 + t * dx, a.1 + t * dy);
    (p.0 - cx) * (p.0 - cx) + (p.1 - cy) * (p.1 - cy)
}
