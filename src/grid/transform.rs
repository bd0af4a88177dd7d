use serde::{Deserialize, Serialize};

/// Affine pixel ↔ geographic mapping, GDAL coefficient order:
///
/// ```text
/// gx = c[0] + col * c[1] + row * c[2]
/// gy = c[3] + col * c[4] + row * c[5]
/// ```
///
/// `col`/`row` are continuous pixel coordinates, so the centre of cell
/// (r, c) is `(c + 0.5, r + 0.5)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform(pub [f64; 6]);

impl Default for GeoTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl GeoTransform {
    /// Pixel space is geographic space (y still grows downward).
    pub fn identity() -> Self {
        GeoTransform([0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    /// North-up raster with square or rectangular cells.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        GeoTransform([origin_x, pixel_width, 0.0, origin_y, 0.0, -pixel_height.abs()])
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.0[0], self.0[3])
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.0[1], self.0[5])
    }

    fn determinant(&self) -> f64 {
        self.0[1] * self.0[5] - self.0[2] * self.0[4]
    }

    pub fn is_invertible(&self) -> bool {
        let det = self.determinant();
        det.is_finite() && det != 0.0
    }

    /// Pixel (col, row) → geographic (x, y).
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let c = &self.0;
        (c[0] + col * c[1] + row * c[2], c[3] + col * c[4] + row * c[5])
    }

    /// Geographic (x, y) → pixel (col, row). `None` for a singular transform.
    pub fn invert(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.determinant();
        if !det.is_finite() || det == 0.0 {
            return None;
        }
        let c = &self.0;
        let dx = x - c[0];
        let dy = y - c[3];
        let col = (dx * c[5] - dy * c[2]) / det;
        let row = (dy * c[1] - dx * c[4]) / det;
        Some((col, row))
    }

    /// True when the mapping flips handedness (the usual north-up case).
    pub fn flips_orientation(&self) -> bool {
        self.determinant() < 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn north_up_maps_corners() {
        let t = GeoTransform::north_up(500_000.0, 4_600_000.0, 10.0, 10.0);
        assert_eq!(t.apply(0.0, 0.0), (500_000.0, 4_600_000.0));
        assert_eq!(t.apply(2.0, 3.0), (500_020.0, 4_599_970.0));
        assert!(t.flips_orientation());
    }

    #[test]
    fn invert_undoes_apply_with_rotation() {
        let t = GeoTransform([100.0, 2.0, 0.5, 50.0, 0.25, -3.0]);
        let (x, y) = t.apply(7.5, 4.25);
        let (col, row) = t.invert(x, y).unwrap();
        assert!((col - 7.5).abs() < 1e-9);
        assert!((row - 4.25).abs() < 1e-9);
    }

    #[test]
    fn singular_transform_has_no_inverse() {
        let t = GeoTransform([0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(!t.is_invertible());
        assert_eq!(t.invert(1.0, 1.0), None);
    }
}
