pub mod transform;

use std::collections::BTreeSet;

use image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

use crate::error::{MaskError, MaskResult};
pub use transform::GeoTransform;

/// One band of class codes. Pixel (x, y) is (col, row).
pub type Band = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Storage type of the mask raster; bounds the legal class codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    U8,
    U16,
}

impl PixelType {
    pub fn max_value(self) -> u16 {
        match self {
            PixelType::U8 => u8::MAX as u16,
            PixelType::U16 => u16::MAX,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            PixelType::U8 => 8,
            PixelType::U16 => 16,
        }
    }

    pub fn check(self, value: u16) -> MaskResult<()> {
        if value > self.max_value() {
            return Err(MaskError::Raster(format!(
                "value {} does not fit in a {}-bit raster",
                value,
                self.bits()
            )));
        }
        Ok(())
    }
}

/// Rectangle of the parent raster in pixel units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowRect {
    pub row: u32,
    pub col: u32,
    pub height: u32,
    pub width: u32,
}

impl WindowRect {
    pub fn new(row: u32, col: u32, height: u32, width: u32) -> Self {
        Self { row, col, height, width }
    }

    pub fn row_end(&self) -> u64 {
        self.row as u64 + self.height as u64
    }

    pub fn col_end(&self) -> u64 {
        self.col as u64 + self.width as u64
    }

    pub fn contains_cell(&self, row: u32, col: u32) -> bool {
        row >= self.row && (row as u64) < self.row_end() && col >= self.col && (col as u64) < self.col_end()
    }

    /// Continuous pixel point (col, row); half-open on the far edges.
    pub fn contains_point(&self, col: f64, row: f64) -> bool {
        row >= self.row as f64
            && row < self.row_end() as f64
            && col >= self.col as f64
            && col < self.col_end() as f64
    }

    /// Area-overlap test; rectangles sharing only an edge do not intersect.
    pub fn intersects(&self, other: &WindowRect) -> bool {
        (self.row as u64) < other.row_end()
            && (other.row as u64) < self.row_end()
            && (self.col as u64) < other.col_end()
            && (other.col as u64) < self.col_end()
    }

    pub fn intersection(&self, other: &WindowRect) -> Option<WindowRect> {
        if !self.intersects(other) {
            return None;
        }
        let row = self.row.max(other.row);
        let col = self.col.max(other.col);
        let row_end = self.row_end().min(other.row_end());
        let col_end = self.col_end().min(other.col_end());
        Some(WindowRect::new(row, col, (row_end - row as u64) as u32, (col_end - col as u64) as u32))
    }

    pub fn fits_within(&self, height: u32, width: u32) -> bool {
        self.row_end() <= height as u64 && self.col_end() <= width as u64
    }
}

/// A rectangular window of one or more bands of the mask raster, with the
/// parent raster's transform. All bands share the window's size and every
/// stored value fits `pixel_type`.
#[derive(Clone, Debug, PartialEq)]
pub struct GridWindow {
    rect: WindowRect,
    pixel_type: PixelType,
    transform: GeoTransform,
    bands: Vec<Band>,
    band_names: Vec<String>,
}

impl GridWindow {
    pub fn new(
        rect: WindowRect,
        pixel_type: PixelType,
        transform: GeoTransform,
        bands: Vec<Band>,
        band_names: Vec<String>,
    ) -> MaskResult<Self> {
        if rect.height == 0 || rect.width == 0 {
            return Err(MaskError::Raster(format!(
                "window at row {}, col {} has an empty size {}x{}",
                rect.row, rect.col, rect.height, rect.width
            )));
        }
        if bands.is_empty() {
            return Err(MaskError::Raster("window needs at least one band".into()));
        }
        if band_names.len() != bands.len() {
            return Err(MaskError::Raster(format!(
                "{} band names given for {} bands",
                band_names.len(),
                bands.len()
            )));
        }
        if !transform.is_invertible() {
            return Err(MaskError::Raster(format!("transform {:?} is not invertible", transform.0)));
        }
        for (i, band) in bands.iter().enumerate() {
            if band.dimensions() != (rect.width, rect.height) {
                return Err(MaskError::Raster(format!(
                    "band {} is {}x{} but the window is {}x{}",
                    i + 1,
                    band.height(),
                    band.width(),
                    rect.height,
                    rect.width
                )));
            }
            if let Some(v) = band.as_raw().iter().copied().find(|&v| v > pixel_type.max_value()) {
                pixel_type.check(v)?;
            }
        }
        Ok(Self { rect, pixel_type, transform, bands, band_names })
    }

    /// Every band filled with `value`.
    pub fn filled(
        rect: WindowRect,
        pixel_type: PixelType,
        transform: GeoTransform,
        band_names: Vec<String>,
        value: u16,
    ) -> MaskResult<Self> {
        pixel_type.check(value)?;
        let bands = band_names
            .iter()
            .map(|_| Band::from_pixel(rect.width, rect.height, Luma([value])))
            .collect();
        Self::new(rect, pixel_type, transform, bands, band_names)
    }

    /// Single-band window at the raster origin, identity transform.
    /// `rows` must be rectangular.
    pub fn from_rows(rows: &[&[u16]], pixel_type: PixelType) -> MaskResult<Self> {
        let height = rows.len() as u32;
        let width = rows.first().map_or(0, |r| r.len()) as u32;
        if rows.iter().any(|r| r.len() as u32 != width) {
            return Err(MaskError::Raster("rows have different lengths".into()));
        }
        let raw: Vec<u16> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        let band = Band::from_raw(width, height, raw)
            .ok_or_else(|| MaskError::Raster("row data does not match window size".into()))?;
        Self::new(
            WindowRect::new(0, 0, height, width),
            pixel_type,
            GeoTransform::identity(),
            vec![band],
            vec!["1".to_string()],
        )
    }

    pub fn rect(&self) -> WindowRect {
        self.rect
    }

    pub fn height(&self) -> u32 {
        self.rect.height
    }

    pub fn width(&self) -> u32 {
        self.rect.width
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn band_names(&self) -> &[String] {
        &self.band_names
    }

    pub fn band(&self, band: usize) -> MaskResult<&Band> {
        self.bands.get(band).ok_or_else(|| self.missing_band(band))
    }

    /// Writers are responsible for keeping values inside `pixel_type`.
    pub(crate) fn band_mut(&mut self, band: usize) -> MaskResult<&mut Band> {
        let count = self.bands.len();
        self.bands
            .get_mut(band)
            .ok_or_else(|| MaskError::NotFound(format!("band {} (window has {})", band + 1, count)))
    }

    fn missing_band(&self, band: usize) -> MaskError {
        MaskError::NotFound(format!("band {} (window has {})", band + 1, self.bands.len()))
    }

    /// Window-local cell value.
    pub fn get(&self, band: usize, row: u32, col: u32) -> Option<u16> {
        let b = self.bands.get(band)?;
        if row < self.rect.height && col < self.rect.width {
            Some(b.get_pixel(col, row).0[0])
        } else {
            None
        }
    }

    pub fn set(&mut self, band: usize, row: u32, col: u32, value: u16) -> MaskResult<()> {
        self.pixel_type.check(value)?;
        let (h, w) = (self.rect.height, self.rect.width);
        if row >= h || col >= w {
            return Err(MaskError::NotFound(format!("cell ({}, {}) outside {}x{} window", row, col, h, w)));
        }
        self.band_mut(band)?.put_pixel(col, row, Luma([value]));
        Ok(())
    }

    /// Distinct values present in a band.
    pub fn unique_values(&self, band: usize) -> MaskResult<BTreeSet<u16>> {
        Ok(self.band(band)?.as_raw().iter().copied().collect())
    }

    /// Window-local continuous pixel point (col, row) → geographic (x, y).
    pub fn local_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        self.transform
            .apply(col + self.rect.col as f64, row + self.rect.row as f64)
    }

    /// Geographic (x, y) → window-local continuous pixel point (col, row).
    pub fn geo_to_local(&self, x: f64, y: f64) -> MaskResult<(f64, f64)> {
        let (col, row) = self
            .transform
            .invert(x, y)
            .ok_or_else(|| MaskError::Raster("transform is not invertible".into()))?;
        Ok((col - self.rect.col as f64, row - self.rect.row as f64))
    }

    /// Geographic centre of a window-local cell.
    pub fn cell_center(&self, row: u32, col: u32) -> (f64, f64) {
        self.local_to_geo(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Copy of a sub-rectangle (parent-raster coordinates).
    pub fn crop(&self, rect: WindowRect) -> MaskResult<GridWindow> {
        let inside = rect.row >= self.rect.row
            && rect.col >= self.rect.col
            && rect.row_end() <= self.rect.row_end()
            && rect.col_end() <= self.rect.col_end();
        if !inside {
            return Err(MaskError::NotFound(format!(
                "window {:?} is not inside {:?}",
                rect, self.rect
            )));
        }
        let (dr, dc) = (rect.row - self.rect.row, rect.col - self.rect.col);
        let bands = self
            .bands
            .iter()
            .map(|b| Band::from_fn(rect.width, rect.height, |x, y| *b.get_pixel(x + dc, y + dr)))
            .collect();
        GridWindow::new(rect, self.pixel_type, self.transform, bands, self.band_names.clone())
    }

    /// Overwrite the cells shared with `other` (both in parent coordinates).
    /// Returns the number of cells copied per band.
    pub fn paste(&mut self, other: &GridWindow) -> MaskResult<u64> {
        if other.band_count() != self.band_count() {
            return Err(MaskError::Raster(format!(
                "cannot paste {} bands into {}",
                other.band_count(),
                self.band_count()
            )));
        }
        if other.pixel_type.max_value() > self.pixel_type.max_value() {
            for b in 0..other.band_count() {
                if let Some(&v) = other.bands[b].as_raw().iter().max() {
                    self.pixel_type.check(v)?;
                }
            }
        }
        let Some(shared) = self.rect.intersection(&other.rect) else { return Ok(0) };
        for (dst, src) in self.bands.iter_mut().zip(other.bands.iter()) {
            for row in shared.row..shared.row + shared.height {
                for col in shared.col..shared.col + shared.width {
                    let v = *src.get_pixel(col - other.rect.col, row - other.rect.row);
                    dst.put_pixel(col - self.rect.col, row - self.rect.row, v);
                }
            }
        }
        Ok(shared.height as u64 * shared.width as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GridWindow {
        GridWindow::from_rows(&[&[1, 2, 3], &[4, 5, 6]], PixelType::U8).unwrap()
    }

    #[test]
    fn rejects_values_outside_pixel_type() {
        let band = Band::from_pixel(2, 2, Luma([300]));
        let err = GridWindow::new(
            WindowRect::new(0, 0, 2, 2),
            PixelType::U8,
            GeoTransform::identity(),
            vec![band],
            vec!["1".into()],
        )
        .unwrap_err();
        assert!(matches!(err, MaskError::Raster(_)));

        let mut w = sample();
        assert!(w.set(0, 0, 0, 256).is_err());
        assert_eq!(w.get(0, 0, 0), Some(1));
    }

    #[test]
    fn rejects_band_size_mismatch() {
        let band = Band::new(3, 2);
        let err = GridWindow::new(
            WindowRect::new(0, 0, 3, 3),
            PixelType::U16,
            GeoTransform::identity(),
            vec![band],
            vec!["1".into()],
        );
        assert!(err.is_err());
    }

    #[test]
    fn crop_and_paste_use_parent_coordinates() {
        let mut big = GridWindow::filled(
            WindowRect::new(10, 20, 4, 4),
            PixelType::U8,
            GeoTransform::identity(),
            vec!["a".into()],
            0,
        )
        .unwrap();
        let small = GridWindow::filled(
            WindowRect::new(12, 22, 4, 4),
            PixelType::U8,
            GeoTransform::identity(),
            vec!["a".into()],
            9,
        )
        .unwrap();
        assert_eq!(big.paste(&small).unwrap(), 4);
        assert_eq!(big.get(0, 2, 2), Some(9));
        assert_eq!(big.get(0, 3, 3), Some(9));
        assert_eq!(big.get(0, 1, 3), Some(0));

        let part = big.crop(WindowRect::new(12, 22, 2, 2)).unwrap();
        assert_eq!(part.unique_values(0).unwrap().into_iter().collect::<Vec<_>>(), vec![9]);
        assert!(big.crop(WindowRect::new(9, 20, 2, 2)).is_err());
    }

    #[test]
    fn geo_round_trip_through_window_offset() {
        let w = GridWindow::filled(
            WindowRect::new(5, 7, 3, 3),
            PixelType::U8,
            GeoTransform::north_up(100.0, 200.0, 2.0, 2.0),
            vec!["1".into()],
            0,
        )
        .unwrap();
        let (x, y) = w.cell_center(0, 0);
        assert_eq!((x, y), (100.0 + 7.5 * 2.0, 200.0 - 5.5 * 2.0));
        let (col, row) = w.geo_to_local(x, y).unwrap();
        assert!((col - 0.5).abs() < 1e-9 && (row - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rect_intersection_excludes_shared_edges() {
        let a = WindowRect::new(0, 0, 4, 4);
        let b = WindowRect::new(0, 4, 4, 4);
        let c = WindowRect::new(2, 2, 4, 4);
        assert!(!a.intersects(&b));
        assert_eq!(a.intersection(&c), Some(WindowRect::new(2, 2, 2, 2)));
    }
}
