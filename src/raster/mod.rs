// ============================================================================
// RASTER STORES: the backing mask raster behind a tile session
// ============================================================================

pub mod tiff_io;

use crate::error::{MaskError, MaskResult};
use crate::grid::{Band, GeoTransform, GridWindow, PixelType, WindowRect};
use crate::symbology::Symbology;

pub use tiff_io::{ReferenceGrid, TiffRaster, open_reference};

/// GeoTIFF key directory (tag 34735) with its double (34736) and ASCII
/// (34737) parameter tags. Carried from file to file unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeoKeys {
    pub directory: Vec<u16>,
    pub doubles: Vec<f64>,
    pub ascii: Option<String>,
}

/// Band-addressable access to a mask raster. Band indices are 0-based.
pub trait RasterStore {
    /// (height, width) in pixels.
    fn size(&self) -> (u32, u32);
    fn band_count(&self) -> usize;
    fn band_names(&self) -> Vec<String>;
    fn pixel_type(&self) -> PixelType;
    fn transform(&self) -> GeoTransform;

    /// Copy of `rect` for the listed bands, in that order.
    fn read_window(&self, bands: &[usize], rect: WindowRect) -> MaskResult<GridWindow>;

    /// Write window band `i` into store band `bands[i]` at the window's rect.
    fn write_window(&mut self, bands: &[usize], window: &GridWindow) -> MaskResult<()>;

    fn read_symbology(&self) -> MaskResult<Option<Symbology>>;
    fn write_symbology(&mut self, symbology: &Symbology) -> MaskResult<()>;

    /// Coordinate reference keys, when the store carries any.
    fn geokeys(&self) -> Option<GeoKeys> {
        None
    }

    fn all_bands(&self) -> Vec<usize> {
        (0..self.band_count()).collect()
    }

    fn full_rect(&self) -> WindowRect {
        let (h, w) = self.size();
        WindowRect::new(0, 0, h, w)
    }

    /// Every band over the whole raster.
    fn read_all(&self) -> MaskResult<GridWindow> {
        self.read_window(&self.all_bands(), self.full_rect())
    }
}

/// Whole raster held in memory as one full-extent window.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryRaster {
    grid: GridWindow,
    symbology: Option<Symbology>,
    geokeys: Option<GeoKeys>,
}

impl MemoryRaster {
    pub fn new(grid: GridWindow) -> MaskResult<Self> {
        let rect = grid.rect();
        if rect.row != 0 || rect.col != 0 {
            return Err(MaskError::Raster(format!(
                "raster grid must start at the origin, not row {} col {}",
                rect.row, rect.col
            )));
        }
        Ok(Self { grid, symbology: None, geokeys: None })
    }

    /// New raster with every band set to `fill`.
    pub fn filled(
        height: u32,
        width: u32,
        band_names: Vec<String>,
        pixel_type: PixelType,
        transform: GeoTransform,
        fill: u16,
    ) -> MaskResult<Self> {
        let grid = GridWindow::filled(WindowRect::new(0, 0, height, width), pixel_type, transform, band_names, fill)?;
        Self::new(grid)
    }

    /// Blank mask on the grid of `reference`, carrying its coordinate keys.
    /// `fill` is also every band's null value.
    pub fn on_reference(
        reference: &ReferenceGrid,
        band_names: Vec<String>,
        pixel_type: PixelType,
        fill: u16,
    ) -> MaskResult<Self> {
        let mut symbology = Symbology::new(&band_names);
        for band in 0..band_names.len() {
            symbology.table_mut(band)?.set_null(fill);
        }
        let mut raster = Self::filled(reference.height, reference.width, band_names, pixel_type, reference.transform, fill)?;
        raster.write_symbology(&symbology)?;
        raster.geokeys = reference.geokeys.clone();
        Ok(raster)
    }

    pub fn grid(&self) -> &GridWindow {
        &self.grid
    }

    pub fn set_geokeys(&mut self, geokeys: Option<GeoKeys>) {
        self.geokeys = geokeys;
    }

    fn check_bands(&self, bands: &[usize]) -> MaskResult<()> {
        if bands.is_empty() {
            return Err(MaskError::Raster("no bands requested".into()));
        }
        for &b in bands {
            if b >= self.grid.band_count() {
                return Err(MaskError::NotFound(format!(
                    "band {} (raster has {})",
                    b + 1,
                    self.grid.band_count()
                )));
            }
        }
        Ok(())
    }

    fn check_rect(&self, rect: &WindowRect) -> MaskResult<()> {
        let (h, w) = self.size();
        if !rect.fits_within(h, w) {
            return Err(MaskError::NotFound(format!(
                "window row={} col={} {}x{} extends past the {}x{} raster",
                rect.row, rect.col, rect.height, rect.width, h, w
            )));
        }
        Ok(())
    }
}

impl RasterStore for MemoryRaster {
    fn size(&self) -> (u32, u32) {
        (self.grid.height(), self.grid.width())
    }

    fn band_count(&self) -> usize {
        self.grid.band_count()
    }

    fn band_names(&self) -> Vec<String> {
        self.grid.band_names().to_vec()
    }

    fn pixel_type(&self) -> PixelType {
        self.grid.pixel_type()
    }

    fn transform(&self) -> GeoTransform {
        *self.grid.transform()
    }

    fn read_window(&self, bands: &[usize], rect: WindowRect) -> MaskResult<GridWindow> {
        self.check_bands(bands)?;
        self.check_rect(&rect)?;
        let mut out = Vec::with_capacity(bands.len());
        let mut names = Vec::with_capacity(bands.len());
        for &b in bands {
            let src = self.grid.band(b)?;
            out.push(Band::from_fn(rect.width, rect.height, |x, y| {
                *src.get_pixel(x + rect.col, y + rect.row)
            }));
            names.push(self.grid.band_names()[b].clone());
        }
        GridWindow::new(rect, self.pixel_type(), self.transform(), out, names)
    }

    fn write_window(&mut self, bands: &[usize], window: &GridWindow) -> MaskResult<()> {
        self.check_bands(bands)?;
        let rect = window.rect();
        self.check_rect(&rect)?;
        if bands.len() != window.band_count() {
            return Err(MaskError::Raster(format!(
                "{} target bands given for a {}-band window",
                bands.len(),
                window.band_count()
            )));
        }
        let pixel_type = self.pixel_type();
        for i in 0..bands.len() {
            if let Some(&v) = window.band(i)?.as_raw().iter().max() {
                pixel_type.check(v)?;
            }
        }
        for (i, &b) in bands.iter().enumerate() {
            let src = window.band(i)?;
            let dst = self.grid.band_mut(b)?;
            for (x, y, px) in src.enumerate_pixels() {
                dst.put_pixel(x + rect.col, y + rect.row, *px);
            }
        }
        Ok(())
    }

    fn read_symbology(&self) -> MaskResult<Option<Symbology>> {
        Ok(self.symbology.clone())
    }

    fn write_symbology(&mut self, symbology: &Symbology) -> MaskResult<()> {
        self.symbology = Some(symbology.clone().aligned_to(self.grid.band_names()));
        Ok(())
    }

    fn geokeys(&self) -> Option<GeoKeys> {
        self.geokeys.clone()
    }
}
