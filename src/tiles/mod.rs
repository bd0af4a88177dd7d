// ============================================================================
// TILE INDEX: ordered tile descriptors persisted as a CSV table
// ============================================================================

pub mod layout;
pub mod table;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{MaskError, MaskResult};
use crate::geometry::{Point, Polygon};
use crate::grid::{GeoTransform, WindowRect};
use table::{CsvRecord, CsvTable};

pub const COL_FILENAME: &str = "filename";
pub const COL_Y: &str = "y";
pub const COL_X: &str = "x";
pub const COL_HEIGHT: &str = "height";
pub const COL_WIDTH: &str = "width";
pub const COL_PRIORITY: &str = "priority";

/// Columns every tile list must carry, in the order new lists are written.
pub const REQUIRED_COLUMNS: [&str; 6] = [COL_Y, COL_X, COL_HEIGHT, COL_WIDTH, COL_FILENAME, COL_PRIORITY];

/// One tile: a rectangle of the raster at `path`, plus its completion flag.
#[derive(Clone, Debug, PartialEq)]
pub struct TileDescriptor {
    pub path: String,
    pub rect: WindowRect,
    /// `priority == 0` in the table.
    pub complete: bool,
    /// Non-standard columns, verbatim.
    pub extra: BTreeMap<String, String>,
}

impl TileDescriptor {
    pub fn new(path: impl Into<String>, rect: WindowRect) -> Self {
        Self { path: path.into(), rect, complete: false, extra: BTreeMap::new() }
    }

    pub fn priority(&self) -> u8 {
        if self.complete { 0 } else { 1 }
    }

    /// Geographic corners: upper-left, upper-right, lower-right, lower-left.
    pub fn corners(&self, transform: &GeoTransform) -> [Point; 4] {
        let r = &self.rect;
        let (c0, r0) = (r.col as f64, r.row as f64);
        let (c1, r1) = (c0 + r.width as f64, r0 + r.height as f64);
        [
            transform.apply(c0, r0).into(),
            transform.apply(c1, r0).into(),
            transform.apply(c1, r1).into(),
            transform.apply(c0, r1).into(),
        ]
    }

    /// Tile outline as a closed, counter-clockwise geographic polygon.
    pub fn footprint(&self, transform: &GeoTransform) -> Polygon {
        let poly = Polygon::new(self.corners(transform).to_vec(), Vec::new());
        if transform.flips_orientation() { poly.reversed() } else { poly }
    }

    fn key(&self) -> (String, u32, u32) {
        (self.path.clone(), self.rect.row, self.rect.col)
    }
}

/// Completion bookkeeping over a tile list. Insertion order is display order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TileIndex {
    columns: Vec<String>,
    tiles: Vec<TileDescriptor>,
    path: Option<PathBuf>,
}

impl TileIndex {
    /// Empty index with the standard column layout.
    pub fn new() -> Self {
        Self {
            columns: REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            tiles: Vec::new(),
            path: None,
        }
    }

    /// Empty index with the given column order; missing standard columns
    /// are appended.
    pub fn with_columns(columns: &[String]) -> Self {
        let mut index = Self { columns: Vec::new(), tiles: Vec::new(), path: None };
        for c in columns.iter().map(String::as_str).chain(REQUIRED_COLUMNS) {
            index.ensure_column(c);
        }
        index
    }

    /// Index over generated tiles, all pointing at `raster` and Incomplete.
    pub fn from_rects(raster: &str, rects: impl IntoIterator<Item = WindowRect>) -> MaskResult<Self> {
        let mut index = TileIndex::new();
        for rect in rects {
            index.add(TileDescriptor::new(raster, rect))?;
        }
        Ok(index)
    }

    pub fn load(path: &Path) -> MaskResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MaskError::format(path, None, format!("cannot read tile list: {}", e)))?;
        let mut index = Self::parse(&text, path)?;
        index.path = Some(path.to_path_buf());
        Ok(index)
    }

    /// Validate `text` as a tile list. `source` labels errors.
    pub fn parse(text: &str, source: &Path) -> MaskResult<Self> {
        let table = CsvTable::parse(text, source)?;
        let mut cols = [0usize; 6];
        for (slot, name) in cols.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = table.column(name).ok_or_else(|| {
                MaskError::format(source, Some(1), format!("required column '{}' is missing", name))
            })?;
        }
        let [cy, cx, ch, cw, cf, cp] = cols;

        let mut tiles = Vec::with_capacity(table.records.len());
        let mut seen = HashSet::new();
        for rec in &table.records {
            let field = |i: usize| rec.fields[i].trim();
            let line = Some(rec.line);
            let row = parse_int(field(cy), COL_Y, source, rec)?;
            let col = parse_int(field(cx), COL_X, source, rec)?;
            let height = parse_int(field(ch), COL_HEIGHT, source, rec)?;
            let width = parse_int(field(cw), COL_WIDTH, source, rec)?;
            if height <= 0 || width <= 0 {
                return Err(MaskError::format(
                    source,
                    line,
                    format!("tile size must be positive, got {}x{}", height, width),
                ));
            }
            if row < 0 || col < 0 {
                return Err(MaskError::format(
                    source,
                    line,
                    format!("tile origin must not be negative, got y={} x={}", row, col),
                ));
            }
            let complete = match parse_int(field(cp), COL_PRIORITY, source, rec)? {
                0 => true,
                1 => false,
                other => {
                    return Err(MaskError::format(
                        source,
                        line,
                        format!("priority must be 0 or 1, got {}", other),
                    ));
                }
            };
            let path = field(cf).to_string();
            if path.is_empty() {
                return Err(MaskError::format(source, line, "filename is empty"));
            }
            let rect = WindowRect::new(
                to_u32(row, COL_Y, source, rec)?,
                to_u32(col, COL_X, source, rec)?,
                to_u32(height, COL_HEIGHT, source, rec)?,
                to_u32(width, COL_WIDTH, source, rec)?,
            );
            let extra = table
                .header
                .iter()
                .enumerate()
                .filter(|(i, _)| !cols.contains(i))
                .map(|(i, name)| (name.clone(), rec.fields[i].clone()))
                .collect();
            let tile = TileDescriptor { path, rect, complete, extra };
            if !seen.insert(tile.key()) {
                return Err(MaskError::format(
                    source,
                    line,
                    format!("duplicate tile {} at y={} x={}", tile.path, rect.row, rect.col),
                ));
            }
            tiles.push(tile);
        }

        Ok(Self { columns: table.header, tiles, path: None })
    }

    // ========================================================================
    // ACCESS
    // ========================================================================

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tiles(&self) -> &[TileDescriptor] {
        &self.tiles
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Tile raster path, resolved against the list's directory when relative.
    pub fn resolve_raster(&self, index: usize) -> MaskResult<PathBuf> {
        let tile = self.select_position(index)?;
        let p = PathBuf::from(&tile.path);
        if p.is_absolute() {
            return Ok(p);
        }
        match self.path.as_deref().and_then(Path::parent) {
            Some(dir) => Ok(dir.join(p)),
            None => Ok(p),
        }
    }

    pub fn select_position(&self, index: usize) -> MaskResult<&TileDescriptor> {
        self.tiles.get(index).ok_or_else(|| {
            MaskError::NotFound(format!("tile {} (list has {} tiles)", index + 1, self.tiles.len()))
        })
    }

    /// First tile, in list order, covering the pixel-space point.
    pub fn select_pixel(&self, row: f64, col: f64) -> MaskResult<usize> {
        self.tiles
            .iter()
            .position(|t| t.rect.contains_point(col, row))
            .ok_or_else(|| MaskError::NotFound(format!("no tile covers pixel row={} col={}", row, col)))
    }

    pub fn select_geographic(&self, x: f64, y: f64, transform: &GeoTransform) -> MaskResult<usize> {
        let (col, row) = transform
            .invert(x, y)
            .ok_or_else(|| MaskError::Raster("raster transform is not invertible".into()))?;
        self.select_pixel(row, col)
            .map_err(|_| MaskError::NotFound(format!("no tile covers point ({}, {})", x, y)))
    }

    /// First Incomplete tile after `after` (wrapping), or from the start.
    pub fn next_incomplete(&self, after: Option<usize>) -> Option<usize> {
        let n = self.tiles.len();
        let start = after.map_or(0, |i| i + 1);
        (0..n).map(|k| (start + k) % n).find(|&i| !self.tiles[i].complete)
    }

    /// (complete, incomplete)
    pub fn counts(&self) -> (usize, usize) {
        let done = self.tiles.iter().filter(|t| t.complete).count();
        (done, self.tiles.len() - done)
    }

    /// Pairs of tiles that share area, as in `layout::overlaps`.
    pub fn overlaps(&self) -> Vec<Vec<usize>> {
        let rects: Vec<WindowRect> = self.tiles.iter().map(|t| t.rect).collect();
        layout::overlaps(&rects)
    }

    // ========================================================================
    // MUTATION
    // ========================================================================

    pub fn mark_complete(&mut self, index: usize, complete: bool) -> MaskResult<()> {
        let n = self.tiles.len();
        let tile = self
            .tiles
            .get_mut(index)
            .ok_or_else(|| MaskError::NotFound(format!("tile {} (list has {} tiles)", index + 1, n)))?;
        tile.complete = complete;
        Ok(())
    }

    pub fn add(&mut self, tile: TileDescriptor) -> MaskResult<usize> {
        if self.tiles.iter().any(|t| t.key() == tile.key()) {
            return Err(MaskError::format(
                self.source_name(),
                None,
                format!("duplicate tile {} at y={} x={}", tile.path, tile.rect.row, tile.rect.col),
            ));
        }
        for name in tile.extra.keys() {
            self.ensure_column(name);
        }
        self.tiles.push(tile);
        Ok(self.tiles.len() - 1)
    }

    /// Append an extra column if absent. Existing tiles get an empty value.
    pub fn ensure_column(&mut self, name: &str) {
        if !self.columns.iter().any(|c| c == name) {
            self.columns.push(name.to_string());
        }
    }

    pub fn set_extra(&mut self, index: usize, column: &str, value: impl Into<String>) -> MaskResult<()> {
        if REQUIRED_COLUMNS.contains(&column) {
            return Err(MaskError::format(
                self.source_name(),
                None,
                format!("'{}' is a standard column", column),
            ));
        }
        self.ensure_column(column);
        let n = self.tiles.len();
        let tile = self
            .tiles
            .get_mut(index)
            .ok_or_else(|| MaskError::NotFound(format!("tile {} (list has {} tiles)", index + 1, n)))?;
        tile.extra.insert(column.to_string(), value.into());
        Ok(())
    }

    fn source_name(&self) -> String {
        self.path
            .as_deref()
            .map_or_else(|| "tile list".to_string(), |p| p.display().to_string())
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    pub fn to_csv(&self) -> String {
        let records = self
            .tiles
            .iter()
            .enumerate()
            .map(|(i, t)| CsvRecord {
                line: i + 2,
                fields: self.columns.iter().map(|c| cell(t, c)).collect(),
            })
            .collect();
        CsvTable { header: self.columns.clone(), records }.to_csv()
    }

    /// Write back to the file the index was loaded from.
    pub fn save(&self) -> MaskResult<()> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| MaskError::NotFound("tile list has no file path; use save_as".into()))?;
        write_atomically(&path, &self.to_csv())
    }

    pub fn save_as(&mut self, path: &Path) -> MaskResult<()> {
        write_atomically(path, &self.to_csv())?;
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    /// Replace the in-memory index only if `path` loads cleanly.
    pub fn reload(&mut self, path: &Path) -> MaskResult<()> {
        *self = TileIndex::load(path)?;
        Ok(())
    }
}

fn cell(tile: &TileDescriptor, column: &str) -> String {
    match column {
        COL_FILENAME => tile.path.clone(),
        COL_Y => tile.rect.row.to_string(),
        COL_X => tile.rect.col.to_string(),
        COL_HEIGHT => tile.rect.height.to_string(),
        COL_WIDTH => tile.rect.width.to_string(),
        COL_PRIORITY => tile.priority().to_string(),
        other => tile.extra.get(other).cloned().unwrap_or_default(),
    }
}

/// Integers, also accepting integer-valued decimals such as "12.0".
fn parse_int(text: &str, column: &str, source: &Path, rec: &CsvRecord) -> MaskResult<i64> {
    if let Ok(v) = text.parse::<i64>() {
        return Ok(v);
    }
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Ok(v as i64),
        _ => Err(MaskError::format(
            source,
            Some(rec.line),
            format!("{} must be an integer, got '{}'", column, text),
        )),
    }
}

fn to_u32(v: i64, column: &str, source: &Path, rec: &CsvRecord) -> MaskResult<u32> {
    u32::try_from(v).map_err(|_| {
        MaskError::format(source, Some(rec.line), format!("{} value {} is out of range", column, v))
    })
}

fn write_atomically(path: &Path, content: &str) -> MaskResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, content)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
