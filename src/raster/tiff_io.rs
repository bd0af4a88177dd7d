//! GeoTIFF-backed mask raster. All bands live in one directory as
//! interleaved samples (8 or 16 bit unsigned); georeferencing in the GeoTIFF
//! model tags; CRS keys passed through untouched; band names and the class
//! table in the GDAL metadata tag.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

use crate::error::{MaskError, MaskResult};
use crate::grid::{Band, GeoTransform, GridWindow, PixelType, WindowRect};
use crate::raster::{GeoKeys, MemoryRaster, RasterStore};
use crate::symbology::Symbology;
use crate::{log_info, log_warn};

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_MODEL_TRANSFORMATION: u16 = 34264;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GEO_DOUBLE_PARAMS: u16 = 34736;
const TAG_GEO_ASCII_PARAMS: u16 = 34737;
const TAG_GDAL_METADATA: u16 = 42112;
const TAG_GDAL_NODATA: u16 = 42113;

/// Version 1.1.0, one key: GTRasterTypeGeoKey = RasterPixelIsArea.
const DEFAULT_GEO_KEYS: [u16; 8] = [1, 1, 0, 1, 1025, 0, 1, 1];

/// GDAL metadata item holding the class table JSON.
const CLASS_TABLE_ITEM: &str = "class_table";

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// A GeoTIFF loaded into memory. Writes go to memory and are flushed to
/// disk (temp file, then rename) before returning.
#[derive(Clone, Debug)]
pub struct TiffRaster {
    path: PathBuf,
    inner: MemoryRaster,
}

impl TiffRaster {
    pub fn open(path: &Path) -> MaskResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| MaskError::Raster(format!("cannot open {}: {}", path.display(), e)))?;
        let inner = decode(&bytes).map_err(|e| MaskError::Raster(format!("{}: {}", path.display(), e)))?;
        log_info!(
            "Opened mask {} ({}x{}, {} band(s), {}-bit)",
            path.display(),
            inner.size().0,
            inner.size().1,
            inner.band_count(),
            inner.pixel_type().bits()
        );
        Ok(Self { path: path.to_path_buf(), inner })
    }

    /// Write `raster` to a new file at `path`.
    pub fn create(path: &Path, raster: MemoryRaster) -> MaskResult<Self> {
        let out = Self { path: path.to_path_buf(), inner: raster };
        out.flush()?;
        log_info!("Created mask {}", path.display());
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn memory(&self) -> &MemoryRaster {
        &self.inner
    }

    pub fn flush(&self) -> MaskResult<()> {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let result = File::create(&tmp)
            .map_err(MaskError::from)
            .and_then(|f| {
                let mut w = BufWriter::new(f);
                encode(&self.inner, &mut w)?;
                w.flush()?;
                Ok(())
            })
            .and_then(|_| std::fs::rename(&tmp, &self.path).map_err(MaskError::from));
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(MaskError::Raster(format!("cannot write {}: {}", self.path.display(), e)));
        }
        Ok(())
    }
}

impl RasterStore for TiffRaster {
    fn size(&self) -> (u32, u32) {
        self.inner.size()
    }

    fn band_count(&self) -> usize {
        self.inner.band_count()
    }

    fn band_names(&self) -> Vec<String> {
        self.inner.band_names()
    }

    fn pixel_type(&self) -> PixelType {
        self.inner.pixel_type()
    }

    fn transform(&self) -> GeoTransform {
        self.inner.transform()
    }

    fn read_window(&self, bands: &[usize], rect: WindowRect) -> MaskResult<GridWindow> {
        self.inner.read_window(bands, rect)
    }

    fn write_window(&mut self, bands: &[usize], window: &GridWindow) -> MaskResult<()> {
        let before = self.inner.clone();
        self.inner.write_window(bands, window)?;
        if let Err(e) = self.flush() {
            self.inner = before;
            return Err(e);
        }
        Ok(())
    }

    fn read_symbology(&self) -> MaskResult<Option<Symbology>> {
        self.inner.read_symbology()
    }

    fn write_symbology(&mut self, symbology: &Symbology) -> MaskResult<()> {
        let before = self.inner.clone();
        self.inner.write_symbology(symbology)?;
        if let Err(e) = self.flush() {
            self.inner = before;
            return Err(e);
        }
        Ok(())
    }

    fn geokeys(&self) -> Option<GeoKeys> {
        self.inner.geokeys()
    }
}

// ============================================================================
// REFERENCE GRIDS
// ============================================================================

/// Size and georeferencing of an arbitrary TIFF (an orthophoto, say).
/// Pixel data is never decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceGrid {
    pub height: u32,
    pub width: u32,
    pub transform: GeoTransform,
    pub geokeys: Option<GeoKeys>,
}

pub fn open_reference(path: &Path) -> MaskResult<ReferenceGrid> {
    let file = File::open(path)
        .map_err(|e| MaskError::Raster(format!("cannot open {}: {}", path.display(), e)))?;
    let grid = read_reference(BufReader::new(file))
        .map_err(|e| MaskError::Raster(format!("{}: {}", path.display(), e)))?;
    log_info!("Reference grid {} ({}x{})", path.display(), grid.height, grid.width);
    Ok(grid)
}

fn read_reference<R: Read + Seek>(reader: R) -> MaskResult<ReferenceGrid> {
    let mut decoder = Decoder::new(reader)?;
    let (width, height) = decoder.dimensions()?;
    Ok(ReferenceGrid {
        height,
        width,
        transform: read_transform(&mut decoder)?,
        geokeys: read_geokeys(&mut decoder)?,
    })
}

// ============================================================================
// DECODE
// ============================================================================

/// Sample layout of the first image directory.
#[derive(Debug)]
struct SampleLayout {
    samples: usize,
    pixel_type: PixelType,
    photometric: u16,
    planar: bool,
    compression: u16,
}

impl SampleLayout {
    fn read<R: Read + Seek>(decoder: &mut Decoder<R>) -> MaskResult<Self> {
        let samples = decoder.find_tag_unsigned::<u16>(Tag::SamplesPerPixel)?.unwrap_or(1) as usize;
        let bits = decoder.find_tag_unsigned_vec::<u16>(Tag::BitsPerSample)?.unwrap_or_else(|| vec![1]);
        let pixel_type = match bits.first() {
            Some(8) => PixelType::U8,
            Some(16) => PixelType::U16,
            _ => {
                return Err(MaskError::Raster(format!(
                    "unsupported pixel layout {:?} bits per sample; masks are 8 or 16 bit",
                    bits
                )));
            }
        };
        if let Some(formats) = decoder.find_tag_unsigned_vec::<u16>(Tag::SampleFormat)? {
            if formats.iter().any(|&f| f != 1) {
                return Err(MaskError::Raster("mask samples must be unsigned integers".into()));
            }
        }
        Ok(Self {
            samples,
            pixel_type,
            photometric: decoder.find_tag_unsigned::<u16>(Tag::PhotometricInterpretation)?.unwrap_or(1),
            planar: decoder.find_tag_unsigned::<u16>(Tag::PlanarConfiguration)?.unwrap_or(1) == 2,
            compression: decoder.find_tag_unsigned::<u16>(Tag::Compression)?.unwrap_or(1),
        })
    }

    /// Single-sample grayscale, which the tiff decoder expands itself
    /// (compressed or not).
    fn is_plain_gray(&self) -> bool {
        self.samples == 1 && self.photometric <= 1
    }
}

/// Decode the first image directory; later directories (overviews,
/// transparency masks) are not bands and are skipped.
fn decode(bytes: &[u8]) -> MaskResult<MemoryRaster> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?;
    let (width, height) = decoder.dimensions()?;
    let layout = SampleLayout::read(&mut decoder)?;
    let transform = read_transform(&mut decoder)?;
    let geokeys = read_geokeys(&mut decoder)?;
    let metadata = match decoder.find_tag(tag(TAG_GDAL_METADATA))? {
        Some(v) => parse_metadata(&v.into_string()?),
        None => GdalMetadata::default(),
    };

    let bands = if layout.is_plain_gray() {
        vec![read_gray(&mut decoder, width, height, layout.pixel_type)?]
    } else {
        read_strips(&mut decoder, bytes, width, height, &layout)?
    };

    let names = (0..bands.len())
        .map(|i| {
            metadata
                .band_names
                .get(i)
                .cloned()
                .flatten()
                .unwrap_or_else(|| (i + 1).to_string())
        })
        .collect();
    let grid = GridWindow::new(WindowRect::new(0, 0, height, width), layout.pixel_type, transform, bands, names)?;
    let mut raster = MemoryRaster::new(grid)?;
    raster.set_geokeys(geokeys);
    if let Some(json) = metadata.class_table {
        match Symbology::from_json(&json) {
            Ok(s) => raster.write_symbology(&s)?,
            Err(e) => {
                log_warn!("Ignoring unreadable class table: {}", e);
            }
        }
    }
    Ok(raster)
}

fn read_gray<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    width: u32,
    height: u32,
    pixel_type: PixelType,
) -> MaskResult<Band> {
    let band = match (decoder.read_image()?, pixel_type) {
        (DecodingResult::U8(data), PixelType::U8) => {
            Band::from_raw(width, height, data.into_iter().map(u16::from).collect())
        }
        (DecodingResult::U16(data), PixelType::U16) => Band::from_raw(width, height, data),
        _ => return Err(MaskError::Raster("sample data does not match the declared bit depth".into())),
    };
    band.ok_or_else(|| MaskError::Raster("image data is truncated".into()))
}

/// Uncompressed strips with any sample count or photometric
/// interpretation, chunky or planar. Each sample becomes one band.
fn read_strips<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    bytes: &[u8],
    width: u32,
    height: u32,
    layout: &SampleLayout,
) -> MaskResult<Vec<Band>> {
    if layout.compression != 1 {
        return Err(MaskError::Raster(format!(
            "{}-sample image uses compression {}; only uncompressed multi-sample masks are readable",
            layout.samples, layout.compression
        )));
    }
    if decoder.find_tag(Tag::TileWidth)?.is_some() {
        return Err(MaskError::Raster("tiled multi-sample masks are not supported".into()));
    }
    let offsets = decoder.get_tag_u64_vec(Tag::StripOffsets)?;
    let counts = decoder.get_tag_u64_vec(Tag::StripByteCounts)?;
    let big_endian = bytes.starts_with(b"MM");

    let (w, h) = (width as usize, height as usize);
    let rows_per_strip = decoder
        .find_tag_unsigned::<u32>(Tag::RowsPerStrip)?
        .map_or(h, |r| (r as usize).clamp(1, h));
    let depth = usize::from(layout.pixel_type.bits() / 8);
    let strips_per_plane = h.div_ceil(rows_per_strip);
    let (planes, per_pixel) = if layout.planar { (layout.samples, 1) } else { (1, layout.samples) };
    if offsets.len() < strips_per_plane * planes || counts.len() < offsets.len() {
        return Err(MaskError::Raster(format!(
            "{} strips listed, {} needed",
            offsets.len().min(counts.len()),
            strips_per_plane * planes
        )));
    }

    let mut data = vec![vec![0u16; w * h]; layout.samples];
    for plane in 0..planes {
        for strip in 0..strips_per_plane {
            let idx = plane * strips_per_plane + strip;
            let first_row = strip * rows_per_strip;
            let rows = rows_per_strip.min(h - first_row);
            let len = rows * w * per_pixel * depth;
            let chunk = usize::try_from(offsets[idx])
                .ok()
                .filter(|_| counts[idx] >= len as u64)
                .and_then(|start| bytes.get(start..start.checked_add(len)?))
                .ok_or_else(|| MaskError::Raster(format!("strip {} is truncated", idx + 1)))?;
            let values = chunk.chunks_exact(depth).map(|c| match c {
                [a, b] if big_endian => u16::from_be_bytes([*a, *b]),
                [a, b] => u16::from_le_bytes([*a, *b]),
                [v] => u16::from(*v),
                _ => 0,
            });
            for (i, value) in values.enumerate() {
                let pixel = first_row * w + i / per_pixel;
                let band = if layout.planar { plane } else { i % per_pixel };
                data[band][pixel] = value;
            }
        }
    }
    data.into_iter()
        .map(|d| Band::from_raw(width, height, d).ok_or_else(|| MaskError::Raster("image data is truncated".into())))
        .collect()
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> MaskResult<GeoTransform> {
    if let Some(v) = decoder.find_tag(tag(TAG_MODEL_TRANSFORMATION))? {
        let m = v.into_f64_vec()?;
        if m.len() >= 8 {
            return Ok(GeoTransform([m[3], m[0], m[1], m[7], m[4], m[5]]));
        }
    }
    let scale = decoder.find_tag(tag(TAG_MODEL_PIXEL_SCALE))?;
    let tie = decoder.find_tag(tag(TAG_MODEL_TIEPOINT))?;
    if let (Some(scale), Some(tie)) = (scale, tie) {
        let s = scale.into_f64_vec()?;
        let t = tie.into_f64_vec()?;
        if s.len() >= 2 && t.len() >= 6 {
            let (sx, sy) = (s[0], s[1]);
            return Ok(GeoTransform([t[3] - t[0] * sx, sx, 0.0, t[4] + t[1] * sy, 0.0, -sy]));
        }
    }
    Ok(GeoTransform::identity())
}

fn read_geokeys<R: Read + Seek>(decoder: &mut Decoder<R>) -> MaskResult<Option<GeoKeys>> {
    let Some(directory) = decoder.find_tag_unsigned_vec::<u16>(tag(TAG_GEO_KEY_DIRECTORY))? else {
        return Ok(None);
    };
    let doubles = match decoder.find_tag(tag(TAG_GEO_DOUBLE_PARAMS))? {
        Some(v) => v.into_f64_vec()?,
        None => Vec::new(),
    };
    let ascii = decoder.find_tag(tag(TAG_GEO_ASCII_PARAMS))?.map(|v| v.into_string()).transpose()?;
    Ok(Some(GeoKeys { directory, doubles, ascii }))
}

// ============================================================================
// ENCODE
// ============================================================================

/// Bands interleaved pixel by pixel.
fn interleave<T: Copy + Default + Send>(grid: &GridWindow, convert: impl Fn(u16) -> T + Sync) -> MaskResult<Vec<T>> {
    let bands = (0..grid.band_count())
        .map(|b| grid.band(b).map(|band| band.as_raw().as_slice()))
        .collect::<MaskResult<Vec<_>>>()?;
    let n = bands.len();
    let mut out = vec![T::default(); grid.width() as usize * grid.height() as usize * n];
    out.par_chunks_mut(n).enumerate().for_each(|(p, px)| {
        for (slot, band) in px.iter_mut().zip(&bands) {
            *slot = convert(band[p]);
        }
    });
    Ok(out)
}

fn encode<W: Write + Seek>(raster: &MemoryRaster, out: W) -> MaskResult<()> {
    let grid = raster.grid();
    let (width, height) = (grid.width(), grid.height());
    let samples = grid.band_count();
    let pixel_type = grid.pixel_type();
    let transform = *grid.transform();
    let symbology = raster.read_symbology()?;
    let metadata = GdalMetadata {
        band_names: grid.band_names().iter().cloned().map(Some).collect(),
        class_table: symbology.as_ref().map(|s| s.to_json()).transpose()?,
    };
    let metadata_xml = write_metadata(&metadata);
    let nodata = symbology
        .as_ref()
        .and_then(|s| s.table(0).ok())
        .and_then(|t| t.null_value())
        .map(|v| v.to_string());
    let geokeys = raster.geokeys();
    let too_large = || MaskError::Raster("raster exceeds the 4 GiB classic TIFF limit".into());

    let mut encoder = TiffEncoder::new(out)?;
    let mut dir = encoder.new_directory()?;
    let (offset, byte_count) = match pixel_type {
        PixelType::U8 => {
            let data = interleave(grid, |v| v as u8)?;
            (dir.write_data(&data[..])?, data.len())
        }
        PixelType::U16 => {
            let data = interleave(grid, |v| v)?;
            (dir.write_data(&data[..])?, data.len() * 2)
        }
    };

    dir.write_tag(Tag::ImageWidth, width)?;
    dir.write_tag(Tag::ImageLength, height)?;
    dir.write_tag(Tag::BitsPerSample, &vec![u16::from(pixel_type.bits()); samples][..])?;
    dir.write_tag(Tag::Compression, 1u16)?;
    dir.write_tag(Tag::PhotometricInterpretation, 1u16)?;
    dir.write_tag(Tag::StripOffsets, u32::try_from(offset).map_err(|_| too_large())?)?;
    dir.write_tag(Tag::SamplesPerPixel, u16::try_from(samples).map_err(|_| too_large())?)?;
    dir.write_tag(Tag::RowsPerStrip, height)?;
    dir.write_tag(Tag::StripByteCounts, u32::try_from(byte_count).map_err(|_| too_large())?)?;
    dir.write_tag(Tag::PlanarConfiguration, 1u16)?;
    dir.write_tag(Tag::SampleFormat, &vec![1u16; samples][..])?;
    if samples > 1 {
        // Unspecified extra samples: plain data bands.
        dir.write_tag(Tag::ExtraSamples, &vec![0u16; samples - 1][..])?;
    }

    let c = transform.0;
    if c[2] == 0.0 && c[4] == 0.0 {
        dir.write_tag(tag(TAG_MODEL_PIXEL_SCALE), &[c[1], -c[5], 0.0][..])?;
        dir.write_tag(tag(TAG_MODEL_TIEPOINT), &[0.0, 0.0, 0.0, c[0], c[3], 0.0][..])?;
    } else {
        let m = [
            c[1], c[2], 0.0, c[0], c[4], c[5], 0.0, c[3], 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0,
        ];
        dir.write_tag(tag(TAG_MODEL_TRANSFORMATION), &m[..])?;
    }
    match &geokeys {
        Some(keys) => {
            dir.write_tag(tag(TAG_GEO_KEY_DIRECTORY), &keys.directory[..])?;
            if !keys.doubles.is_empty() {
                dir.write_tag(tag(TAG_GEO_DOUBLE_PARAMS), &keys.doubles[..])?;
            }
            match keys.ascii.as_deref() {
                Some(text) if text.is_ascii() && !text.contains('\0') => {
                    dir.write_tag(tag(TAG_GEO_ASCII_PARAMS), text)?;
                }
                Some(_) => {
                    log_warn!("Dropping non-ASCII GeoAsciiParams");
                }
                None => {}
            }
        }
        None => dir.write_tag(tag(TAG_GEO_KEY_DIRECTORY), &DEFAULT_GEO_KEYS[..])?,
    }
    dir.write_tag(tag(TAG_GDAL_METADATA), metadata_xml.as_str())?;
    if let Some(nodata) = &nodata {
        dir.write_tag(tag(TAG_GDAL_NODATA), nodata.as_str())?;
    }
    dir.finish()?;
    Ok(())
}

// ============================================================================
// GDAL METADATA XML
// ============================================================================

#[derive(Debug, Default, PartialEq)]
struct GdalMetadata {
    band_names: Vec<Option<String>>,
    class_table: Option<String>,
}

fn write_metadata(meta: &GdalMetadata) -> String {
    let mut xml = String::from("<GDALMetadata>");
    if let Some(json) = &meta.class_table {
        xml.push_str(&format!(
            "<Item name=\"{}\">{}</Item>",
            CLASS_TABLE_ITEM,
            xml_escape(&ascii_json(json))
        ));
    }
    for (i, name) in meta.band_names.iter().enumerate() {
        if let Some(name) = name {
            xml.push_str(&format!(
                "<Item name=\"DESCRIPTION\" sample=\"{}\" role=\"description\">{}</Item>",
                i,
                xml_escape(&ascii_text(name))
            ));
        }
    }
    xml.push_str("</GDALMetadata>");
    xml
}

/// Tolerant reader: unknown items are skipped, malformed ones ignored.
fn parse_metadata(xml: &str) -> GdalMetadata {
    let mut meta = GdalMetadata::default();
    let mut rest = xml;
    while let Some(start) = rest.find("<Item") {
        rest = &rest[start + 5..];
        let Some(head_end) = rest.find('>') else { break };
        let head = &rest[..head_end];
        let Some(close) = rest.find("</Item>") else { break };
        if close < head_end {
            break;
        }
        let body = xml_unescape(&rest[head_end + 1..close]);
        rest = &rest[close + 7..];

        match attribute(head, "name").as_deref() {
            Some(CLASS_TABLE_ITEM) => meta.class_table = Some(body),
            Some("DESCRIPTION") => {
                if let Some(i) = attribute(head, "sample").and_then(|s| s.parse::<usize>().ok()) {
                    if meta.band_names.len() <= i {
                        meta.band_names.resize(i + 1, None);
                    }
                    meta.band_names[i] = Some(unescape_text(&body));
                }
            }
            _ => {}
        }
    }
    meta
}

fn attribute(head: &str, name: &str) -> Option<String> {
    let key = format!("{}=\"", name);
    let start = head.find(&key)? + key.len();
    let end = head[start..].find('"')? + start;
    Some(xml_unescape(&head[start..end]))
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// TIFF ASCII tags cannot hold UTF-8; JSON strings survive as \u escapes.
fn ascii_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut buf = [0u16; 2];
            for unit in ch.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Band names use the same escape outside of JSON.
fn ascii_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            c if c.is_ascii() && c != '\0' => out.push(c),
            c => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
        }
    }
    out
}

fn unescape_text(s: &str) -> String {
    let mut units: Vec<u16> = Vec::new();
    let mut out = String::new();
    let mut chars = s.chars().peekable();
    let flush = |units: &mut Vec<u16>, out: &mut String| {
        out.extend(char::decode_utf16(units.drain(..)).map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER)));
    };
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('\\') => {
                    chars.next();
                    flush(&mut units, &mut out);
                    out.push('\\');
                    continue;
                }
                Some('u') => {
                    chars.next();
                    let hex: String = chars.by_ref().take(4).collect();
                    if let Ok(unit) = u16::from_str_radix(&hex, 16) {
                        units.push(unit);
                        continue;
                    }
                    flush(&mut units, &mut out);
                    out.push_str("\\u");
                    out.push_str(&hex);
                    continue;
                }
                _ => {}
            }
        }
        flush(&mut units, &mut out);
        out.push(c);
    }
    flush(&mut units, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use tiff::encoder::colortype;

    fn sample(pixel_type: PixelType, transform: GeoTransform) -> MemoryRaster {
        let mut r = MemoryRaster::filled(
            5,
            7,
            vec!["Landbedeckung".into(), "Qualität".into()],
            pixel_type,
            transform,
            0,
        )
        .unwrap();
        let mut w = r.read_window(&[0, 1], WindowRect::new(1, 2, 2, 3)).unwrap();
        w.set(0, 0, 0, pixel_type.max_value()).unwrap();
        w.set(1, 1, 2, 3).unwrap();
        r.write_window(&[0, 1], &w).unwrap();
        r
    }

    #[test]
    fn round_trip_preserves_bands_transform_and_classes() {
        let dir = tempfile::tempdir().unwrap();
        for (i, pixel_type) in [PixelType::U8, PixelType::U16].into_iter().enumerate() {
            let path = dir.path().join(format!("mask{}.tif", i));
            let transform = GeoTransform::north_up(350000.0, 5800000.0, 0.5, -0.5);
            let mut raster = TiffRaster::create(&path, sample(pixel_type, transform)).unwrap();

            let mut s = Symbology::new(&raster.band_names());
            s.table_mut(0).unwrap().define(1, "Wäldchen dicht", Some(Rgba([0, 100, 0, 255])));
            s.table_mut(0).unwrap().set_null(0);
            raster.write_symbology(&s).unwrap();

            let back = TiffRaster::open(&path).unwrap();
            assert_eq!(back.memory().grid(), raster.memory().grid());
            assert_eq!(back.band_names()[1], "Qualität");
            assert_eq!(back.transform(), transform);
            let sym = back.read_symbology().unwrap().unwrap();
            assert_eq!(sym.table(0).unwrap().label(1), Some("Wäldchen dicht"));
            assert_eq!(sym.table(0).unwrap().null_value(), Some(0));
        }
    }

    #[test]
    fn rotated_transform_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotated.tif");
        let t = GeoTransform([100.0, 0.8, 0.6, 200.0, 0.6, -0.8]);
        TiffRaster::create(&path, sample(PixelType::U8, t)).unwrap();
        assert_eq!(TiffRaster::open(&path).unwrap().transform(), t);
    }

    #[test]
    fn window_writes_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.tif");
        let mut raster = TiffRaster::create(&path, sample(PixelType::U8, GeoTransform::identity())).unwrap();
        let mut w = raster.read_window(&[1], WindowRect::new(4, 6, 1, 1)).unwrap();
        w.set(0, 0, 0, 9).unwrap();
        raster.write_window(&[1], &w).unwrap();
        let back = TiffRaster::open(&path).unwrap();
        assert_eq!(back.memory().grid().get(1, 4, 6), Some(9));
        assert!(!dir.path().join("m.tif.tmp").exists());
    }

    #[test]
    fn missing_file_is_a_raster_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(TiffRaster::open(&dir.path().join("nope.tif")), Err(MaskError::Raster(_))));
    }

    #[test]
    fn geokeys_survive_window_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("utm.tif");
        let keys = GeoKeys {
            directory: vec![1, 1, 0, 3, 1024, 0, 1, 1, 1025, 0, 1, 1, 3072, 0, 1, 32633],
            doubles: vec![6378137.0, 298.257223563],
            ascii: Some("WGS 84 / UTM zone 33N|".into()),
        };
        let mut memory = sample(PixelType::U8, GeoTransform::north_up(350000.0, 5800000.0, 0.5, -0.5));
        memory.set_geokeys(Some(keys.clone()));
        let mut raster = TiffRaster::create(&path, memory).unwrap();
        assert_eq!(TiffRaster::open(&path).unwrap().geokeys(), Some(keys.clone()));

        let mut w = raster.read_window(&[0], WindowRect::new(0, 0, 1, 1)).unwrap();
        w.set(0, 0, 0, 4).unwrap();
        raster.write_window(&[0], &w).unwrap();
        let back = TiffRaster::open(&path).unwrap();
        assert_eq!(back.geokeys(), Some(keys));
        assert_eq!(back.memory().grid().get(0, 0, 0), Some(4));
    }

    #[test]
    fn rasters_without_keys_are_written_as_pixel_is_area() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.tif");
        TiffRaster::create(&path, sample(PixelType::U8, GeoTransform::identity())).unwrap();
        let keys = TiffRaster::open(&path).unwrap().geokeys().unwrap();
        assert_eq!(keys.directory, DEFAULT_GEO_KEYS.to_vec());
        assert!(keys.doubles.is_empty());
        assert_eq!(keys.ascii, None);
    }

    #[test]
    fn bands_are_samples_of_one_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two.tif");
        TiffRaster::create(&path, sample(PixelType::U16, GeoTransform::identity())).unwrap();
        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(decoder.find_tag_unsigned::<u16>(Tag::SamplesPerPixel).unwrap(), Some(2));
        assert_eq!(decoder.find_tag_unsigned_vec::<u16>(Tag::BitsPerSample).unwrap(), Some(vec![16, 16]));
        assert_eq!(decoder.find_tag_unsigned_vec::<u16>(Tag::ExtraSamples).unwrap(), Some(vec![0]));
        assert!(!decoder.more_images());
    }

    /// 4x3 RGB image with pixel bytes 0..36, 2 m pixels, EPSG:25832 keys.
    fn write_rgb(path: &Path) {
        let pixels: Vec<u8> = (0..36).collect();
        let mut encoder = TiffEncoder::new(File::create(path).unwrap()).unwrap();
        let mut image = encoder.new_image::<colortype::RGB8>(4, 3).unwrap();
        let dir = image.encoder();
        dir.write_tag(tag(TAG_MODEL_PIXEL_SCALE), &[2.0, 2.0, 0.0][..]).unwrap();
        dir.write_tag(tag(TAG_MODEL_TIEPOINT), &[0.0, 0.0, 0.0, 1000.0, 2000.0, 0.0][..]).unwrap();
        dir.write_tag(tag(TAG_GEO_KEY_DIRECTORY), &[1u16, 1, 0, 1, 3072, 0, 1, 25832][..]).unwrap();
        image.write_data(&pixels).unwrap();
    }

    #[test]
    fn reference_open_accepts_rgb_orthophotos() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ortho.tif");
        write_rgb(&path);
        let grid = open_reference(&path).unwrap();
        assert_eq!((grid.height, grid.width), (3, 4));
        assert_eq!(grid.transform, GeoTransform::north_up(1000.0, 2000.0, 2.0, 2.0));
        assert_eq!(grid.geokeys.unwrap().directory, vec![1, 1, 0, 1, 3072, 0, 1, 25832]);
    }

    #[test]
    fn new_masks_take_the_reference_grid_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let ortho = dir.path().join("ortho.tif");
        write_rgb(&ortho);
        let reference = open_reference(&ortho).unwrap();
        let memory =
            MemoryRaster::on_reference(&reference, vec!["lc".into(), "q".into()], PixelType::U16, 9).unwrap();
        let path = dir.path().join("mask.tif");
        TiffRaster::create(&path, memory).unwrap();

        let mask = TiffRaster::open(&path).unwrap();
        assert_eq!(mask.size(), (3, 4));
        assert_eq!(mask.pixel_type(), PixelType::U16);
        assert_eq!(mask.transform(), reference.transform);
        assert_eq!(mask.geokeys(), reference.geokeys);
        assert_eq!(mask.memory().grid().unique_values(1).unwrap().into_iter().collect::<Vec<_>>(), vec![9]);
        assert_eq!(mask.read_symbology().unwrap().unwrap().table(1).unwrap().null_value(), Some(9));
    }

    #[test]
    fn chunky_multi_sample_files_read_as_bands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("three.tif");
        write_rgb(&path);
        let raster = TiffRaster::open(&path).unwrap();
        assert_eq!(raster.band_names(), vec!["1", "2", "3"]);
        let grid = raster.memory().grid();
        // pixel (row 1, col 2) starts at byte (1 * 4 + 2) * 3
        assert_eq!(grid.get(0, 1, 2), Some(18));
        assert_eq!(grid.get(2, 1, 2), Some(20));
        assert_eq!(grid.get(2, 2, 3), Some(35));
    }

    #[test]
    fn planar_multi_sample_files_read_as_bands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planar.tif");
        let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
        let mut d = encoder.new_directory().unwrap();
        let first = d.write_data(&[1u8, 2, 3, 4, 5, 6][..]).unwrap() as u32;
        let second = d.write_data(&[7u8, 8, 9, 10, 11, 12][..]).unwrap() as u32;
        d.write_tag(Tag::ImageWidth, 3u32).unwrap();
        d.write_tag(Tag::ImageLength, 2u32).unwrap();
        d.write_tag(Tag::BitsPerSample, &[8u16, 8][..]).unwrap();
        d.write_tag(Tag::Compression, 1u16).unwrap();
        d.write_tag(Tag::PhotometricInterpretation, 1u16).unwrap();
        d.write_tag(Tag::StripOffsets, &[first, second][..]).unwrap();
        d.write_tag(Tag::SamplesPerPixel, 2u16).unwrap();
        d.write_tag(Tag::RowsPerStrip, 2u32).unwrap();
        d.write_tag(Tag::StripByteCounts, &[6u32, 6][..]).unwrap();
        d.write_tag(Tag::PlanarConfiguration, 2u16).unwrap();
        d.finish().unwrap();
        drop(encoder);

        let raster = TiffRaster::open(&path).unwrap();
        let grid = raster.memory().grid();
        assert_eq!(grid.band_count(), 2);
        assert_eq!(grid.get(0, 1, 2), Some(6));
        assert_eq!(grid.get(1, 0, 0), Some(7));
        assert_eq!(grid.get(1, 1, 2), Some(12));
    }

    #[test]
    fn metadata_escaping_round_trips() {
        let meta = GdalMetadata {
            band_names: vec![Some("a<b> & \"c\" \\ é".into()), None, Some("third".into())],
            class_table: Some("{\"k\":\"<ü>\"}".into()),
        };
        let xml = write_metadata(&meta);
        assert!(xml.is_ascii());
        let back = parse_metadata(&xml);
        assert_eq!(back.band_names, meta.band_names);
        let json: serde_json::Value = serde_json::from_str(back.class_table.as_deref().unwrap()).unwrap();
        assert_eq!(json["k"], "<ü>");
    }
}
