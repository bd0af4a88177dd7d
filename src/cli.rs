// ============================================================================
// MaskTile CLI: headless tile-list and mask processing
// ============================================================================
//
// Usage examples:
//   masktile tiles --mask mask.tif --reference ortho.tif --output tiles.csv
//   masktile check "surveys/*.csv"
//   masktile polygons --tiles tiles.csv --tile 3 --output tile3.geojson
//   masktile paint --tiles tiles.csv --tile 3 --ops strokes.json --complete
//   masktile complete --tiles tiles.csv --tile 3 --incomplete
//   masktile classes --raster mask.tif --remove-larger 20 --yes
//   masktile merge --a-tiles a.csv --a-raster a.tif --b-tiles b.csv --b-raster b.tif \
//                  --out-tiles m.csv --out-raster m.tif
//
// Everything runs synchronously on the current thread. Rasters and tile lists
// are only written after the whole command succeeded.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};

use crate::geometry::{Point, ValuedPolygon};
use crate::grid::{GeoTransform, PixelType, WindowRect};
use crate::ops::edit::EditOperation;
use crate::ops::merge::{MergeInput, merge};
use crate::ops::synthesize::Connectivity;
use crate::raster::{MemoryRaster, RasterStore, TiffRaster, open_reference};
use crate::session::{EditSession, SessionOptions};
use crate::settings::Settings;
use crate::symbology::{RemovalCriterion, Symbology, color_to_hex};
use crate::tiles::TileIndex;
use crate::tiles::layout::{GridLayout, overlaps, retain_inside};
use crate::vector::FeatureCollection;
use crate::{log_err, log_info, logger};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// MaskTile: tiled categorical mask editing without a map canvas.
#[derive(Parser, Debug)]
#[command(
    name = "masktile",
    about = "Tile lists, mask edits and mask merges for categorical rasters",
    long_about = "Generate tile lists over a mask raster, apply recorded edit\n\
                  operations to single tiles, track tile completion and merge\n\
                  two masks edited by different people.\n\n\
                  Example:\n  \
                  masktile tiles --mask mask.tif --reference ortho.tif --output tiles.csv\n  \
                  masktile merge --a-tiles a.csv --a-raster a.tif --b-tiles b.csv --b-raster b.tif \\\n    \
                  --out-tiles m.csv --out-raster m.tif"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Settings file (default: the per-user settings location).
    #[arg(long, global = true, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Null (unclassified) value, overriding settings and symbology.
    #[arg(long, global = true, value_name = "VALUE")]
    pub null_value: Option<u16>,

    /// Region connectivity: 4 or 8.
    #[arg(long, global = true, value_name = "4|8")]
    pub connectivity: Option<u8>,

    /// Print per-item detail and timing.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a regular tile list over a mask raster.
    Tiles(TilesArgs),
    /// Validate tile lists and report their completion state.
    Check(CheckArgs),
    /// Export the regions of one tile as GeoJSON.
    Polygons(PolygonsArgs),
    /// Render one tile's classes to a PNG image.
    Preview(PreviewArgs),
    /// Apply recorded edit operations to one tile and save it.
    Paint(PaintArgs),
    /// Mark one tile complete or incomplete.
    Complete(CompleteArgs),
    /// List or remove class definitions of a mask.
    Classes(ClassesArgs),
    /// Merge two (tile list, mask) pairs into a third.
    Merge(MergeArgs),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Tiles(_) => "tiles",
            Command::Check(_) => "check",
            Command::Polygons(_) => "polygons",
            Command::Preview(_) => "preview",
            Command::Paint(_) => "paint",
            Command::Complete(_) => "complete",
            Command::Classes(_) => "classes",
            Command::Merge(_) => "merge",
        }
    }
}

#[derive(Args, Debug)]
pub struct TilesArgs {
    /// Mask raster. Created from --reference when it does not exist.
    #[arg(long, value_name = "MASK.tif")]
    pub mask: PathBuf,

    /// Raster whose pixel grid a new mask inherits.
    #[arg(long, value_name = "REF.tif")]
    pub reference: Option<PathBuf>,

    /// Band names of a new mask.
    #[arg(long, num_args = 1.., default_value = "classes")]
    pub bands: Vec<String>,

    /// Create a new mask with 16-bit pixels.
    #[arg(long)]
    pub u16: bool,

    /// Output tile list (CSV).
    #[arg(short, long, value_name = "FILE.csv")]
    pub output: PathBuf,

    #[arg(long)]
    pub tile_height: Option<u32>,

    #[arg(long)]
    pub tile_width: Option<u32>,

    /// Overlap between neighbouring tiles in percent.
    #[arg(long)]
    pub overlap: Option<f64>,

    /// Keep only tiles whose centre lies in one of these polygons.
    #[arg(long, value_name = "AREA.geojson")]
    pub inside: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Tile list(s). Glob patterns accepted.
    #[arg(required = true, num_args = 1..)]
    pub input: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TileArgs {
    /// Tile list (CSV).
    #[arg(long, value_name = "FILE.csv")]
    pub tiles: PathBuf,

    /// 1-based tile position. Defaults to the first incomplete tile.
    #[arg(long)]
    pub tile: Option<usize>,

    /// 1-based band number.
    #[arg(long, default_value_t = 1)]
    pub band: usize,
}

#[derive(Args, Debug)]
pub struct PolygonsArgs {
    #[command(flatten)]
    pub tile: TileArgs,

    /// Output GeoJSON file.
    #[arg(short, long, value_name = "FILE.geojson")]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct PreviewArgs {
    #[command(flatten)]
    pub tile: TileArgs,

    /// Output PNG file.
    #[arg(short, long, value_name = "FILE.png")]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct PaintArgs {
    #[command(flatten)]
    pub tile: TileArgs,

    /// JSON array of edit operations, or a GeoJSON feature collection
    /// drawn as polygons.
    #[arg(long, value_name = "FILE.json")]
    pub ops: PathBuf,

    /// Mark the tile complete after saving.
    #[arg(long)]
    pub complete: bool,
}

#[derive(Args, Debug)]
pub struct CompleteArgs {
    #[command(flatten)]
    pub tile: TileArgs,

    /// Mark incomplete instead.
    #[arg(long)]
    pub incomplete: bool,
}

#[derive(Args, Debug)]
pub struct ClassesArgs {
    #[arg(long, value_name = "MASK.tif")]
    pub raster: PathBuf,

    #[arg(long, default_value_t = 1)]
    pub band: usize,

    #[arg(long, value_name = "VALUE", conflicts_with_all = ["remove_smaller", "remove_absent"])]
    pub remove_larger: Option<u16>,

    #[arg(long, value_name = "VALUE", conflicts_with = "remove_absent")]
    pub remove_smaller: Option<u16>,

    /// Remove classes no pixel of the band carries.
    #[arg(long)]
    pub remove_absent: bool,

    /// Apply the removal. Without it only the warning is printed.
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    #[arg(long)]
    pub a_tiles: PathBuf,
    #[arg(long)]
    pub a_raster: PathBuf,
    #[arg(long)]
    pub b_tiles: PathBuf,
    #[arg(long)]
    pub b_raster: PathBuf,
    #[arg(long)]
    pub out_tiles: PathBuf,
    #[arg(long)]
    pub out_raster: PathBuf,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run one command and return an OS exit code (0 success, 1 failure).
pub fn run(args: CliArgs) -> ExitCode {
    let settings = effective_settings(&args);
    let start = Instant::now();
    let result = match &args.command {
        Command::Tiles(a) => run_tiles(a, &settings),
        Command::Check(a) => run_check(a, args.verbose),
        Command::Polygons(a) => run_polygons(a, &settings),
        Command::Preview(a) => run_preview(a, &settings),
        Command::Paint(a) => run_paint(a, &settings),
        Command::Complete(a) => run_complete(a),
        Command::Classes(a) => run_classes(a),
        Command::Merge(a) => run_merge(a),
    };
    match result {
        Ok(()) => {
            if args.verbose {
                println!("done ({:.0}ms)", start.elapsed().as_secs_f64() * 1000.0);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log_err!("{} failed: {}", args.command.name(), e);
            eprintln!("error: {}", e);
            if let Some(path) = logger::log_path() {
                eprintln!("run log: {}", path.display());
            }
            ExitCode::FAILURE
        }
    }
}

fn effective_settings(args: &CliArgs) -> Settings {
    let mut settings = match &args.settings {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    if args.null_value.is_some() {
        settings.null_value = args.null_value;
    }
    match args.connectivity {
        Some(4) => settings.connectivity = Connectivity::Four,
        Some(8) => settings.connectivity = Connectivity::Eight,
        Some(other) => eprintln!("warning: connectivity {} ignored, use 4 or 8.", other),
        None => {}
    }
    settings
}

// ============================================================================
// Commands
// ============================================================================

fn run_tiles(args: &TilesArgs, settings: &Settings) -> Result<(), String> {
    let mask = if args.mask.exists() {
        TiffRaster::open(&args.mask).map_err(|e| e.to_string())?
    } else {
        let reference = args
            .reference
            .as_deref()
            .ok_or_else(|| format!("'{}' does not exist and no --reference was given", args.mask.display()))?;
        let reference = open_reference(reference).map_err(|e| e.to_string())?;
        let pixel_type = if args.u16 { PixelType::U16 } else { PixelType::U8 };
        let null = settings.null_value.unwrap_or(0);
        let raster = MemoryRaster::on_reference(&reference, args.bands.clone(), pixel_type, null)
            .map_err(|e| e.to_string())?;
        let created = TiffRaster::create(&args.mask, raster).map_err(|e| e.to_string())?;
        println!(
            "created {} ({}x{}, {} band(s))",
            args.mask.display(),
            reference.height,
            reference.width,
            args.bands.len()
        );
        created
    };

    let layout = GridLayout::new(
        mask.full_rect(),
        args.tile_height.unwrap_or(settings.tile_height),
        args.tile_width.unwrap_or(settings.tile_width),
        args.overlap.unwrap_or(settings.overlap_percent),
    );
    let mut rects = layout.rects().map_err(|e| e.to_string())?;
    if let Some(area) = &args.inside {
        rects = tiles_inside(rects, area, &mask.transform())?;
    }
    let raster_name = relative_to(&args.mask, &args.output);
    let mut index = TileIndex::from_rects(&raster_name, rects).map_err(|e| e.to_string())?;
    index.save_as(&args.output).map_err(|e| e.to_string())?;
    println!("{} tiles written to {}", index.len(), args.output.display());
    Ok(())
}

fn run_check(args: &CheckArgs, verbose: bool) -> Result<(), String> {
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        return Err("no tile lists matched the given pattern(s)".into());
    }
    let mut failed = 0;
    for path in &inputs {
        match TileIndex::load(path) {
            Ok(index) => {
                let (done, open) = index.counts();
                println!("{}: {} tiles, {} complete, {} incomplete", path.display(), index.len(), done, open);
                if verbose {
                    let rects: Vec<_> = index.tiles().iter().map(|t| t.rect).collect();
                    let overlapping = overlaps(&rects).iter().filter(|o| !o.is_empty()).count();
                    println!("  {} tiles overlap a neighbour", overlapping);
                    if let Some(next) = index.next_incomplete(None) {
                        println!("  next incomplete: tile {}", next + 1);
                    }
                }
            }
            Err(e) => {
                eprintln!("{}: {}", path.display(), e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(format!("{} of {} tile list(s) failed validation", failed, inputs.len()));
    }
    Ok(())
}

fn run_polygons(args: &PolygonsArgs, settings: &Settings) -> Result<(), String> {
    let mut session = open_session(&args.tile, settings)?;
    let synthesis = session.regions().map_err(|e| e.to_string())?;
    if let Some(warning) = &synthesis.warning {
        eprintln!("warning: {}", warning);
    }
    let fc = FeatureCollection::from_polygons(&synthesis.regions);
    fc.save(&args.output).map_err(|e| e.to_string())?;
    println!("{} regions written to {}", fc.len(), args.output.display());
    Ok(())
}

fn run_preview(args: &PreviewArgs, settings: &Settings) -> Result<(), String> {
    let session = open_session(&args.tile, settings)?;
    session.save_preview(&args.output).map_err(|e| e.to_string())?;
    let window = session.window().map_err(|e| e.to_string())?;
    println!("{}x{} preview written to {}", window.height(), window.width(), args.output.display());
    Ok(())
}

fn run_paint(args: &PaintArgs, settings: &Settings) -> Result<(), String> {
    let ops = read_operations(&args.ops)?;
    let mut session = open_session(&args.tile, settings)?;
    let mut changed = 0;
    for (i, op) in ops.iter().enumerate() {
        changed += session
            .apply(op)
            .map_err(|e| format!("operation {} ({}): {}", i + 1, op.name(), e))?;
    }
    session.save().map_err(|e| e.to_string())?;
    session
        .close(args.complete.then_some(true))
        .map_err(|e| e.to_string())?;
    println!("{} operation(s), {} cell(s) changed", ops.len(), changed);
    Ok(())
}

fn run_complete(args: &CompleteArgs) -> Result<(), String> {
    let mut index = TileIndex::load(&args.tile.tiles).map_err(|e| e.to_string())?;
    let tile = pick_tile(&index, args.tile.tile)?;
    index.mark_complete(tile, !args.incomplete).map_err(|e| e.to_string())?;
    index.save().map_err(|e| e.to_string())?;
    let (done, open) = index.counts();
    log_info!("Tile {} marked {}", tile + 1, if args.incomplete { "incomplete" } else { "complete" });
    println!("tile {} updated ({} complete, {} incomplete)", tile + 1, done, open);
    Ok(())
}

fn run_classes(args: &ClassesArgs) -> Result<(), String> {
    let mut raster = TiffRaster::open(&args.raster).map_err(|e| e.to_string())?;
    let names = raster.band_names();
    let mut symbology = raster
        .read_symbology()
        .map_err(|e| e.to_string())?
        .unwrap_or_else(|| Symbology::new(&names))
        .aligned_to(&names);
    let band = band_index(args.band, raster.band_count())?;
    let present = raster
        .read_window(&[band], raster.full_rect())
        .and_then(|w| w.unique_values(0))
        .map_err(|e| e.to_string())?;

    let criterion = match (args.remove_larger, args.remove_smaller, args.remove_absent) {
        (Some(v), _, _) => Some(RemovalCriterion::LargerThan(v)),
        (_, Some(v), _) => Some(RemovalCriterion::SmallerThan(v)),
        (_, _, true) => Some(RemovalCriterion::Absent(present.clone())),
        _ => None,
    };

    let Some(criterion) = criterion else {
        let table = symbology.table(band).map_err(|e| e.to_string())?;
        for value in table.values() {
            println!(
                "{:>5}  {}  {}{}{}",
                value,
                color_to_hex(table.color(value)),
                table.label(value).unwrap_or(""),
                if table.null_value() == Some(value) { "  [null]" } else { "" },
                if present.contains(&value) { "" } else { "  (unused)" },
            );
        }
        return Ok(());
    };

    let plan = symbology.plan_removal(band, &criterion, &present).map_err(|e| e.to_string())?;
    println!("{}", plan.warning);
    if !args.yes {
        println!("nothing removed; pass --yes to apply");
        return Ok(());
    }
    let removed = symbology.apply_removal(plan).map_err(|e| e.to_string())?;
    raster.write_symbology(&symbology).map_err(|e| e.to_string())?;
    println!("{} class definition(s) removed", removed);
    Ok(())
}

fn run_merge(args: &MergeArgs) -> Result<(), String> {
    let a_tiles = TileIndex::load(&args.a_tiles).map_err(|e| e.to_string())?;
    let b_tiles = TileIndex::load(&args.b_tiles).map_err(|e| e.to_string())?;
    let a_raster = TiffRaster::open(&args.a_raster).map_err(|e| e.to_string())?;
    let b_raster = TiffRaster::open(&args.b_raster).map_err(|e| e.to_string())?;

    let raster_name = relative_to(&args.out_raster, &args.out_tiles);
    let out = merge(
        MergeInput { tiles: &a_tiles, raster: &a_raster },
        MergeInput { tiles: &b_tiles, raster: &b_raster },
        &raster_name,
    )
    .map_err(|e| e.to_string())?;

    TiffRaster::create(&args.out_raster, out.raster).map_err(|e| e.to_string())?;
    let mut tiles = out.tiles;
    tiles.save_as(&args.out_tiles).map_err(|e| e.to_string())?;
    println!(
        "{} tiles ({} from A, {} from B, {} overlapping), {} cell(s) taken from B",
        tiles.len(),
        out.stats.from_a,
        out.stats.from_b,
        out.stats.overlapping,
        out.stats.cells_from_b
    );
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn open_session(args: &TileArgs, settings: &Settings) -> Result<EditSession<TiffRaster>, String> {
    let index = TileIndex::load(&args.tiles).map_err(|e| e.to_string())?;
    let tile = pick_tile(&index, args.tile)?;
    let raster_path = index.resolve_raster(tile).map_err(|e| e.to_string())?;
    let raster = TiffRaster::open(&raster_path).map_err(|e| e.to_string())?;
    let band = band_index(args.band, raster.band_count())?;
    let mut session = EditSession::new(raster, index, SessionOptions::from(settings)).map_err(|e| e.to_string())?;
    session.activate(tile, band).map_err(|e| e.to_string())?;
    Ok(session)
}

/// Tiles with their centre in any polygon of a GeoJSON file.
fn tiles_inside(rects: Vec<WindowRect>, area: &Path, transform: &GeoTransform) -> Result<Vec<WindowRect>, String> {
    let polygons = FeatureCollection::load(area)
        .and_then(|fc| fc.to_polygons())
        .map_err(|e| format!("'{}': {}", area.display(), e))?;
    let mut keep: Vec<WindowRect> = Vec::new();
    for p in &polygons {
        let mut inverted = true;
        let pixel = p.polygon.map_points(|pt| match transform.invert(pt.x, pt.y) {
            Some((col, row)) => Point::new(col, row),
            None => {
                inverted = false;
                pt
            }
        });
        if !inverted {
            return Err("mask transform is not invertible".into());
        }
        for r in retain_inside(rects.clone(), &pixel) {
            if !keep.contains(&r) {
                keep.push(r);
            }
        }
    }
    keep.sort_by_key(|r| (r.row, r.col));
    Ok(keep)
}

/// 1-based `--tile`, or the first incomplete tile.
fn pick_tile(index: &TileIndex, tile: Option<usize>) -> Result<usize, String> {
    match tile {
        Some(0) => Err("tile positions start at 1".into()),
        Some(n) if n > index.len() => Err(format!("tile {} (list has {} tiles)", n, index.len())),
        Some(n) => Ok(n - 1),
        None => index
            .next_incomplete(None)
            .ok_or_else(|| "every tile is already complete".to_string()),
    }
}

fn band_index(band: usize, count: usize) -> Result<usize, String> {
    if band == 0 || band > count {
        return Err(format!("band {} (raster has {})", band, count));
    }
    Ok(band - 1)
}

/// Edit operations as a JSON array, or polygons from a GeoJSON collection.
fn read_operations(path: &Path) -> Result<Vec<EditOperation>, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    if let Ok(ops) = serde_json::from_str::<Vec<EditOperation>>(&text) {
        return Ok(ops);
    }
    let polygons: Vec<ValuedPolygon> = FeatureCollection::from_json(&text)
        .and_then(|fc| fc.to_polygons())
        .map_err(|e| format!("'{}' is neither an operation list nor GeoJSON: {}", path.display(), e))?;
    Ok(polygons
        .into_iter()
        .map(|p| EditOperation::PolygonDraw { polygon: p.polygon, value: p.value })
        .collect())
}

/// `target` as written into a tile list stored at `list`: a bare file name
/// when both share a directory, else an absolute path.
fn relative_to(target: &Path, list: &Path) -> String {
    let same_dir = target.parent().unwrap_or(Path::new("")) == list.parent().unwrap_or(Path::new(""));
    match (same_dir, target.file_name()) {
        (true, Some(name)) => name.to_string_lossy().into_owned(),
        _ => std::path::absolute(target)
            .unwrap_or_else(|_| target.to_path_buf())
            .to_string_lossy()
            .into_owned(),
    }
}

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}
