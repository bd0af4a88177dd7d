// ============================================================================
// MASK MERGE: two (tile list, raster) pairs -> one
// ============================================================================
//
// Mask A is the base. Cells of tiles completed only in B are taken from B,
// except where a tile completed in A also covers them. Tiles are matched
// between the lists by their rectangle.

use std::collections::{BTreeSet, HashMap};

use rayon::prelude::*;

use crate::error::{MaskError, MaskResult};
use crate::grid::{Band, GridWindow, WindowRect};
use crate::raster::{MemoryRaster, RasterStore};
use crate::symbology::Symbology;
use crate::tiles::{TileDescriptor, TileIndex};
use crate::{log_info, log_warn};

/// Extra column: the tile was completed in both lists, or completed in one
/// and overlapping a tile completed in the other.
pub const COL_OVERLAP: &str = "overlap";
/// Extra column: 1 = values from A, 2 = from B, -1 = completed in neither.
pub const COL_TILE_LIST: &str = "tile_list";

/// One input pair.
pub struct MergeInput<'a> {
    pub tiles: &'a TileIndex,
    pub raster: &'a dyn RasterStore,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub from_a: usize,
    pub from_b: usize,
    pub overlapping: usize,
    pub cells_from_b: u64,
}

#[derive(Clone, Debug)]
pub struct MergeOutput {
    pub tiles: TileIndex,
    pub raster: MemoryRaster,
    pub stats: MergeStats,
}

/// Merge `b` into `a`. `raster_name` becomes every output tile's filename.
pub fn merge(a: MergeInput<'_>, b: MergeInput<'_>, raster_name: &str) -> MaskResult<MergeOutput> {
    check_compatible(a.raster, b.raster)?;

    let plan = plan_tiles(a.tiles, b.tiles, raster_name)?;
    let grid_a = a.raster.read_all()?;
    let grid_b = b.raster.read_all()?;
    let (height, width) = a.raster.size();

    let a_complete: Vec<WindowRect> = complete_rects(a.tiles);
    let b_only: Vec<WindowRect> = complete_rects(b.tiles)
        .into_iter()
        .filter(|r| !a_complete.contains(r))
        .collect();
    let take_b = selection_mask(height, width, &b_only, &a_complete);
    let cells_from_b = take_b.iter().filter(|&&t| t).count() as u64;

    let band_names = merged_band_names(&a.raster.band_names(), &b.raster.band_names());
    let bands = (0..grid_a.band_count())
        .map(|i| composite(grid_a.band(i)?, grid_b.band(i)?, &take_b))
        .collect::<MaskResult<Vec<Band>>>()?;
    let grid = GridWindow::new(
        WindowRect::new(0, 0, height, width),
        grid_a.pixel_type(),
        *grid_a.transform(),
        bands,
        band_names.clone(),
    )?;

    let present: Vec<BTreeSet<u16>> = (0..grid.band_count())
        .map(|i| grid.unique_values(i))
        .collect::<MaskResult<_>>()?;
    let sym_a = a.raster.read_symbology()?.unwrap_or_else(|| Symbology::new(&a.raster.band_names()));
    let sym_b = b.raster.read_symbology()?.unwrap_or_else(|| Symbology::new(&b.raster.band_names()));
    let symbology = Symbology::merge(
        &sym_a.aligned_to(&a.raster.band_names()),
        &sym_b.aligned_to(&b.raster.band_names()),
        &band_names,
        &present,
    );

    let mut raster = MemoryRaster::new(grid)?;
    raster.write_symbology(&symbology)?;
    raster.set_geokeys(a.raster.geokeys().or_else(|| b.raster.geokeys()));

    let stats = MergeStats { cells_from_b, ..plan.stats };
    log_info!(
        "Merged masks: {} tile(s) from A, {} from B, {} overlapping, {} cell(s) taken from B",
        stats.from_a,
        stats.from_b,
        stats.overlapping,
        stats.cells_from_b
    );
    Ok(MergeOutput { tiles: plan.tiles, raster, stats })
}

fn check_compatible(a: &dyn RasterStore, b: &dyn RasterStore) -> MaskResult<()> {
    let fail = |msg: String| Err(MaskError::format("merge inputs", None, msg));
    if a.size() != b.size() {
        return fail(format!(
            "mask sizes differ: {}x{} vs {}x{}",
            a.size().0,
            a.size().1,
            b.size().0,
            b.size().1
        ));
    }
    if a.band_count() != b.band_count() {
        return fail(format!("band counts differ: {} vs {}", a.band_count(), b.band_count()));
    }
    if a.pixel_type() != b.pixel_type() {
        return fail(format!("pixel types differ: {:?} vs {:?}", a.pixel_type(), b.pixel_type()));
    }
    if a.transform() != b.transform() {
        log_warn!("Merge inputs have different transforms; keeping the first mask's");
    }
    Ok(())
}

fn complete_rects(index: &TileIndex) -> Vec<WindowRect> {
    index.tiles().iter().filter(|t| t.complete).map(|t| t.rect).collect()
}

/// `true` where the output takes B: painted by B-only tiles, then cleared
/// by A's completed tiles. Tiles are clipped to the raster.
fn selection_mask(height: u32, width: u32, b_only: &[WindowRect], a_complete: &[WindowRect]) -> Vec<bool> {
    let mut mask = vec![false; height as usize * width as usize];
    let full = WindowRect::new(0, 0, height, width);
    let mut paint = |rect: &WindowRect, value: bool| {
        if let Some(r) = rect.intersection(&full) {
            for row in r.row..r.row + r.height {
                let start = row as usize * width as usize + r.col as usize;
                mask[start..start + r.width as usize].fill(value);
            }
        } else {
            log_warn!("Tile at y={} x={} lies outside the mask", rect.row, rect.col);
        }
    };
    for r in b_only {
        paint(r, true);
    }
    for r in a_complete {
        paint(r, false);
    }
    mask
}

fn composite(a: &Band, b: &Band, take_b: &[bool]) -> MaskResult<Band> {
    let (width, height) = a.dimensions();
    let stride = width as usize;
    let (src_a, src_b) = (a.as_raw(), b.as_raw());
    let mut out = vec![0u16; src_a.len()];
    if stride > 0 {
        out.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
            let base = y * stride;
            for (x, px) in row.iter_mut().enumerate() {
                let i = base + x;
                *px = if take_b[i] { src_b[i] } else { src_a[i] };
            }
        });
    }
    Band::from_raw(width, height, out).ok_or_else(|| MaskError::Raster("merged band has the wrong size".into()))
}

/// A's name per band unless empty, then B's, then the 1-based index.
pub fn merged_band_names(a: &[String], b: &[String]) -> Vec<String> {
    (0..a.len().max(b.len()))
        .map(|i| {
            [a.get(i), b.get(i)]
                .into_iter()
                .flatten()
                .find(|n| !n.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| (i + 1).to_string())
        })
        .collect()
}

// ============================================================================
// OUTPUT TILE LIST
// ============================================================================

struct TilePlan {
    tiles: TileIndex,
    stats: MergeStats,
}

fn plan_tiles(a: &TileIndex, b: &TileIndex, raster_name: &str) -> MaskResult<TilePlan> {
    let mut by_rect: HashMap<WindowRect, usize> = HashMap::new();
    for (i, t) in b.tiles().iter().enumerate() {
        by_rect.entry(t.rect).or_insert(i);
    }

    // (descriptor, complete in A, complete in B)
    let mut rows: Vec<(TileDescriptor, bool, bool)> = Vec::with_capacity(a.len());
    let mut matched_b = vec![false; b.len()];
    for ta in a.tiles() {
        let tb = by_rect.get(&ta.rect).map(|&j| {
            matched_b[j] = true;
            &b.tiles()[j]
        });
        let complete_b = tb.is_some_and(|t| t.complete);
        let mut tile = ta.clone();
        if let Some(tb) = tb {
            for (k, v) in &tb.extra {
                let shared = a.columns().contains(k);
                if !shared || (complete_b && !ta.complete) {
                    tile.extra.insert(k.clone(), v.clone());
                }
            }
        }
        rows.push((tile, ta.complete, complete_b));
    }
    for (j, tb) in b.tiles().iter().enumerate() {
        if !matched_b[j] && by_rect.get(&tb.rect) == Some(&j) {
            rows.push((tb.clone(), false, tb.complete));
        }
    }

    let rects: Vec<WindowRect> = rows.iter().map(|(t, _, _)| t.rect).collect();
    let neighbours = crate::tiles::layout::overlaps(&rects);

    let mut columns: Vec<String> = a.columns().to_vec();
    for c in b.columns() {
        if !columns.contains(c) {
            columns.push(c.clone());
        }
    }
    columns.retain(|c| c != COL_OVERLAP && c != COL_TILE_LIST);
    columns.push(COL_OVERLAP.to_string());
    columns.push(COL_TILE_LIST.to_string());
    let mut out = TileIndex::with_columns(&columns);

    let mut stats = MergeStats::default();
    for (i, (mut tile, in_a, in_b)) in rows.clone().into_iter().enumerate() {
        let overlap = (in_a && in_b)
            || (in_a && neighbours[i].iter().any(|&j| rows[j].2))
            || (in_b && !in_a && neighbours[i].iter().any(|&j| rows[j].1));
        let source = if in_a {
            stats.from_a += 1;
            1
        } else if in_b {
            stats.from_b += 1;
            2
        } else {
            -1
        };
        if overlap {
            stats.overlapping += 1;
        }
        tile.path = raster_name.to_string();
        tile.complete = in_a || in_b;
        tile.extra.insert(COL_OVERLAP.to_string(), if overlap { "True" } else { "False" }.to_string());
        tile.extra.insert(COL_TILE_LIST.to_string(), source.to_string());
        out.add(tile)?;
    }
    Ok(TilePlan { tiles: out, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GeoTransform, PixelType};
    use crate::raster::GeoKeys;
    use std::path::Path;

    fn raster(fill: u16, names: &[&str]) -> MemoryRaster {
        sized(10, fill, names)
    }

    fn sized(side: u32, fill: u16, names: &[&str]) -> MemoryRaster {
        MemoryRaster::filled(
            side,
            side,
            names.iter().map(|s| s.to_string()).collect(),
            PixelType::U8,
            GeoTransform::identity(),
            fill,
        )
        .unwrap()
    }

    fn list(text: &str) -> TileIndex {
        TileIndex::parse(text, Path::new("list.csv")).unwrap()
    }

    #[test]
    fn completed_tiles_pick_their_source_and_a_wins_ties() {
        let a_list = list(
            "filename,y,x,height,width,priority\n\
             a.tif,0,0,6,6,0\n\
             a.tif,0,4,6,6,1\n\
             a.tif,6,0,4,4,1\n",
        );
        let b_list = list(
            "filename,y,x,height,width,priority,annotator\n\
             b.tif,0,0,6,6,1,bob\n\
             b.tif,0,4,6,6,0,bob\n\
             b.tif,6,0,4,4,1,\n",
        );
        let (ra, rb) = (raster(1, &["lc"]), raster(2, &[""]));
        let out = merge(
            MergeInput { tiles: &a_list, raster: &ra },
            MergeInput { tiles: &b_list, raster: &rb },
            "merged.tif",
        )
        .unwrap();

        let g = out.raster.grid();
        // B-only tile, minus the overlap with A's completed tile.
        assert_eq!(g.get(0, 2, 5), Some(1));
        assert_eq!(g.get(0, 2, 6), Some(2));
        assert_eq!(g.get(0, 5, 9), Some(2));
        // Outside every completed tile.
        assert_eq!(g.get(0, 8, 8), Some(1));
        assert_eq!(out.stats.cells_from_b, 24);
        assert_eq!(g.band_names(), ["lc".to_string()]);

        let tiles = out.tiles.tiles();
        assert_eq!(
            out.tiles.columns(),
            ["filename", "y", "x", "height", "width", "priority", "annotator", "overlap", "tile_list"]
        );
        assert!(tiles[0].complete && tiles[1].complete && !tiles[2].complete);
        assert_eq!(tiles[0].extra["tile_list"], "1");
        assert_eq!(tiles[1].extra["tile_list"], "2");
        assert_eq!(tiles[2].extra["tile_list"], "-1");
        assert_eq!(tiles[0].extra["overlap"], "True");
        assert_eq!(tiles[1].extra["overlap"], "True");
        assert_eq!(tiles[2].extra["overlap"], "False");
        assert_eq!(tiles[1].extra["annotator"], "bob");
        assert!(tiles.iter().all(|t| t.path == "merged.tif"));
    }

    #[test]
    fn tiles_only_in_b_are_appended() {
        let a_list = list("filename,y,x,height,width,priority\na.tif,0,0,5,5,1\n");
        let b_list = list("filename,y,x,height,width,priority\nb.tif,5,5,5,5,0\n");
        let (ra, rb) = (raster(1, &["x"]), raster(3, &["x"]));
        let out = merge(
            MergeInput { tiles: &a_list, raster: &ra },
            MergeInput { tiles: &b_list, raster: &rb },
            "m.tif",
        )
        .unwrap();
        assert_eq!(out.tiles.len(), 2);
        assert_eq!(out.tiles.tiles()[1].rect, WindowRect::new(5, 5, 5, 5));
        assert_eq!(out.raster.grid().get(0, 7, 7), Some(3));
        assert_eq!(out.raster.grid().get(0, 0, 0), Some(1));
        assert_eq!(out.stats.from_b, 1);
    }

    #[test]
    fn incompatible_rasters_fail() {
        let l = list("filename,y,x,height,width,priority\na.tif,0,0,5,5,1\n");
        let ra = raster(0, &["x"]);
        let rb = raster(0, &["x", "y"]);
        let err = merge(
            MergeInput { tiles: &l, raster: &ra },
            MergeInput { tiles: &l, raster: &rb },
            "m.tif",
        )
        .unwrap_err();
        assert!(matches!(err, MaskError::Format { .. }));
    }

    #[test]
    fn symbology_merges_with_a_first() {
        let l = list("filename,y,x,height,width,priority\na.tif,0,0,5,5,0\n");
        let mut ra = raster(1, &["x"]);
        let mut rb = raster(2, &["x"]);
        let mut sa = Symbology::new(&["x".to_string()]);
        sa.table_mut(0).unwrap().define(1, "forest", None);
        let mut sb = Symbology::new(&["x".to_string()]);
        sb.table_mut(0).unwrap().define(1, "water", None);
        sb.table_mut(0).unwrap().define(2, "urban", None);
        ra.write_symbology(&sa).unwrap();
        rb.write_symbology(&sb).unwrap();

        let out = merge(MergeInput { tiles: &l, raster: &ra }, MergeInput { tiles: &l, raster: &rb }, "m.tif").unwrap();
        let sym = out.raster.read_symbology().unwrap().unwrap();
        let t = sym.table(0).unwrap();
        assert_eq!(t.label(1), Some("forest"));
        assert_eq!(t.label(2), Some("urban"));
        assert_eq!(t.null_value(), Some(0));
    }

    /// Merge two 4x4 single-band masks, each covered by one tile.
    fn merge_single_tiles(a_value: u16, a_complete: bool, b_value: u16, b_complete: bool) -> MergeOutput {
        let tile = |name: &str, complete: bool| {
            list(&format!("filename,y,x,height,width,priority\n{},0,0,4,4,{}\n", name, u8::from(!complete)))
        };
        let (a_list, b_list) = (tile("a.tif", a_complete), tile("b.tif", b_complete));
        let (ra, rb) = (sized(4, a_value, &["x"]), sized(4, b_value, &["x"]));
        merge(MergeInput { tiles: &a_list, raster: &ra }, MergeInput { tiles: &b_list, raster: &rb }, "m.tif").unwrap()
    }

    fn values(out: &MergeOutput) -> BTreeSet<u16> {
        out.raster.grid().unique_values(0).unwrap()
    }

    #[test]
    fn a_wins_when_both_tiles_are_complete() {
        let out = merge_single_tiles(5, true, 7, true);
        assert_eq!(values(&out), BTreeSet::from([5]));
        assert_eq!(out.stats.cells_from_b, 0);
        let tile = &out.tiles.tiles()[0];
        assert!(tile.complete);
        assert_eq!(tile.extra["tile_list"], "1");
        assert_eq!(tile.extra["overlap"], "True");
    }

    #[test]
    fn complete_a_beats_incomplete_b() {
        let out = merge_single_tiles(2, true, 3, false);
        assert_eq!(values(&out), BTreeSet::from([2]));
        let tile = &out.tiles.tiles()[0];
        assert!(tile.complete);
        assert_eq!(tile.extra["tile_list"], "1");
        assert_eq!(tile.extra["overlap"], "False");
    }

    #[test]
    fn a_is_kept_when_neither_tile_is_complete() {
        let out = merge_single_tiles(4, false, 9, false);
        assert_eq!(values(&out), BTreeSet::from([4]));
        let tile = &out.tiles.tiles()[0];
        assert!(!tile.complete);
        assert_eq!(tile.extra["tile_list"], "-1");
        assert_eq!(out.stats, MergeStats::default());
    }

    #[test]
    fn output_takes_the_coordinate_keys_of_a() {
        let l = list("filename,y,x,height,width,priority\na.tif,0,0,5,5,0\n");
        let utm = GeoKeys {
            directory: vec![1, 1, 0, 3, 1024, 0, 1, 1, 1025, 0, 1, 1, 3072, 0, 1, 32633],
            ..GeoKeys::default()
        };
        let mut ra = raster(1, &["x"]);
        let mut rb = raster(2, &["x"]);
        ra.set_geokeys(Some(utm.clone()));
        rb.set_geokeys(Some(GeoKeys { directory: vec![1, 1, 0, 1, 3072, 0, 1, 25832], ..GeoKeys::default() }));
        let out = merge(MergeInput { tiles: &l, raster: &ra }, MergeInput { tiles: &l, raster: &rb }, "m.tif").unwrap();
        assert_eq!(out.raster.geokeys(), Some(utm));
    }

    #[test]
    fn band_names_fall_back() {
        let names = merged_band_names(&["a".into(), "".into(), "".into()], &["x".into(), "y".into(), " ".into()]);
        assert_eq!(names, vec!["a", "y", "3"]);
    }
}
