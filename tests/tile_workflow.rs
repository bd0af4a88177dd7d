//! File-backed workflows: generate a tile list over a new GeoTIFF mask, edit
//! tiles through a session, close them complete, and merge two masks.

use std::path::Path;

use masktile::MaskError;
use masktile::geometry::Polygon;
use masktile::grid::{GeoTransform, PixelType};
use masktile::ops::edit::EditOperation;
use masktile::ops::merge::{MergeInput, merge};
use masktile::raster::{GeoKeys, MemoryRaster, RasterStore, TiffRaster};
use masktile::session::{EditSession, SessionOptions};
use masktile::tiles::TileIndex;
use masktile::tiles::layout::GridLayout;

fn new_mask(path: &Path) -> TiffRaster {
    let raster = MemoryRaster::filled(
        40,
        60,
        vec!["landcover".into()],
        PixelType::U8,
        GeoTransform::north_up(300_000.0, 5_000_000.0, 0.5, -0.5),
        0,
    )
    .unwrap();
    TiffRaster::create(path, raster).unwrap()
}

fn tile_list(dir: &Path, mask: &TiffRaster) -> TileIndex {
    let rects = GridLayout::new(mask.full_rect(), 20, 20, 0.0).rects().unwrap();
    let mut index = TileIndex::from_rects("mask.tif", rects).unwrap();
    index.save_as(&dir.join("tiles.csv")).unwrap();
    index
}

/// Geographic square over window-local cells [lo, hi) on both axes.
fn local_square(session: &EditSession<TiffRaster>, lo: f64, hi: f64) -> Polygon {
    let w = session.window().unwrap();
    let (x0, y0) = w.local_to_geo(lo, lo);
    let (x1, y1) = w.local_to_geo(hi, hi);
    Polygon::rect(x0, y0, x1, y1)
}

#[test]
fn generated_grid_covers_the_mask() {
    let dir = tempfile::tempdir().unwrap();
    let mask = new_mask(&dir.path().join("mask.tif"));
    let index = tile_list(dir.path(), &mask);
    assert_eq!(index.len(), 6);
    assert_eq!(index.counts(), (0, 6));
    let reloaded = TileIndex::load(&dir.path().join("tiles.csv")).unwrap();
    assert_eq!(reloaded.tiles(), index.tiles());
    assert_eq!(reloaded.resolve_raster(0).unwrap(), dir.path().join("mask.tif"));
}

#[test]
fn edits_are_saved_and_completion_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mask_path = dir.path().join("mask.tif");
    let mask = new_mask(&mask_path);
    let list_path = dir.path().join("tiles.csv");
    let index = tile_list(dir.path(), &mask);

    let mut session = EditSession::new(mask, index, SessionOptions::default()).unwrap();
    session.activate(4, 0).unwrap();
    let square = local_square(&session, 5.0, 10.0);
    let changed = session
        .apply(&EditOperation::PolygonDraw { polygon: square, value: 12 })
        .unwrap();
    assert_eq!(changed, 25);
    session.save().unwrap();
    session.close(Some(true)).unwrap();

    let reopened = TiffRaster::open(&mask_path).unwrap();
    let tile = TileIndex::load(&list_path).unwrap().tiles()[4].clone();
    let all = reopened.read_all().unwrap();
    assert_eq!(all.get(0, tile.rect.row + 5, tile.rect.col + 5), Some(12));
    assert_eq!(all.get(0, tile.rect.row + 4, tile.rect.col + 5), Some(0));
    assert!(reopened.read_symbology().unwrap().unwrap().table(0).unwrap().contains(12));
    assert_eq!(TileIndex::load(&list_path).unwrap().counts(), (1, 5));
}

#[test]
fn closing_without_saving_discards_edits() {
    let dir = tempfile::tempdir().unwrap();
    let mask_path = dir.path().join("mask.tif");
    let mask = new_mask(&mask_path);
    let index = tile_list(dir.path(), &mask);

    let mut session = EditSession::new(mask, index, SessionOptions::default()).unwrap();
    session.activate(0, 0).unwrap();
    let square = local_square(&session, 0.0, 4.0);
    session
        .apply(&EditOperation::SelectionFill {
            selection: masktile::geometry::MultiPolygon(vec![square]),
            value: 3,
        })
        .unwrap();
    session.close(None).unwrap();
    let all = TiffRaster::open(&mask_path).unwrap().read_all().unwrap();
    assert_eq!(all.unique_values(0).unwrap().into_iter().collect::<Vec<_>>(), vec![0]);
}

#[test]
fn invalid_tile_lists_report_the_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.csv");
    std::fs::write(
        &path,
        "filename,y,x,height,width,priority\nmask.tif,0,0,20,20,1\nmask.tif,0,20,0,20,1\n",
    )
    .unwrap();
    match TileIndex::load(&path) {
        Err(MaskError::Format { line, .. }) => assert_eq!(line, Some(3)),
        other => panic!("expected a format error, got {:?}", other.map(|i| i.len())),
    }

    std::fs::write(&path, "filename,y,x,height,width\nmask.tif,0,0,20,20\n").unwrap();
    assert!(matches!(TileIndex::load(&path), Err(MaskError::Format { .. })));
}

#[test]
fn merged_masks_round_trip_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let utm = GeoKeys {
        directory: vec![1, 1, 0, 3, 1024, 0, 1, 1, 1025, 0, 1, 1, 3072, 0, 1, 32633],
        ..GeoKeys::default()
    };
    let mut a_mem = new_mask(&dir.path().join("a.tif")).memory().clone();
    a_mem.set_geokeys(Some(utm.clone()));
    let a_mask = TiffRaster::create(&dir.path().join("a.tif"), a_mem).unwrap();
    let mut b_mem = a_mask.memory().clone();
    b_mem.set_geokeys(None);
    let b_list = {
        let rects = GridLayout::new(b_mem.full_rect(), 20, 20, 0.0).rects().unwrap();
        let mut list = TileIndex::from_rects("b.tif", rects).unwrap();
        list.mark_complete(1, true).unwrap();
        list
    };
    let tile = b_list.tiles()[1].rect;
    let mut window = b_mem.read_window(&[0], tile).unwrap();
    for r in 0..tile.height {
        for c in 0..tile.width {
            window.set(0, r, c, 7).unwrap();
        }
    }
    b_mem.write_window(&[0], &window).unwrap();
    let b_mask = TiffRaster::create(&dir.path().join("b.tif"), b_mem).unwrap();
    let a_list = TileIndex::from_rects("a.tif", GridLayout::new(a_mask.full_rect(), 20, 20, 0.0).rects().unwrap()).unwrap();

    let out = merge(
        MergeInput { tiles: &a_list, raster: &a_mask },
        MergeInput { tiles: &b_list, raster: &b_mask },
        "merged.tif",
    )
    .unwrap();
    assert_eq!(out.stats.cells_from_b, 400);

    let merged = TiffRaster::create(&dir.path().join("merged.tif"), out.raster).unwrap();
    let mut tiles = out.tiles;
    tiles.save_as(&dir.path().join("merged.csv")).unwrap();

    let reopened = TiffRaster::open(merged.path()).unwrap();
    assert_eq!(reopened.geokeys(), Some(utm));
    let all = reopened.read_all().unwrap();
    assert_eq!(all.get(0, tile.row, tile.col), Some(7));
    assert_eq!(all.get(0, 0, 0), Some(0));
    let list = TileIndex::load(&dir.path().join("merged.csv")).unwrap();
    assert_eq!(list.counts(), (1, 5));
    assert!(list.tiles().iter().all(|t| t.path == "merged.tif"));
    assert_eq!(list.tiles()[1].extra["tile_list"], "2");
}
