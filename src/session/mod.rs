// ============================================================================
// EDIT SESSION: the single active tile
// ============================================================================
//
// Activation reads the tile window from the backing raster. Edits mutate the
// in-memory window only; `save` writes it back and `close` records the
// completion flag in the tile list. Synthesized regions are a cache rebuilt
// on demand after anything that changes the window, band or null value.

pub mod history;

use std::collections::BTreeSet;
use std::path::Path;

use image::{ImageFormat, RgbaImage};
use uuid::Uuid;

use crate::error::{MaskError, MaskResult};
use crate::geometry::{Polygon, ValuedPolygon};
use crate::grid::{GridWindow, WindowRect};
use crate::ops::edit::{self, EditOperation};
use crate::ops::rasterize::{FillMode, rasterize};
use crate::ops::synthesize::{Connectivity, Synthesis, SynthesisOptions, synthesize};
use crate::raster::RasterStore;
use crate::settings::Settings;
use crate::symbology::{RemovalCriterion, RemovalPlan, Symbology};
use crate::tiles::TileIndex;
use crate::{log_info, log_warn};
use history::{CellPatch, EditState, HistoryManager, PaintCommand};

/// Per-session knobs, normally taken from `Settings`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionOptions {
    /// Overrides the symbology's null class when set.
    pub null_value: Option<u16>,
    pub synthesis: SynthesisOptions,
    pub max_undo_steps: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            null_value: None,
            synthesis: SynthesisOptions::default(),
            max_undo_steps: 50,
        }
    }
}

impl From<&Settings> for SessionOptions {
    fn from(s: &Settings) -> Self {
        Self {
            null_value: s.null_value,
            synthesis: SynthesisOptions {
                connectivity: s.connectivity,
                warn_threshold: s.region_warning_threshold,
            },
            max_undo_steps: s.max_undo_steps,
        }
    }
}

/// Change to one synthesized region.
#[derive(Clone, Debug, PartialEq)]
pub enum RegionChange {
    /// New outline, same value.
    Reshape(Polygon),
    /// Same outline, new value.
    Revalue(u16),
    Delete,
}

/// `region` indexes the current `regions()` list.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionEdit {
    pub region: usize,
    pub change: RegionChange,
}

struct ActiveTile {
    /// Position in the tile list; `None` for an ad-hoc window.
    tile: Option<usize>,
    state: EditState,
    regions: Option<Synthesis>,
    history: HistoryManager,
    dirty: bool,
}

pub struct EditSession<S: RasterStore> {
    id: Uuid,
    store: S,
    tiles: TileIndex,
    symbology: Symbology,
    options: SessionOptions,
    active: Option<ActiveTile>,
    next_feature_id: u64,
}

impl<S: RasterStore> EditSession<S> {
    pub fn new(store: S, tiles: TileIndex, options: SessionOptions) -> MaskResult<Self> {
        let names = store.band_names();
        let symbology = store
            .read_symbology()?
            .unwrap_or_else(|| Symbology::new(&names))
            .aligned_to(&names);
        if let Some(null) = options.null_value {
            store.pixel_type().check(null)?;
        }
        let id = Uuid::new_v4();
        log_info!("Session {} started ({} tiles)", id, tiles.len());
        Ok(Self { id, store, tiles, symbology, options, active: None, next_feature_id: 0 })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tiles(&self) -> &TileIndex {
        &self.tiles
    }

    pub fn tiles_mut(&mut self) -> &mut TileIndex {
        &mut self.tiles
    }

    pub fn symbology(&self) -> &Symbology {
        &self.symbology
    }

    pub fn symbology_mut(&mut self) -> &mut Symbology {
        &mut self.symbology
    }

    pub fn into_parts(self) -> (S, TileIndex, Symbology) {
        (self.store, self.tiles, self.symbology)
    }

    // ========================================================================
    // ACTIVATION
    // ========================================================================

    /// Make tile `index` of the list the active tile, on `band`.
    pub fn activate(&mut self, index: usize, band: usize) -> MaskResult<()> {
        let rect = self.tiles.select_position(index)?.rect;
        self.open_window(Some(index), rect, band)
    }

    /// Edit an arbitrary rectangle that is not in the tile list.
    pub fn activate_rect(&mut self, rect: WindowRect, band: usize) -> MaskResult<()> {
        self.open_window(None, rect, band)
    }

    fn open_window(&mut self, tile: Option<usize>, rect: WindowRect, band: usize) -> MaskResult<()> {
        if band >= self.store.band_count() {
            return Err(MaskError::NotFound(format!(
                "band {} (raster has {})",
                band + 1,
                self.store.band_count()
            )));
        }
        let window = self.store.read_window(&self.store.all_bands(), rect)?;
        if let Some(prev) = &self.active
            && prev.dirty
        {
            log_warn!("Discarding unsaved edits of {}", describe(prev.tile, prev.state.window.rect()));
        }
        self.active = Some(ActiveTile {
            tile,
            state: EditState::new(window, band),
            regions: None,
            history: HistoryManager::new(self.options.max_undo_steps),
            dirty: false,
        });
        log_info!("Activated {}", describe(tile, rect));
        Ok(())
    }

    fn active(&self) -> MaskResult<&ActiveTile> {
        self.active.as_ref().ok_or_else(|| MaskError::NotFound("no active tile".into()))
    }

    fn active_mut(&mut self) -> MaskResult<&mut ActiveTile> {
        self.active.as_mut().ok_or_else(|| MaskError::NotFound("no active tile".into()))
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_tile(&self) -> Option<usize> {
        self.active.as_ref().and_then(|a| a.tile)
    }

    pub fn window(&self) -> MaskResult<&GridWindow> {
        Ok(&self.active()?.state.window)
    }

    pub fn band(&self) -> MaskResult<usize> {
        Ok(self.active()?.state.band)
    }

    pub fn is_dirty(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.dirty)
    }

    /// Switch the edited band. Drawn features and the region cache go.
    pub fn set_band(&mut self, band: usize) -> MaskResult<()> {
        let active = self.active_mut()?;
        active.state.window.band(band)?;
        active.state.band = band;
        active.state.drawn.clear();
        active.regions = None;
        Ok(())
    }

    // ========================================================================
    // NULL VALUE
    // ========================================================================

    /// Session override, else the band's null class, else 0.
    pub fn null_value(&self) -> u16 {
        let band = self.active.as_ref().map_or(0, |a| a.state.band);
        self.options
            .null_value
            .or_else(|| self.symbology.table(band).ok().and_then(|t| t.null_value()))
            .unwrap_or(0)
    }

    pub fn set_null_value(&mut self, value: u16) -> MaskResult<()> {
        self.store.pixel_type().check(value)?;
        let band = self.active.as_ref().map_or(0, |a| a.state.band);
        self.symbology.table_mut(band)?.set_null(value);
        self.options.null_value = Some(value);
        if let Some(active) = self.active.as_mut() {
            active.regions = None;
        }
        Ok(())
    }

    pub fn set_connectivity(&mut self, connectivity: Connectivity) {
        self.options.synthesis.connectivity = connectivity;
        if let Some(active) = self.active.as_mut() {
            active.regions = None;
        }
    }

    // ========================================================================
    // REGIONS AND DRAWN FEATURES
    // ========================================================================

    /// Synthesized regions of the active band, rebuilt if stale.
    pub fn regions(&mut self) -> MaskResult<&Synthesis> {
        let options = self.options.synthesis;
        let active = self.active_mut()?;
        if active.regions.is_none() {
            let synthesis = synthesize(&active.state.window, active.state.band, &options)?;
            active.regions = Some(synthesis);
        }
        active
            .regions
            .as_ref()
            .ok_or_else(|| MaskError::NotFound("regions unavailable".into()))
    }

    pub fn drawn(&self) -> MaskResult<Vec<&ValuedPolygon>> {
        Ok(self.active()?.state.drawn.iter().map(|(_, p)| p).collect())
    }

    /// Drop drawn features and rebuild regions from the pixels.
    pub fn redraw(&mut self) -> MaskResult<&Synthesis> {
        let active = self.active_mut()?;
        active.state.drawn.clear();
        active.regions = None;
        self.regions()
    }

    // ========================================================================
    // EDITS
    // ========================================================================

    /// Commit one edit operation. Returns the number of changed cells.
    pub fn apply(&mut self, op: &EditOperation) -> MaskResult<usize> {
        let null = self.null_value();
        let feature_id = self.next_feature_id;
        let active = self.active.as_mut().ok_or_else(|| MaskError::NotFound("no active tile".into()))?;
        let band = active.state.band;

        let before = active.state.window.clone();
        let changed = edit::apply(&mut active.state.window, band, op, null)?;
        let patch = CellPatch::diff(&before, &active.state.window, band);

        let drawn = match op {
            EditOperation::PolygonDraw { polygon, value } => {
                let feature = (feature_id, ValuedPolygon::new(polygon.clone(), *value));
                active.state.drawn.push(feature.clone());
                Some(feature)
            }
            _ => None,
        };
        let command = PaintCommand::new(op.name().to_string(), patch, drawn);
        if !command.is_empty() {
            active.history.push(Box::new(command));
        }
        if changed > 0 {
            active.regions = None;
            active.dirty = true;
        }
        if matches!(op, EditOperation::PolygonDraw { .. }) {
            self.next_feature_id += 1;
        }
        let value = op.target_value(null);
        if value != null && self.symbology.table_mut(band)?.ensure(value) {
            log_info!("New class {} on band {}", value, band + 1);
        }
        Ok(changed)
    }

    /// Apply region edits and re-rasterize the band: untouched regions first,
    /// edited ones last, everything uncovered becomes null.
    pub fn edit_regions(&mut self, edits: &[RegionEdit]) -> MaskResult<usize> {
        let null = self.null_value();
        let pixel_type = self.store.pixel_type();
        let regions = self.regions()?.regions.clone();

        let mut changed_at = vec![None; regions.len()];
        for e in edits {
            if e.region >= regions.len() {
                return Err(MaskError::NotFound(format!(
                    "region {} (tile has {})",
                    e.region + 1,
                    regions.len()
                )));
            }
            match &e.change {
                RegionChange::Reshape(p) => p.validate()?,
                RegionChange::Revalue(v) => pixel_type.check(*v)?,
                RegionChange::Delete => {}
            }
            changed_at[e.region] = Some(&e.change);
        }

        let mut ordered: Vec<ValuedPolygon> = Vec::with_capacity(regions.len());
        let mut edited: Vec<ValuedPolygon> = Vec::new();
        for (region, change) in regions.into_iter().zip(&changed_at) {
            match change {
                None => ordered.push(region),
                Some(RegionChange::Delete) => {}
                Some(RegionChange::Reshape(p)) => edited.push(ValuedPolygon::new(p.clone(), region.value)),
                Some(RegionChange::Revalue(v)) => edited.push(ValuedPolygon::new(region.polygon, *v)),
            }
        }
        let new_values: BTreeSet<u16> = edited.iter().map(|p| p.value).filter(|&v| v != null).collect();
        ordered.extend(edited);
        ordered.retain(|p| p.value != null);

        let active = self.active_mut()?;
        let band = active.state.band;
        let out = rasterize(&active.state.window, band, &ordered, FillMode::Replace(null))?;
        let patch = CellPatch::diff(&active.state.window, &out, band);
        let changed = patch
            .as_ref()
            .map_or(0, |p| p.before.iter().zip(&p.after).filter(|(a, b)| a != b).count());
        if let Some(patch) = patch {
            active.state.window = out;
            active.history.push(Box::new(PaintCommand::new(
                format!("Edit {} region(s)", edits.len()),
                Some(patch),
                None,
            )));
            active.regions = None;
            active.dirty = true;
        }
        let table = self.symbology.table_mut(band)?;
        for v in new_values {
            table.ensure(v);
        }
        Ok(changed)
    }

    pub fn undo(&mut self) -> MaskResult<Option<String>> {
        let active = self.active_mut()?;
        let done = active.history.undo(&mut active.state);
        if done.is_some() {
            active.regions = None;
            active.dirty = true;
        }
        Ok(done)
    }

    pub fn redo(&mut self) -> MaskResult<Option<String>> {
        let active = self.active_mut()?;
        let done = active.history.redo(&mut active.state);
        if done.is_some() {
            active.regions = None;
            active.dirty = true;
        }
        Ok(done)
    }

    pub fn undo_history(&self) -> MaskResult<Vec<String>> {
        Ok(self.active()?.history.undo_history())
    }

    // ========================================================================
    // PREVIEW
    // ========================================================================

    /// Class colours of the active band; null and unmapped cells are
    /// transparent.
    pub fn preview(&self) -> MaskResult<RgbaImage> {
        let active = self.active()?;
        let band = active.state.band;
        Ok(self.symbology.table(band)?.render(active.state.window.band(band)?))
    }

    pub fn save_preview(&self, path: &Path) -> MaskResult<()> {
        self.preview()?.save_with_format(path, ImageFormat::Png)?;
        log_info!("Preview written to {}", path.display());
        Ok(())
    }

    // ========================================================================
    // CLASSES
    // ========================================================================

    /// First step of a class removal on the active band.
    pub fn plan_class_removal(&self, criterion: &RemovalCriterion) -> MaskResult<RemovalPlan> {
        let active = self.active()?;
        let present = active.state.window.unique_values(active.state.band)?;
        self.symbology.plan_removal(active.state.band, criterion, &present)
    }

    pub fn apply_class_removal(&mut self, plan: RemovalPlan) -> MaskResult<usize> {
        self.symbology.apply_removal(plan)
    }

    // ========================================================================
    // SAVE / CLOSE
    // ========================================================================

    /// Write the active window and the symbology to the raster.
    pub fn save(&mut self) -> MaskResult<()> {
        let bands = self.store.all_bands();
        let active = self.active.as_ref().ok_or_else(|| MaskError::NotFound("no active tile".into()))?;
        self.store.write_window(&bands, &active.state.window)?;
        self.store.write_symbology(&self.symbology)?;
        let label = describe(active.tile, active.state.window.rect());
        if let Some(active) = self.active.as_mut() {
            active.dirty = false;
        }
        log_info!("Saved {}", label);
        Ok(())
    }

    /// Deactivate. Unsaved edits are discarded. With `Some(flag)` the tile's
    /// completion is recorded and the tile list saved; on failure the flag
    /// is restored and the tile stays active.
    pub fn close(&mut self, complete: Option<bool>) -> MaskResult<()> {
        let active = self.active()?;
        if let (Some(flag), Some(index)) = (complete, active.tile) {
            let previous = self.tiles.select_position(index)?.complete;
            self.tiles.mark_complete(index, flag)?;
            if self.tiles.path().is_some()
                && let Err(e) = self.tiles.save()
            {
                self.tiles.mark_complete(index, previous)?;
                return Err(e);
            }
            log_info!("Tile {} marked {}", index + 1, if flag { "complete" } else { "incomplete" });
        }
        if let Some(prev) = self.active.take()
            && prev.dirty
        {
            log_warn!("Closed {} with unsaved edits", describe(prev.tile, prev.state.window.rect()));
        }
        Ok(())
    }
}

fn describe(tile: Option<usize>, rect: WindowRect) -> String {
    match tile {
        Some(i) => format!("tile {} (y={} x={} {}x{})", i + 1, rect.row, rect.col, rect.height, rect.width),
        None => format!("window y={} x={} {}x{}", rect.row, rect.col, rect.height, rect.width),
    }
}
