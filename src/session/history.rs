use std::collections::VecDeque;

use crate::grid::{GridWindow, WindowRect};
use crate::geometry::ValuedPolygon;

// ============================================================================
// EDIT STATE - what commands act on
// ============================================================================

/// The active tile's pixels plus the standalone drawn polygons.
#[derive(Clone, Debug)]
pub struct EditState {
    pub window: GridWindow,
    pub band: usize,
    /// Drawn features, tagged with an id so undo can find them again.
    pub drawn: Vec<(u64, ValuedPolygon)>,
}

impl EditState {
    pub fn new(window: GridWindow, band: usize) -> Self {
        Self { window, band, drawn: Vec::new() }
    }
}

// ============================================================================
// COMMAND TRAIT
// ============================================================================

/// Trait for undoable/redoable commands.
pub trait Command: Send + Sync {
    fn undo(&self, state: &mut EditState);
    fn redo(&self, state: &mut EditState);
    fn description(&self) -> String;
    fn memory_size(&self) -> usize;
}

// ============================================================================
// CELL PATCH - changed cells only, bounding-box sized
// ============================================================================

/// The smallest rectangle of one band holding every changed cell, before
/// and after the edit. Window-local coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct CellPatch {
    pub band: usize,
    pub rect: WindowRect,
    pub before: Vec<u16>,
    pub after: Vec<u16>,
}

impl CellPatch {
    /// Diff two same-sized windows. `None` if nothing changed.
    pub fn diff(before: &GridWindow, after: &GridWindow, band: usize) -> Option<Self> {
        let (b0, b1) = (before.band(band).ok()?, after.band(band).ok()?);
        if b0.dimensions() != b1.dimensions() {
            return None;
        }
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
        for ((x, y, p0), p1) in b0.enumerate_pixels().zip(b1.pixels()) {
            if p0 != p1 {
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
        if min_x == u32::MAX {
            return None;
        }
        let rect = WindowRect::new(min_y, min_x, max_y - min_y + 1, max_x - min_x + 1);
        let capture = |b: &crate::grid::Band| {
            let mut v = Vec::with_capacity(rect.height as usize * rect.width as usize);
            for y in rect.row..rect.row + rect.height {
                for x in rect.col..rect.col + rect.width {
                    v.push(b.get_pixel(x, y).0[0]);
                }
            }
            v
        };
        Some(Self { band, rect, before: capture(b0), after: capture(b1) })
    }

    fn write(&self, window: &mut GridWindow, values: &[u16]) {
        let Ok(data) = window.band_mut(self.band) else {
            crate::log_err!("CellPatch: band {} missing from window", self.band + 1);
            return;
        };
        let mut idx = 0;
        for y in self.rect.row..self.rect.row + self.rect.height {
            for x in self.rect.col..self.rect.col + self.rect.width {
                if x < data.width() && y < data.height() && idx < values.len() {
                    data.get_pixel_mut(x, y).0[0] = values[idx];
                }
                idx += 1;
            }
        }
    }

    pub fn memory_size(&self) -> usize {
        (self.before.len() + self.after.len()) * 2
    }
}

// ============================================================================
// PAINT COMMAND - one committed edit operation or region edit
// ============================================================================

pub struct PaintCommand {
    description: String,
    patch: Option<CellPatch>,
    /// Feature added to the drawn list by this command.
    drawn: Option<(u64, ValuedPolygon)>,
}

impl PaintCommand {
    pub fn new(description: String, patch: Option<CellPatch>, drawn: Option<(u64, ValuedPolygon)>) -> Self {
        Self { description, patch, drawn }
    }

    pub fn is_empty(&self) -> bool {
        self.patch.is_none() && self.drawn.is_none()
    }
}

impl Command for PaintCommand {
    fn undo(&self, state: &mut EditState) {
        if let Some(patch) = &self.patch {
            patch.write(&mut state.window, &patch.before);
        }
        if let Some((id, _)) = &self.drawn {
            state.drawn.retain(|(d, _)| d != id);
        }
    }

    fn redo(&self, state: &mut EditState) {
        if let Some(patch) = &self.patch {
            patch.write(&mut state.window, &patch.after);
        }
        if let Some(feature) = &self.drawn
            && !state.drawn.iter().any(|(d, _)| *d == feature.0)
        {
            state.drawn.push(feature.clone());
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        let drawn = self
            .drawn
            .as_ref()
            .map_or(0, |(_, p)| p.polygon.rings().map(|r| r.len() * 16).sum());
        self.patch.as_ref().map_or(0, |p| p.memory_size()) + drawn
    }
}

// ============================================================================
// HISTORY MANAGER
// ============================================================================

pub struct HistoryManager {
    undo_stack: VecDeque<Box<dyn Command>>,
    redo_stack: VecDeque<Box<dyn Command>>,
    max_history_size: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across both stacks.
    total_memory: usize,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(50)
    }
}

impl HistoryManager {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_history_size,
            max_memory_bytes: Some(64 * 1024 * 1024),
            total_memory: 0,
        }
    }

    pub fn push(&mut self, command: Box<dyn Command>) {
        for cmd in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(cmd.memory_size());
        }
        self.total_memory += command.memory_size();
        self.undo_stack.push_back(command);
        self.prune();
    }

    pub fn undo(&mut self, state: &mut EditState) -> Option<String> {
        let command = self.undo_stack.pop_back()?;
        let description = command.description();
        command.undo(state);
        self.redo_stack.push_back(command);
        Some(description)
    }

    pub fn redo(&mut self, state: &mut EditState) -> Option<String> {
        let command = self.redo_stack.pop_back()?;
        let description = command.description();
        command.redo(state);
        self.undo_stack.push_back(command);
        Some(description)
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Most recent first.
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|c| c.description()).collect()
    }

    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_history_size {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
            }
        }
        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                }
            }
        }
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::PixelType;

    fn state() -> EditState {
        EditState::new(GridWindow::from_rows(&[&[0, 0, 0], &[0, 0, 0], &[0, 0, 0]], PixelType::U8).unwrap(), 0)
    }

    fn edit(state: &mut EditState, cells: &[(u32, u32, u16)]) -> PaintCommand {
        let before = state.window.clone();
        for &(r, c, v) in cells {
            state.window.set(0, r, c, v).unwrap();
        }
        PaintCommand::new("edit".into(), CellPatch::diff(&before, &state.window, 0), None)
    }

    #[test]
    fn patch_covers_the_changed_bounding_box() {
        let mut s = state();
        let before = s.window.clone();
        s.window.set(0, 0, 1, 5).unwrap();
        s.window.set(0, 1, 2, 6).unwrap();
        let p = CellPatch::diff(&before, &s.window, 0).unwrap();
        assert_eq!(p.rect, WindowRect::new(0, 1, 2, 2));
        assert_eq!(p.before, vec![0, 0, 0, 0]);
        assert_eq!(p.after, vec![5, 0, 0, 6]);
        assert!(CellPatch::diff(&s.window, &s.window, 0).is_none());
    }

    #[test]
    fn undo_redo_round_trip() {
        let mut s = state();
        let original = s.window.clone();
        let mut h = HistoryManager::new(10);
        let c1 = edit(&mut s, &[(0, 0, 1)]);
        h.push(Box::new(c1));
        let after_first = s.window.clone();
        let c2 = edit(&mut s, &[(2, 2, 2)]);
        h.push(Box::new(c2));
        let after_second = s.window.clone();

        assert_eq!(h.undo(&mut s).as_deref(), Some("edit"));
        assert_eq!(s.window, after_first);
        h.undo(&mut s);
        assert_eq!(s.window, original);
        assert!(h.undo(&mut s).is_none());
        h.redo(&mut s);
        h.redo(&mut s);
        assert_eq!(s.window, after_second);
    }

    #[test]
    fn new_command_clears_redo_and_limit_prunes() {
        let mut s = state();
        let mut h = HistoryManager::new(2);
        for v in 1..=3 {
            let c = edit(&mut s, &[(0, 0, v)]);
            h.push(Box::new(c));
        }
        assert_eq!(h.undo_count(), 2);
        h.undo(&mut s);
        assert!(h.can_redo());
        let c = edit(&mut s, &[(1, 1, 9)]);
        h.push(Box::new(c));
        assert!(!h.can_redo());
    }

    #[test]
    fn drawn_features_follow_undo() {
        let mut s = state();
        let poly = ValuedPolygon::new(crate::geometry::Polygon::rect(0.0, 0.0, 1.0, 1.0), 3);
        s.drawn.push((7, poly.clone()));
        let cmd = PaintCommand::new("draw".into(), None, Some((7, poly)));
        cmd.undo(&mut s);
        assert!(s.drawn.is_empty());
        cmd.redo(&mut s);
        cmd.redo(&mut s);
        assert_eq!(s.drawn.len(), 1);
    }
}
