// ============================================================================
// EDIT OPERATORS: Brush, Erase, SelectionFill, PolygonDraw
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{MaskError, MaskResult};
use crate::geometry::{MultiPolygon, Point, Polygon};
use crate::grid::GridWindow;
use crate::ops::rasterize::{PixelPolygon, Stroke, paint};

/// One committed edit. Geometry is in the raster's geographic frame;
/// widths are in pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditOperation {
    Brush {
        path: Vec<Point>,
        width: u32,
        value: u16,
    },
    Erase {
        path: Vec<Point>,
        width: u32,
    },
    SelectionFill {
        selection: MultiPolygon,
        value: u16,
    },
    PolygonDraw {
        polygon: Polygon,
        value: u16,
    },
}

impl EditOperation {
    /// Value written by the operation once the session null is known.
    pub fn target_value(&self, null_value: u16) -> u16 {
        match self {
            EditOperation::Brush { value, .. }
            | EditOperation::SelectionFill { value, .. }
            | EditOperation::PolygonDraw { value, .. } => *value,
            EditOperation::Erase { .. } => null_value,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EditOperation::Brush { .. } => "Brush",
            EditOperation::Erase { .. } => "Erase",
            EditOperation::SelectionFill { .. } => "Selection fill",
            EditOperation::PolygonDraw { .. } => "Polygon draw",
        }
    }

    /// Geometry checks only; does not need a window.
    pub fn validate(&self) -> MaskResult<()> {
        match self {
            EditOperation::Brush { path, width, .. } | EditOperation::Erase { path, width } => {
                if path.is_empty() {
                    return Err(MaskError::geometry(format!("{} path is empty", self.name())));
                }
                if *width == 0 {
                    return Err(MaskError::geometry(format!("{} width must be positive", self.name())));
                }
                if let Some(p) = path.iter().find(|p| !p.is_finite()) {
                    return Err(MaskError::geometry(format!(
                        "{} path has a non-finite point ({}, {})",
                        self.name(),
                        p.x,
                        p.y
                    )));
                }
                Ok(())
            }
            EditOperation::SelectionFill { selection, .. } => {
                if selection.0.is_empty() {
                    return Err(MaskError::geometry("selection has no parts"));
                }
                for (i, part) in selection.0.iter().enumerate() {
                    part.validate()
                        .map_err(|e| MaskError::geometry(format!("selection part {}: {}", i + 1, e)))?;
                }
                Ok(())
            }
            EditOperation::PolygonDraw { polygon, .. } => polygon.validate(),
        }
    }
}

/// Apply `op` to one band of `window`. The window is untouched unless the
/// whole operation is valid. Returns how many cells changed.
pub fn apply(window: &mut GridWindow, band: usize, op: &EditOperation, null_value: u16) -> MaskResult<usize> {
    op.validate()?;
    let value = op.target_value(null_value);
    window.pixel_type().check(value)?;
    window.band(band)?;

    match op {
        EditOperation::Brush { path, width, .. } | EditOperation::Erase { path, width } => {
            let stroke = Stroke::from_geo(window, path, *width)?;
            paint(window, band, &stroke, value)
        }
        EditOperation::SelectionFill { selection, .. } => {
            let parts = selection
                .0
                .iter()
                .map(|p| PixelPolygon::from_geo(window, p))
                .collect::<MaskResult<Vec<_>>>()?;
            paint(window, band, &parts, value)
        }
        EditOperation::PolygonDraw { polygon, .. } => {
            let fp = PixelPolygon::from_geo(window, polygon)?;
            paint(window, band, &fp, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GeoTransform, PixelType, WindowRect};

    fn window() -> GridWindow {
        GridWindow::filled(
            WindowRect::new(100, 200, 8, 8),
            PixelType::U8,
            GeoTransform::north_up(0.0, 0.0, 1.0, 1.0),
            vec!["classes".into()],
            0,
        )
        .unwrap()
    }

    /// Geographic centre of window-local cell (row, col).
    fn at(w: &GridWindow, row: u32, col: u32) -> Point {
        w.cell_center(row, col).into()
    }

    fn all_ops(w: &GridWindow) -> Vec<EditOperation> {
        let (x0, y0) = w.local_to_geo(1.0, 1.0);
        let (x1, y1) = w.local_to_geo(5.0, 4.0);
        let square = Polygon::rect(x0, y0, x1, y1);
        vec![
            EditOperation::Brush { path: vec![at(w, 2, 2), at(w, 5, 6)], width: 3, value: 4 },
            EditOperation::Erase { path: vec![at(w, 2, 2)], width: 1 },
            EditOperation::SelectionFill { selection: MultiPolygon(vec![square.clone()]), value: 6 },
            EditOperation::PolygonDraw { polygon: square, value: 7 },
        ]
    }

    #[test]
    fn operators_are_idempotent() {
        let base = window();
        for op in all_ops(&base) {
            let mut once = base.clone();
            apply(&mut once, 0, &op, 0).unwrap();
            let mut twice = once.clone();
            let changed = apply(&mut twice, 0, &op, 0).unwrap();
            assert_eq!(changed, 0, "{} changed cells on re-apply", op.name());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn erase_writes_null() {
        let mut w = window();
        w.set(0, 3, 3, 9).unwrap();
        let op = EditOperation::Erase { path: vec![at(&w, 3, 3)], width: 1 };
        assert_eq!(apply(&mut w, 0, &op, 2).unwrap(), 1);
        assert_eq!(w.get(0, 3, 3), Some(2));
        assert_eq!(w.get(0, 3, 4), Some(0));
    }

    #[test]
    fn multi_part_selection_fills_each_part() {
        let mut w = window();
        let (ax, ay) = w.local_to_geo(0.0, 0.0);
        let (bx, by) = w.local_to_geo(2.0, 2.0);
        let (cx, cy) = w.local_to_geo(6.0, 6.0);
        let (dx, dy) = w.local_to_geo(8.0, 8.0);
        let op = EditOperation::SelectionFill {
            selection: MultiPolygon(vec![Polygon::rect(ax, ay, bx, by), Polygon::rect(cx, cy, dx, dy)]),
            value: 3,
        };
        assert_eq!(apply(&mut w, 0, &op, 0).unwrap(), 8);
        assert_eq!(w.get(0, 0, 0), Some(3));
        assert_eq!(w.get(0, 7, 7), Some(3));
        assert_eq!(w.get(0, 4, 4), Some(0));
    }

    #[test]
    fn invalid_geometry_is_rejected_without_changes() {
        let mut w = window();
        let before = w.clone();
        let bowtie = Polygon::new(
            vec![at(&w, 0, 0), at(&w, 4, 4), at(&w, 0, 4), at(&w, 4, 0)],
            vec![],
        );
        let ops = vec![
            EditOperation::PolygonDraw { polygon: bowtie.clone(), value: 1 },
            EditOperation::SelectionFill {
                selection: MultiPolygon(vec![Polygon::rect(0.0, 0.0, 1.0, -1.0), bowtie]),
                value: 1,
            },
            EditOperation::SelectionFill { selection: MultiPolygon(vec![]), value: 1 },
            EditOperation::Brush { path: vec![], width: 3, value: 1 },
            EditOperation::Brush { path: vec![at(&w, 1, 1)], width: 0, value: 1 },
        ];
        for op in ops {
            assert!(matches!(apply(&mut w, 0, &op, 0), Err(MaskError::Geometry(_))), "{:?}", op);
            assert_eq!(w, before);
        }
    }

    #[test]
    fn value_too_large_for_pixel_type_fails() {
        let mut w = window();
        let op = EditOperation::Brush { path: vec![at(&w, 1, 1)], width: 1, value: 300 };
        assert!(matches!(apply(&mut w, 0, &op, 0), Err(MaskError::Raster(_))));
    }

    #[test]
    fn operations_deserialize_from_json() {
        let json = r#"[
            {"op": "brush", "path": [{"x": 1.0, "y": 2.0}], "width": 3, "value": 5},
            {"op": "erase", "path": [{"x": 1.0, "y": 2.0}], "width": 1},
            {"op": "polygon_draw", "polygon": {"exterior": [{"x": 0, "y": 0}, {"x": 1, "y": 0}, {"x": 1, "y": 1}, {"x": 0, "y": 0}]}, "value": 2}
        ]"#;
        let ops: Vec<EditOperation> = serde_json::from_str(json).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[1].target_value(9), 9);
    }
}
