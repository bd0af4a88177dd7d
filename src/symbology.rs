// ============================================================================
// CLASS SYMBOLOGY: value -> (label, colour) tables, one per band
// ============================================================================

use std::collections::BTreeSet;
use std::fmt;

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{MaskError, MaskResult};
use crate::grid::Band;
use crate::log_warn;

/// Slots allocated up front, one per byte value.
pub const CLASS_SLOTS: usize = 256;

/// Colour of the null class and of values without a definition.
pub const NULL_COLOR: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Cycled when a class is defined without an explicit colour.
const PALETTE: [[u8; 3]; 20] = [
    [31, 119, 180],
    [255, 127, 14],
    [44, 160, 44],
    [214, 39, 40],
    [148, 103, 189],
    [140, 86, 75],
    [227, 119, 194],
    [127, 127, 127],
    [188, 189, 34],
    [23, 190, 207],
    [174, 199, 232],
    [255, 187, 120],
    [152, 223, 138],
    [255, 152, 150],
    [197, 176, 213],
    [196, 156, 148],
    [247, 182, 210],
    [199, 199, 199],
    [219, 219, 141],
    [158, 218, 229],
];

#[derive(Clone, Debug, PartialEq)]
pub struct ClassDefinition {
    pub label: String,
    pub color: Rgba<u8>,
    pub is_null: bool,
}

/// Which definitions a removal targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovalCriterion {
    LargerThan(u16),
    SmallerThan(u16),
    /// Every defined value not present in the given set.
    Absent(BTreeSet<u16>),
    /// Every defined value except this one.
    AllExcept(u16),
}

/// Issued before a removal is applied: removed definitions may still be
/// carried by pixels, which then render as unmapped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestructiveWarning {
    pub band: usize,
    pub values: Vec<u16>,
    /// Removed values that still occur in the inspected pixels.
    pub orphaned: Vec<u16>,
}

impl fmt::Display for DestructiveWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "removing {} class definition(s) from band {}; {} of them still label pixels",
            self.values.len(),
            self.band + 1,
            self.orphaned.len()
        )
    }
}

/// A confirmed-but-not-applied removal. Pass back to `apply_removal`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovalPlan {
    pub warning: DestructiveWarning,
}

// ============================================================================
// CLASS TABLE
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct ClassTable {
    slots: Vec<Option<ClassDefinition>>,
    next_color: usize,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None; CLASS_SLOTS],
            next_color: 0,
        }
    }

    fn slot_mut(&mut self, value: u16) -> &mut Option<ClassDefinition> {
        let idx = value as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
        &mut self.slots[idx]
    }

    fn defined_mut(&mut self, value: u16) -> MaskResult<&mut ClassDefinition> {
        self.slots
            .get_mut(value as usize)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| undefined(value))
    }

    fn palette_color(&mut self) -> Rgba<u8> {
        let [r, g, b] = PALETTE[self.next_color % PALETTE.len()];
        self.next_color += 1;
        Rgba([r, g, b, 255])
    }

    pub fn get(&self, value: u16) -> Option<&ClassDefinition> {
        self.slots.get(value as usize).and_then(|s| s.as_ref())
    }

    pub fn contains(&self, value: u16) -> bool {
        self.get(value).is_some()
    }

    /// Defined values in ascending order.
    pub fn values(&self) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(v, _)| v as u16)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn null_value(&self) -> Option<u16> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|d| d.is_null))
            .map(|v| v as u16)
    }

    /// Define or overwrite a class. A missing colour takes the next palette entry.
    pub fn define(&mut self, value: u16, label: impl Into<String>, color: Option<Rgba<u8>>) {
        let color = match color {
            Some(c) => c,
            None => self.palette_color(),
        };
        let is_null = self.get(value).is_some_and(|d| d.is_null);
        *self.slot_mut(value) = Some(ClassDefinition { label: label.into(), color, is_null });
    }

    /// Define `value` with an empty label if it is not defined yet.
    pub fn ensure(&mut self, value: u16) -> bool {
        if self.contains(value) {
            return false;
        }
        self.define(value, "", None);
        true
    }

    pub fn relabel(&mut self, value: u16, label: impl Into<String>) -> MaskResult<()> {
        let def = self.defined_mut(value)?;
        def.label = label.into();
        Ok(())
    }

    pub fn recolor(&mut self, value: u16, color: Rgba<u8>) -> MaskResult<()> {
        let def = self.defined_mut(value)?;
        def.color = color;
        Ok(())
    }

    /// Designate the null class. The previous null entry stays as a plain class.
    pub fn set_null(&mut self, value: u16) {
        for def in self.slots.iter_mut().flatten() {
            def.is_null = false;
        }
        if let Some(def) = self.slot_mut(value).as_mut() {
            def.is_null = true;
        } else {
            *self.slot_mut(value) = Some(ClassDefinition { label: "NULL".into(), color: NULL_COLOR, is_null: true });
        }
    }

    /// Label for display; unmapped values have none.
    pub fn label(&self, value: u16) -> Option<&str> {
        self.get(value).map(|d| d.label.as_str())
    }

    /// Render colour; unmapped values use `NULL_COLOR`.
    pub fn color(&self, value: u16) -> Rgba<u8> {
        self.get(value).map_or(NULL_COLOR, |d| if d.is_null { NULL_COLOR } else { d.color })
    }

    fn removal_targets(&self, criterion: &RemovalCriterion) -> Vec<u16> {
        let null = self.null_value();
        self.values()
            .into_iter()
            .filter(|&v| Some(v) != null)
            .filter(|&v| match criterion {
                RemovalCriterion::LargerThan(t) => v > *t,
                RemovalCriterion::SmallerThan(t) => v < *t,
                RemovalCriterion::Absent(present) => !present.contains(&v),
                RemovalCriterion::AllExcept(keep) => v != *keep,
            })
            .collect()
    }

    /// Forget definitions; pixels are never touched. The null class is kept.
    fn remove(&mut self, values: &[u16]) -> usize {
        let null = self.null_value();
        let mut removed = 0;
        for &v in values {
            if Some(v) == null {
                continue;
            }
            if let Some(slot) = self.slots.get_mut(v as usize)
                && slot.take().is_some()
            {
                removed += 1;
            }
        }
        removed
    }

    /// A tile's colour preview; unmapped and null cells are transparent.
    pub fn render(&self, band: &Band) -> RgbaImage {
        RgbaImage::from_fn(band.width(), band.height(), |x, y| self.color(band.get_pixel(x, y).0[0]))
    }

    /// Combine two tables: `a` wins, `b` fills gaps, values seen only in
    /// `present` get a palette colour. The null class is `a`'s, else `b`'s,
    /// else 0 when free, else one above the largest value.
    pub fn merge(a: &ClassTable, b: &ClassTable, present: &BTreeSet<u16>) -> ClassTable {
        let mut out = ClassTable::new();
        let mut all: BTreeSet<u16> = present.clone();
        all.extend(a.values());
        all.extend(b.values());

        for &v in &all {
            if let Some(def) = a.get(v).or_else(|| b.get(v)) {
                *out.slot_mut(v) = Some(ClassDefinition { is_null: false, ..def.clone() });
                out.next_color += 1;
            } else {
                out.define(v, "", None);
            }
        }

        let null = a.null_value().or_else(|| b.null_value()).unwrap_or_else(|| {
            let defined: BTreeSet<u16> = a.values().into_iter().chain(b.values()).collect();
            if !defined.contains(&0) {
                0
            } else {
                all.iter().next_back().map_or(0, |m| m.saturating_add(1))
            }
        });
        out.set_null(null);
        out
    }
}

fn undefined(value: u16) -> MaskError {
    MaskError::NotFound(format!("class {} is not defined", value))
}

// ============================================================================
// PER-BAND SYMBOLOGY
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct Symbology {
    bands: Vec<(String, ClassTable)>,
}

impl Symbology {
    pub fn new(band_names: &[String]) -> Self {
        Self {
            bands: band_names.iter().map(|n| (n.clone(), ClassTable::new())).collect(),
        }
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn table(&self, band: usize) -> MaskResult<&ClassTable> {
        self.bands
            .get(band)
            .map(|(_, t)| t)
            .ok_or_else(|| MaskError::NotFound(format!("symbology for band {}", band + 1)))
    }

    pub fn table_mut(&mut self, band: usize) -> MaskResult<&mut ClassTable> {
        self.bands
            .get_mut(band)
            .map(|(_, t)| t)
            .ok_or_else(|| MaskError::NotFound(format!("symbology for band {}", band + 1)))
    }

    /// Reorder / fill so there is exactly one table per band name.
    pub fn aligned_to(mut self, band_names: &[String]) -> Symbology {
        let bands = band_names
            .iter()
            .map(|name| {
                let table = self
                    .bands
                    .iter()
                    .position(|(n, _)| n == name)
                    .map(|i| self.bands.swap_remove(i).1)
                    .unwrap_or_default();
                (name.clone(), table)
            })
            .collect();
        Symbology { bands }
    }

    /// First step of a removal: work out what would go and warn about it.
    /// `present` is the set of values currently carried by pixels.
    pub fn plan_removal(
        &self,
        band: usize,
        criterion: &RemovalCriterion,
        present: &BTreeSet<u16>,
    ) -> MaskResult<RemovalPlan> {
        let values = self.table(band)?.removal_targets(criterion);
        let orphaned = values.iter().copied().filter(|v| present.contains(v)).collect();
        let warning = DestructiveWarning { band, values, orphaned };
        if !warning.values.is_empty() {
            log_warn!("{}", warning);
        }
        Ok(RemovalPlan { warning })
    }

    /// Second step: drop the planned definitions. Returns how many went.
    pub fn apply_removal(&mut self, plan: RemovalPlan) -> MaskResult<usize> {
        let band = plan.warning.band;
        Ok(self.table_mut(band)?.remove(&plan.warning.values))
    }

    /// Band-wise merge; see `ClassTable::merge`. `present[i]` is the value
    /// set of band i in the merged raster.
    pub fn merge(a: &Symbology, b: &Symbology, band_names: &[String], present: &[BTreeSet<u16>]) -> Symbology {
        let empty = ClassTable::new();
        let bands = band_names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let ta = a.bands.get(i).map_or(&empty, |(_, t)| t);
                let tb = b.bands.get(i).map_or(&empty, |(_, t)| t);
                let values = present.get(i).cloned().unwrap_or_default();
                (name.clone(), ClassTable::merge(ta, tb, &values))
            })
            .collect();
        Symbology { bands }
    }

    // ------------------------------------------------------------------------
    // Persistence (JSON, embedded in raster metadata)
    // ------------------------------------------------------------------------

    pub fn to_json(&self) -> MaskResult<String> {
        let doc = SymbologyDoc {
            bands: self
                .bands
                .iter()
                .map(|(name, table)| BandDoc {
                    name: name.clone(),
                    classes: table
                        .values()
                        .into_iter()
                        .filter_map(|v| table.get(v).map(|d| (v, d)))
                        .map(|(value, d)| ClassDoc {
                            value,
                            label: d.label.clone(),
                            color: color_to_hex(d.color),
                            null: d.is_null,
                        })
                        .collect(),
                })
                .collect(),
        };
        Ok(serde_json::to_string(&doc)?)
    }

    pub fn from_json(text: &str) -> MaskResult<Symbology> {
        let doc: SymbologyDoc = serde_json::from_str(text)?;
        let mut bands = Vec::with_capacity(doc.bands.len());
        for band in doc.bands {
            let mut table = ClassTable::new();
            let mut null = None;
            for class in band.classes {
                let color = hex_to_color(&class.color)
                    .ok_or_else(|| MaskError::Json(format!("bad colour '{}' for class {}", class.color, class.value)))?;
                table.define(class.value, class.label, Some(color));
                if class.null {
                    null = Some(class.value);
                }
            }
            if let Some(v) = null {
                table.set_null(v);
            }
            table.next_color = table.len();
            bands.push((band.name, table));
        }
        Ok(Symbology { bands })
    }
}

#[derive(Serialize, Deserialize)]
struct SymbologyDoc {
    bands: Vec<BandDoc>,
}

#[derive(Serialize, Deserialize)]
struct BandDoc {
    name: String,
    classes: Vec<ClassDoc>,
}

#[derive(Serialize, Deserialize)]
struct ClassDoc {
    value: u16,
    label: String,
    color: String,
    #[serde(default)]
    null: bool,
}

/// "#rrggbbaa"
pub fn color_to_hex(c: Rgba<u8>) -> String {
    format!("#{:02x}{:02x}{:02x}{:02x}", c.0[0], c.0[1], c.0[2], c.0[3])
}

/// Accepts "#rrggbb" and "#rrggbbaa".
pub fn hex_to_color(s: &str) -> Option<Rgba<u8>> {
    let hex = s.strip_prefix('#')?;
    if !hex.is_ascii() {
        return None;
    }
    let byte = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    match hex.len() {
        6 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, 255])),
        8 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
        _ => None,
    }
}
