// ============================================================================
// PERSISTED SETTINGS
// ============================================================================

use std::path::{Path, PathBuf};

use crate::ops::synthesize::Connectivity;

/// User defaults for new sessions and generated tile lists.
/// Stored as `key=value` lines; unknown keys are ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Class code that means "unclassified". `None` defers to the symbology.
    pub null_value: Option<u16>,
    pub connectivity: Connectivity,
    /// Region count above which synthesis emits a `SizeWarning`.
    pub region_warning_threshold: usize,
    pub tile_height: u32,
    pub tile_width: u32,
    /// Overlap between neighbouring generated tiles, 0..100.
    pub overlap_percent: f64,
    /// Brush and eraser diameter in pixels.
    pub brush_width: u32,
    pub max_undo_steps: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            null_value: None,
            connectivity: Connectivity::Eight,
            region_warning_threshold: 10_000,
            tile_height: 256,
            tile_width: 256,
            overlap_percent: 10.0,
            brush_width: 3,
            max_undo_steps: 50,
        }
    }
}

impl Settings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/masktile/masktile_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\MaskTile\masktile_settings.cfg
    /// On macOS:   ~/Library/Application Support/MaskTile/masktile_settings.cfg
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("MaskTile").join("masktile_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("MaskTile")
                    .join("masktile_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
                .ok()?;
            Some(config_dir.join("masktile").join("masktile_settings.cfg"))
        }
    }

    /// Load from the default location (defaults if missing or unreadable).
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        match Self::settings_path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else { return Self::default() };
        Self::parse(&content)
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config())
    }

    pub fn to_config(&self) -> String {
        let null_str = self.null_value.map(|v| v.to_string()).unwrap_or_else(|| "auto".to_string());
        let conn_str = match self.connectivity {
            Connectivity::Four => "4",
            Connectivity::Eight => "8",
        };
        format!(
            "null_value={null_str}\n\
             connectivity={conn_str}\n\
             region_warning_threshold={}\n\
             tile_height={}\n\
             tile_width={}\n\
             overlap_percent={}\n\
             brush_width={}\n\
             max_undo_steps={}\n",
            self.region_warning_threshold,
            self.tile_height,
            self.tile_width,
            self.overlap_percent,
            self.brush_width,
            self.max_undo_steps,
        )
    }

    /// Parse `key=value` content. Bad values fall back to the default.
    pub fn parse(content: &str) -> Self {
        let d = Self::default();
        let mut s = Self::default();
        for line in content.lines() {
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "null_value" => {
                    s.null_value = val.parse().ok();
                }
                "connectivity" => {
                    s.connectivity = match val {
                        "4" => Connectivity::Four,
                        _ => Connectivity::Eight,
                    };
                }
                "region_warning_threshold" => {
                    s.region_warning_threshold = val.parse().unwrap_or(d.region_warning_threshold);
                }
                "tile_height" => {
                    s.tile_height = val.parse().ok().filter(|&v| v > 0).unwrap_or(d.tile_height);
                }
                "tile_width" => {
                    s.tile_width = val.parse().ok().filter(|&v| v > 0).unwrap_or(d.tile_width);
                }
                "overlap_percent" => {
                    s.overlap_percent = val
                        .parse()
                        .ok()
                        .filter(|v: &f64| (0.0..100.0).contains(v))
                        .unwrap_or(d.overlap_percent);
                }
                "brush_width" => {
                    s.brush_width = val.parse().ok().filter(|&v| v > 0).unwrap_or(d.brush_width);
                }
                "max_undo_steps" => {
                    s.max_undo_steps = val.parse().unwrap_or(d.max_undo_steps);
                }
                _ => {}
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_text_round_trips() {
        let s = Settings {
            null_value: Some(255),
            connectivity: Connectivity::Four,
            region_warning_threshold: 400,
            tile_height: 128,
            tile_width: 96,
            overlap_percent: 25.0,
            brush_width: 5,
            max_undo_steps: 10,
        };
        assert_eq!(Settings::parse(&s.to_config()), s);
    }

    #[test]
    fn corrupt_values_fall_back_to_defaults() {
        let s = Settings::parse("tile_height=0\noverlap_percent=140\nbrush_width=nan\nnonsense\nnull_value=auto\n");
        let d = Settings::default();
        assert_eq!(s.tile_height, d.tile_height);
        assert_eq!(s.overlap_percent, d.overlap_percent);
        assert_eq!(s.brush_width, d.brush_width);
        assert_eq!(s.null_value, None);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load_from(&dir.path().join("absent.cfg"));
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn save_to_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("masktile_settings.cfg");
        let mut s = Settings::default();
        s.null_value = Some(0);
        s.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path).null_value, Some(0));
    }
}
