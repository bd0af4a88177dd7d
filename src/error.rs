// ============================================================================
// ERRORS AND ADVISORIES
// ============================================================================

use std::fmt;
use std::path::Path;

/// Every fallible core operation returns this.
#[derive(Debug)]
pub enum MaskError {
    /// Malformed tile list or incompatible raster inputs.
    Format {
        source: String,
        line: Option<usize>,
        message: String,
    },
    /// Nothing covers the requested point, or a path / key does not resolve.
    NotFound(String),
    /// Degenerate or self-intersecting edit geometry. The edit is not applied.
    Geometry(String),
    /// Raster decode/encode failure or out-of-range pixel data.
    Raster(String),
    Io(std::io::Error),
    Json(String),
}

pub type MaskResult<T> = Result<T, MaskError>;

impl MaskError {
    pub fn format(source: impl AsRef<Path>, line: Option<usize>, message: impl Into<String>) -> Self {
        MaskError::Format {
            source: source.as_ref().display().to_string(),
            line,
            message: message.into(),
        }
    }

    pub fn geometry(message: impl Into<String>) -> Self {
        MaskError::Geometry(message.into())
    }
}

impl fmt::Display for MaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskError::Format { source, line: Some(line), message } => {
                write!(f, "Invalid format in {} (line {}): {}", source, line, message)
            }
            MaskError::Format { source, line: None, message } => {
                write!(f, "Invalid format in {}: {}", source, message)
            }
            MaskError::NotFound(e) => write!(f, "Not found: {}", e),
            MaskError::Geometry(e) => write!(f, "Invalid geometry: {}", e),
            MaskError::Raster(e) => write!(f, "Raster error: {}", e),
            MaskError::Io(e) => write!(f, "I/O error: {}", e),
            MaskError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for MaskError {}

impl From<std::io::Error> for MaskError {
    fn from(e: std::io::Error) -> Self {
        MaskError::Io(e)
    }
}

impl From<tiff::TiffError> for MaskError {
    fn from(e: tiff::TiffError) -> Self {
        MaskError::Raster(e.to_string())
    }
}

impl From<serde_json::Error> for MaskError {
    fn from(e: serde_json::Error) -> Self {
        MaskError::Json(e.to_string())
    }
}

impl From<image::ImageError> for MaskError {
    fn from(e: image::ImageError) -> Self {
        MaskError::Raster(e.to_string())
    }
}

// ============================================================================
// ADVISORIES (returned, never raised)
// ============================================================================

/// Emitted when a tile synthesizes into more regions than is practical to
/// edit interactively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeWarning {
    pub regions: usize,
    pub threshold: usize,
}

impl fmt::Display for SizeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tile produced {} regions (threshold {}); consider smaller tiles",
            self.regions, self.threshold
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_error_mentions_path_and_line() {
        let e = MaskError::format("tiles/list.csv", Some(4), "height must be positive");
        let msg = e.to_string();
        assert!(msg.contains("tiles/list.csv"));
        assert!(msg.contains("line 4"));
        assert!(msg.contains("height must be positive"));
    }

    #[test]
    fn io_error_converts() {
        let e: MaskError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(e, MaskError::Io(_)));
    }
}
