//! Tiled editing of categorical mask rasters.
//!
//! A mask is edited one tile at a time: the tile window is read from the
//! backing raster, turned into one polygon per connected class region, edited
//! with brush / erase / fill / draw operations and rasterized back. A CSV tile
//! list records which tiles are complete, and two independently edited masks
//! can be merged tile by tile.

#[macro_use]
pub mod logger;

pub mod cli;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod ops;
pub mod raster;
pub mod session;
pub mod settings;
pub mod symbology;
pub mod tiles;
pub mod vector;

pub use error::{MaskError, MaskResult, SizeWarning};
