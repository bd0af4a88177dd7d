pub mod edit;
pub mod merge;
pub mod rasterize;
pub mod synthesize;
