//!
//! Geometry and raster IO for whole-slide images split into tiles:
//! the extraction grid, the `<x>_<y>` tile naming convention, tile manifests,
//! level-0 slide readers and the banded canvas used to stitch tiles back
//! together without holding the full-resolution image in memory.
//!
#![deny(missing_docs)]

/// Banded canvas writer and streaming crop/downsample
pub mod canvas;

/// Error kinds shared by every step of the pipeline
pub mod error;

/// Extraction grid over a slide
pub mod grid;

/// Typed tile records and the manifest sidecar
pub mod manifest;

/// Level-0 slide readers
pub mod slide;

/// Tile coordinates and the file naming convention
pub mod tile_name;

pub use error::{ErrorKind, PipelineError};
pub use grid::{GridCell, PatchGrid};
pub use manifest::{TileManifest, TileRecord, TileSet};
pub use slide::{open_slide, slide_dims, SlideDims, SlideFormat, SlideReader, TiffSlide};
pub use tile_name::TileCoord;
