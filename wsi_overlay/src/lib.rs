//!
//! Tiling, nucleus counting and overlay stitching for whole-slide images.
//!
//! A slide is split into patches (`stages::extract_patches`), tissue patches
//! are handed to an external nucleus segmentation model
//! (`stages::predict_nuclei`), the model's per-tile records are tallied and
//! drawn onto the tiles (`stages::count_nuclei`), and the blank and overlay
//! tiles are stitched back into one downsampled image
//! (`stages::merge_tiles`). [`pipeline`] runs these steps per slide and turns
//! every failure into a [`outcome::StageOutcome`].
//!
#![deny(missing_docs)]

/// Directory and file layout of one processed slide
pub mod layout;

/// Coordinate/type and nucleus count ledgers
pub mod ledger;

/// Nucleus classes and the segmentation model interface
pub mod nucleus;

/// Structured per-step outcome records
pub mod outcome;

/// Contour overlay rendering
pub mod overlay;

/// Per-slide step runner
pub mod pipeline;

/// Append-only per-slide run log
pub mod run_log;

/// Pipeline stages
pub mod stages;

/// Stain normalization of tissue patches
pub mod stain_norm;

pub use layout::SlideLayout;
pub use outcome::{StageOutcome, StageStatus};
pub use run_log::RunLog;
