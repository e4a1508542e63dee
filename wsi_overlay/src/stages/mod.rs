#![allow(missing_docs)]

use crate::outcome::StageName;
use crate::run_log::RunLog;
use crate::SlideLayout;
use anyhow::Result;
use std::fmt::Display;

pub mod count_nuclei;
pub mod extract_patches;
pub mod merge_tiles;
pub mod predict_nuclei;

/// One step of the per-slide pipeline.
pub trait SlideStage {
    /// Summary of a successful run. Its `Display` form becomes the outcome
    /// message.
    type StageOutputs: Display;

    fn name(&self) -> StageName;

    fn run(&self, layout: &SlideLayout, log: &RunLog) -> Result<Self::StageOutputs>;
}
