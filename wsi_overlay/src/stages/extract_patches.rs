//! ExtractPatches stage code
//!
//! Cut the level-0 plane of a slide into a grid of patches, label each patch
//! as tissue ("cell") or blank from its texture, stain-normalize the tissue
//! patches and write every patch to `cell/` or `blank/` with a coordinate
//! ledger.
#![allow(missing_docs)]

use crate::ledger::{PatchLabel, PatchLedgerWriter, PatchRow};
use crate::outcome::StageName;
use crate::run_log::RunLog;
use crate::stages::SlideStage;
use crate::stain_norm::{fitted_normalizer, StainNormalizer};
use crate::SlideLayout;
use anyhow::{Context, Result};
use image::RgbImage;
use serde::Serialize;
use slide_io::{open_slide, PatchGrid, SlideReader, TileCoord, TileManifest, TileRecord};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use wsi_parameters::{NormMethod, Parameters, TextureStatistic};

/// Population mean and standard deviation.
fn mean_std(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (mut n, mut sum, mut sum_sq) = (0.0, 0.0, 0.0);
    for v in values {
        n += 1.0;
        sum += v;
        sum_sq += v * v;
    }
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = sum / n;
    (mean, (sum_sq / n - mean * mean).max(0.0).sqrt())
}

/// Scalar measure of how much a patch varies; flat background scores near 0.
pub fn texture_statistic(patch: &RgbImage, statistic: TextureStatistic) -> f64 {
    match statistic {
        TextureStatistic::ChannelStd => {
            let stds = [0, 1, 2].map(|c| mean_std(patch.pixels().map(|px| f64::from(px[c]))).1);
            stds.iter().sum::<f64>() / 3.0
        }
        TextureStatistic::PixelChromaStd => {
            mean_std(
                patch
                    .pixels()
                    .map(|px| mean_std(px.0.iter().map(|&v| f64::from(v))).1),
            )
            .0
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractPatches {
    patch_size: u32,
    threshold_std: f64,
    statistic: TextureStatistic,
    norm_method: NormMethod,
    stain_target: Option<PathBuf>,
}

impl ExtractPatches {
    pub fn new(params: &Parameters) -> Self {
        ExtractPatches {
            patch_size: params.patch_size,
            threshold_std: params.threshold_std,
            statistic: params.texture_statistic,
            norm_method: params.norm_method,
            stain_target: params.stain_target.clone(),
        }
    }

    pub fn classify(&self, patch: &RgbImage) -> PatchLabel {
        PatchLabel::classify(texture_statistic(patch, self.statistic), self.threshold_std)
    }

    /// Extract every patch of `slide` into the directories of `layout`.
    pub fn extract(
        &self,
        slide: &mut dyn SlideReader,
        normalizer: &dyn StainNormalizer,
        layout: &SlideLayout,
        log: &RunLog,
    ) -> Result<ExtractPatchesOutputs> {
        let dims = slide.dims();
        log.info(&format!("Image dimensions: {}x{}", dims.width, dims.height));
        layout.create_dirs()?;

        let grid = PatchGrid::new(dims.width, dims.height, self.patch_size)?;
        let ledger_path = layout.patch_ledger_path();
        let mut ledger = PatchLedgerWriter::create(&ledger_path, dims.width, dims.height)?;
        let (blank_dir, cell_dir) = (layout.blank_dir(), layout.cell_dir());
        let mut blank_manifest = TileManifest::default();
        let mut cell_manifest = TileManifest::default();
        let mut outputs = ExtractPatchesOutputs {
            slide_width: dims.width,
            slide_height: dims.height,
            total_patches: 0,
            patches_with_cells: 0,
            patches_without_cells: 0,
            patch_ledger: ledger_path.clone(),
        };

        for cell in grid.cells() {
            let coord = TileCoord::new(cell.x, cell.y);
            let patch = slide
                .read_region(cell.x, cell.y, cell.width, cell.height)
                .with_context(|| format!("While reading patch {} at ({coord})", cell.index))?;
            let label = self.classify(&patch);

            let (patch, dir, manifest) = match label {
                PatchLabel::Cell => {
                    outputs.patches_with_cells += 1;
                    let normalized = normalizer
                        .transform(&patch)
                        .with_context(|| format!("While normalizing patch at ({coord})"))?;
                    (normalized, &cell_dir, &mut cell_manifest)
                }
                PatchLabel::Blank => {
                    outputs.patches_without_cells += 1;
                    (patch, &blank_dir, &mut blank_manifest)
                }
            };
            let file_name = coord.tile_file_name(layout.id_name());
            let path = dir.join(&file_name);
            patch
                .save(&path)
                .with_context(|| format!("While writing patch at ({coord}) to {path:?}"))?;
            manifest.push(TileRecord {
                tile_id: coord.tile_stem(layout.id_name()),
                x: cell.x,
                y: cell.y,
                width: cell.width,
                height: cell.height,
                file_name,
            });

            outputs.total_patches += 1;
            ledger.append(&PatchRow {
                index: cell.index,
                x: cell.x,
                y: cell.y,
                label,
            })?;
        }
        ledger.finish()?;
        blank_manifest.write(&blank_dir)?;
        cell_manifest.write(&cell_dir)?;

        log.info(&outputs.to_string());
        Ok(outputs)
    }
}

impl SlideStage for ExtractPatches {
    type StageOutputs = ExtractPatchesOutputs;

    fn name(&self) -> StageName {
        StageName::Patch
    }

    fn run(&self, layout: &SlideLayout, log: &RunLog) -> Result<ExtractPatchesOutputs> {
        let mut slide = open_slide(layout.slide_path())?;
        let normalizer = fitted_normalizer(self.norm_method, self.stain_target.as_deref())?;
        self.extract(&mut slide, normalizer.as_ref(), layout, log)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractPatchesOutputs {
    pub slide_width: u32,
    pub slide_height: u32,
    pub total_patches: u64,
    pub patches_with_cells: u64,
    pub patches_without_cells: u64,
    pub patch_ledger: PathBuf,
}

impl Display for ExtractPatchesOutputs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Total patches: {}, with cells: {}, without cells: {}",
            self.total_patches, self.patches_with_cells, self.patches_without_cells
        )
    }
}
