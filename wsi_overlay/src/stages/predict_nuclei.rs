//! PredictNuclei stage code
//!
//! Hand every tissue tile of a slide to the nucleus segmentation model in one
//! invocation. The model writes one artifact per tile into `result/`.
#![allow(missing_docs)]

use crate::nucleus::NucleusSegmentor;
use crate::outcome::StageName;
use crate::run_log::RunLog;
use crate::stages::SlideStage;
use crate::SlideLayout;
use anyhow::{Context, Result};
use serde::Serialize;
use slide_io::manifest::scan_coord_files;
use slide_io::tile_name::ARTIFACT_EXTENSION;
use slide_io::{PipelineError, TileSet};
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct PredictNuclei<'a> {
    segmentor: &'a dyn NucleusSegmentor,
}

impl<'a> PredictNuclei<'a> {
    pub fn new(segmentor: &'a dyn NucleusSegmentor) -> Self {
        PredictNuclei { segmentor }
    }
}

fn write_tile_list(path: &Path, tiles: &TileSet) -> Result<()> {
    let mut writer =
        BufWriter::new(File::create(path).with_context(|| format!("While creating {path:?}"))?);
    for record in tiles.tiles() {
        writeln!(writer, "{}", tiles.path_of(record).display())?;
    }
    writer.flush()?;
    Ok(())
}

/// Remove artifacts left by an earlier run so every artifact in `result_dir`
/// belongs to the current tissue tiles.
fn clear_stale_artifacts(result_dir: &Path) -> Result<usize> {
    let stale = scan_coord_files(result_dir, ARTIFACT_EXTENSION)?;
    for (_, path) in &stale {
        std::fs::remove_file(path).with_context(|| format!("While removing {path:?}"))?;
    }
    Ok(stale.len())
}

/// Whether extraction left at least one tissue tile for the slide.
pub fn has_tissue(layout: &SlideLayout) -> Result<bool> {
    let cell_dir = layout.cell_dir();
    Ok(cell_dir.is_dir() && !TileSet::load(&cell_dir)?.is_empty())
}

impl SlideStage for PredictNuclei<'_> {
    type StageOutputs = PredictNucleiOutputs;

    fn name(&self) -> StageName {
        StageName::Predict
    }

    fn run(&self, layout: &SlideLayout, log: &RunLog) -> Result<PredictNucleiOutputs> {
        let cell_dir = layout.cell_dir();
        if !cell_dir.is_dir() {
            return Err(PipelineError::MissingArtifact(format!(
                "{cell_dir:?} does not exist, extract patches first"
            ))
            .into());
        }
        let tiles = TileSet::load(&cell_dir)?;
        if tiles.is_empty() {
            log.warn(&format!("No tiles found for file id: {}", layout.id_name()));
            return Err(PipelineError::MissingArtifact(format!(
                "no tissue tiles in {cell_dir:?}"
            ))
            .into());
        }

        let tile_list = layout.tile_list_path();
        write_tile_list(&tile_list, &tiles)?;
        let result_dir = layout.result_dir();
        std::fs::create_dir_all(&result_dir)
            .with_context(|| format!("While creating {result_dir:?}"))?;
        let stale = clear_stale_artifacts(&result_dir)?;
        if stale > 0 {
            log.info(&format!("Removed {stale} artifacts of a previous run"));
        }

        log.info(&format!(
            "Segmenting {} tiles of {}",
            tiles.len(),
            layout.id_name()
        ));
        self.segmentor
            .segment(&tile_list, &result_dir)
            .with_context(|| format!("Prediction failed for file: {}", layout.id_name()))?;
        log.info(&format!(
            "Prediction completed successfully for file: {}",
            layout.id_name()
        ));

        Ok(PredictNucleiOutputs {
            tiles: tiles.len(),
            tile_list,
            result_dir,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictNucleiOutputs {
    pub tiles: usize,
    pub tile_list: PathBuf,
    pub result_dir: PathBuf,
}

impl Display for PredictNucleiOutputs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Segmented {} tissue tiles", self.tiles)
    }
}
