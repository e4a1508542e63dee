//! MergeTiles stage code
//!
//! Stitch the blank tiles and the overlay tiles of a slide back into one
//! image, crop it to the slide's level-0 size and shrink it. The full
//! resolution composite only ever exists as a temporary PNG that is written
//! and read back in row bands.
#![allow(missing_docs)]

use crate::outcome::StageName;
use crate::run_log::RunLog;
use crate::stages::SlideStage;
use crate::SlideLayout;
use anyhow::{bail, Context, Result};
use image::ImageFormat;
use serde::Serialize;
use slide_io::canvas::{crop_and_downsample, BandedCanvasWriter};
use slide_io::{slide_dims, PipelineError, SlideDims, TileRecord, TileSet};
use std::fmt::{Display, Formatter};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use wsi_parameters::Parameters;

/// Bounding box of a tile set and the canvas that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CanvasGeometry {
    pub min_x: u32,
    pub min_y: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub width: u32,
    pub height: u32,
}

impl CanvasGeometry {
    /// `tiles` must be sorted by `(y, x)`. The nominal tile size is the size
    /// of the first tile; smaller tiles are accepted, larger ones cannot be
    /// placed.
    pub fn of_tiles(tiles: &[(TileRecord, PathBuf)]) -> Result<Self> {
        let Some((first, _)) = tiles.first() else {
            bail!(PipelineError::GeometryViolation(
                "no tiles to merge".to_string()
            ));
        };
        let (tile_width, tile_height) = (first.width, first.height);
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0, 0);
        for (tile, path) in tiles {
            if tile.width > tile_width || tile.height > tile_height {
                bail!(PipelineError::GeometryViolation(format!(
                    "{path:?} is {}x{}, larger than the {tile_width}x{tile_height} tile size",
                    tile.width, tile.height
                )));
            }
            min_x = min_x.min(tile.x);
            min_y = min_y.min(tile.y);
            max_x = max_x.max(tile.x);
            max_y = max_y.max(tile.y);
        }
        let width = (max_x - min_x)
            .checked_add(tile_width)
            .context("canvas width overflows")?;
        let height = (max_y - min_y)
            .checked_add(tile_height)
            .context("canvas height overflows")?;
        Ok(CanvasGeometry {
            min_x,
            min_y,
            tile_width,
            tile_height,
            width,
            height,
        })
    }
}

/// Blank and overlay tiles together, in compositing order.
pub fn load_merge_tiles(layout: &SlideLayout) -> Result<Vec<(TileRecord, PathBuf)>> {
    let mut tiles = Vec::new();
    for dir in [layout.blank_dir(), layout.overlay_dir()] {
        if dir.is_dir() {
            tiles.extend(TileSet::load(&dir)?.into_placed());
        }
    }
    // stable: on equal coordinates the overlay is drawn last
    tiles.sort_by_key(|(tile, _)| tile.coord().row_major_key());
    Ok(tiles)
}

fn write_png_atomically(image: &image::RgbImage, path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::Builder::new()
        .prefix(".merge")
        .suffix(".png")
        .tempfile_in(dir)
        .with_context(|| format!("While staging {path:?}"))?;
    let mut writer = BufWriter::new(staged.as_file_mut());
    image
        .write_to(&mut writer, ImageFormat::Png)
        .with_context(|| format!("While encoding {path:?}"))?;
    writer.flush()?;
    drop(writer);
    staged
        .persist(path)
        .with_context(|| format!("While moving the merged image to {path:?}"))?;
    Ok(())
}

pub struct MergeTiles {
    downsample_factor: u32,
}

impl MergeTiles {
    pub fn new(params: &Parameters) -> Self {
        MergeTiles {
            downsample_factor: params.downsample_factor,
        }
    }

    /// Merge the tiles of `layout` for a slide of size `slide`.
    pub fn merge(
        &self,
        layout: &SlideLayout,
        slide: SlideDims,
        log: &RunLog,
    ) -> Result<MergeTilesOutputs> {
        let tiles = load_merge_tiles(layout)?;
        let geometry = CanvasGeometry::of_tiles(&tiles)?;
        log.info(&format!(
            "Tile size of {}: {}x{}",
            layout.id_name(),
            geometry.tile_width,
            geometry.tile_height
        ));
        log.info(&format!(
            "Full image size: {}x{}",
            geometry.width, geometry.height
        ));

        let temp_path = layout.merge_temp_path();
        let mut canvas = BandedCanvasWriter::create(
            &temp_path,
            geometry.width,
            geometry.height,
            geometry.tile_height,
        )?;
        for (tile, path) in &tiles {
            let pixels = image::open(path)
                .with_context(|| format!("While reading tile {path:?}"))?
                .to_rgb8();
            if pixels.width() > geometry.tile_width || pixels.height() > geometry.tile_height {
                bail!(PipelineError::GeometryViolation(format!(
                    "{path:?} is {}x{}, larger than the {}x{} tile size",
                    pixels.width(),
                    pixels.height(),
                    geometry.tile_width,
                    geometry.tile_height
                )));
            }
            canvas.paste(tile.x - geometry.min_x, tile.y - geometry.min_y, pixels)?;
        }
        canvas.finish()?;

        let merged = crop_and_downsample(
            &temp_path,
            slide.width,
            slide.height,
            self.downsample_factor,
        )?;
        let merged_path = layout.merged_path();
        write_png_atomically(&merged, &merged_path)?;
        std::fs::remove_file(&temp_path)
            .with_context(|| format!("While removing {temp_path:?}"))?;
        log.info("Temp file removed");

        let outputs = MergeTilesOutputs {
            tiles: tiles.len(),
            canvas_width: geometry.width,
            canvas_height: geometry.height,
            width: merged.width(),
            height: merged.height(),
            merged: merged_path,
        };
        log.info(&outputs.to_string());
        Ok(outputs)
    }
}

impl SlideStage for MergeTiles {
    type StageOutputs = MergeTilesOutputs;

    fn name(&self) -> StageName {
        StageName::Merge
    }

    fn run(&self, layout: &SlideLayout, log: &RunLog) -> Result<MergeTilesOutputs> {
        let dims = slide_dims(layout.slide_path())?;
        self.merge(layout, dims, log)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeTilesOutputs {
    pub tiles: usize,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub width: u32,
    pub height: u32,
    pub merged: PathBuf,
}

impl Display for MergeTilesOutputs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Merged {} tiles on a {}x{} canvas into a {}x{} image",
            self.tiles, self.canvas_width, self.canvas_height, self.width, self.height
        )
    }
}
