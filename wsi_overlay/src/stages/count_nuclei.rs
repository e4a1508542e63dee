//! CountNuclei stage code
//!
//! Pair every tissue tile with the segmentation artifact that carries the
//! same `<x>_<y>` coordinate, tally nuclei per class into the count ledger and
//! draw the nucleus contours onto an overlay copy of the tile.
#![allow(missing_docs)]

use crate::ledger::NucleusLedgerWriter;
use crate::nucleus::{ClassCounts, NucleusArtifact, NucleusClass};
use crate::outcome::StageName;
use crate::overlay::render_overlay;
use crate::run_log::RunLog;
use crate::stages::SlideStage;
use crate::SlideLayout;
use anyhow::{bail, Context, Result};
use itertools::Itertools;
use slide_io::manifest::scan_coord_files;
use slide_io::tile_name::{ARTIFACT_EXTENSION, OVERLAY_PREFIX};
use slide_io::{PipelineError, TileCoord, TileManifest, TileRecord, TileSet};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use wsi_parameters::Parameters;

/// A tissue tile and the artifact produced for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePair {
    pub tile: TileRecord,
    pub tile_path: PathBuf,
    pub artifact_path: PathBuf,
}

/// Join tiles and artifacts on their coordinate, in ascending `(x, y)` order.
/// A tile without an artifact or an artifact without a tile is an error.
pub fn pair_by_coordinate(tiles: &TileSet, result_dir: &Path) -> Result<Vec<TilePair>> {
    let mut artifacts: BTreeMap<TileCoord, PathBuf> = BTreeMap::new();
    for (coord, path) in scan_coord_files(result_dir, ARTIFACT_EXTENSION)? {
        if let Some(previous) = artifacts.insert(coord, path) {
            bail!("more than one artifact for tile {coord}, including {previous:?}");
        }
    }

    let by_coord: BTreeMap<TileCoord, &TileRecord> =
        tiles.tiles().iter().map(|tile| (tile.coord(), tile)).collect();
    let orphans = artifacts
        .iter()
        .filter(|(coord, _)| !by_coord.contains_key(coord))
        .map(|(_, path)| path)
        .collect::<Vec<_>>();
    if !orphans.is_empty() {
        bail!(PipelineError::MissingArtifact(format!(
            "no tissue tile for artifacts {orphans:?}"
        )));
    }

    let mut missing = Vec::new();
    let mut pairs = Vec::with_capacity(by_coord.len());
    for (coord, tile) in by_coord {
        match artifacts.remove(&coord) {
            Some(artifact_path) => pairs.push(TilePair {
                tile: tile.clone(),
                tile_path: tiles.path_of(tile),
                artifact_path,
            }),
            None => missing.push(tile.file_name.as_str()),
        }
    }
    if !missing.is_empty() {
        bail!(PipelineError::MissingArtifact(format!(
            "no prediction in {result_dir:?} for tiles {}",
            missing.iter().join(", ")
        )));
    }
    Ok(pairs)
}

pub struct CountNuclei {
    line_thickness: u32,
}

impl CountNuclei {
    pub fn new(params: &Parameters) -> Self {
        CountNuclei {
            line_thickness: params.overlay_line_thickness,
        }
    }
}

impl SlideStage for CountNuclei {
    type StageOutputs = CountNucleiOutputs;

    fn name(&self) -> StageName {
        StageName::Count
    }

    fn run(&self, layout: &SlideLayout, log: &RunLog) -> Result<CountNucleiOutputs> {
        let tiles = TileSet::load(&layout.cell_dir())?;
        let pairs = pair_by_coordinate(&tiles, &layout.result_dir())?;

        let overlay_dir = layout.overlay_dir();
        std::fs::create_dir_all(&overlay_dir)
            .with_context(|| format!("While creating {overlay_dir:?}"))?;
        let ledger_path = layout.nucleus_ledger_path();
        let mut ledger = NucleusLedgerWriter::create(&ledger_path)?;
        let mut manifest = TileManifest::default();

        for pair in &pairs {
            let tile_name = &pair.tile.tile_id;
            let artifact_name = pair
                .artifact_path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default();
            let artifact = NucleusArtifact::read(&pair.artifact_path)?;
            ledger.append(tile_name, artifact_name, artifact.counts())?;

            let tile = image::open(&pair.tile_path)
                .with_context(|| format!("While reading tile {:?}", pair.tile_path))?
                .to_rgb8();
            let overlay = render_overlay(&tile, &artifact, self.line_thickness);
            let file_name = format!("{OVERLAY_PREFIX}{}", pair.tile.file_name);
            let path = overlay_dir.join(&file_name);
            overlay
                .save(&path)
                .with_context(|| format!("While writing overlay {path:?}"))?;
            manifest.push(TileRecord {
                tile_id: format!("{OVERLAY_PREFIX}{tile_name}"),
                width: overlay.width(),
                height: overlay.height(),
                file_name,
                ..pair.tile.clone()
            });
        }
        let totals = ledger.finish()?;
        manifest.write(&overlay_dir)?;

        let outputs = CountNucleiOutputs {
            tiles: pairs.len(),
            totals,
            nucleus_ledger: ledger_path,
        };
        log.info(&outputs.to_string());
        Ok(outputs)
    }
}

#[derive(Debug, Clone)]
pub struct CountNucleiOutputs {
    pub tiles: usize,
    pub totals: ClassCounts,
    pub nucleus_ledger: PathBuf,
}

impl Display for CountNucleiOutputs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Counted nuclei in {} tiles:", self.tiles)?;
        for class in NucleusClass::ALL {
            write!(f, " {}={}", class.label(), self.totals.get(class))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::read_nucleus_ledger;
    use image::{Rgb, RgbImage};
    use pretty_assertions::assert_eq;
    use slide_io::ErrorKind;
    use wsi_parameters::NormMethod;

    fn artifact_json(classes: &[u8]) -> String {
        let nuclei = classes
            .iter()
            .enumerate()
            .map(|(i, class)| {
                let o = 2 + 6 * i;
                format!(
                    r#""{i}": {{"type": {class}, "contour": [[{o}, 2], [{}, 2], [{}, 6]]}}"#,
                    o + 4,
                    o + 4
                )
            })
            .join(", ");
        format!("{{{nuclei}}}")
    }

    struct Fixture {
        _uploads: tempfile::TempDir,
        layout: SlideLayout,
    }

    fn fixture(tiles: &[(u32, u32, Vec<u8>)]) -> Result<Fixture> {
        let uploads = tempfile::tempdir()?;
        let layout = SlideLayout::new(uploads.path(), Path::new("s.bif"), NormMethod::Reinhard)?;
        layout.create_dirs()?;
        for (x, y, classes) in tiles {
            let coord = TileCoord::new(*x, *y);
            RgbImage::from_pixel(32, 16, Rgb([200, 200, 200]))
                .save(layout.cell_dir().join(coord.tile_file_name(layout.id_name())))?;
            std::fs::write(
                layout
                    .result_dir()
                    .join(format!("{}.json", coord.tile_stem(layout.id_name()))),
                artifact_json(classes),
            )?;
        }
        Ok(Fixture {
            _uploads: uploads,
            layout,
        })
    }

    #[test]
    fn test_end_row_is_column_sums() -> Result<()> {
        let f = fixture(&[
            (1024, 0, vec![1, 1, 2]),
            (0, 0, vec![0, 4]),
            (0, 1024, vec![3, 3, 3, 1]),
            (10240, 0, vec![]),
        ])?;
        let log = RunLog::open(&f.layout.root().join("predict_log.txt"))?;
        let out = CountNuclei::new(&Parameters::default()).run(&f.layout, &log)?;
        assert_eq!(out.tiles, 4);
        assert_eq!(out.totals.as_array(), [1, 3, 1, 3, 1]);

        let rows = read_nucleus_ledger(&f.layout.nucleus_ledger_path())?;
        let names: Vec<_> = rows.iter().map(|r| r.tile.as_str()).collect();
        assert_eq!(
            names,
            [
                "s_Rein_0_0",
                "s_Rein_0_1024",
                "s_Rein_1024_0",
                "s_Rein_10240_0",
                "END"
            ]
        );
        assert_eq!(rows[0].artifact, "s_Rein_0_0");
        let (end, body) = rows.split_last().unwrap();
        let mut sums = ClassCounts::default();
        for row in body {
            sums += row.counts;
        }
        assert_eq!(end.artifact, "Total");
        assert_eq!(end.counts, sums);
        Ok(())
    }

    #[test]
    fn test_overlays_keep_coordinates() -> Result<()> {
        let f = fixture(&[(0, 0, vec![1]), (32, 0, vec![0])])?;
        let log = RunLog::open(&f.layout.root().join("predict_log.txt"))?;
        CountNuclei::new(&Parameters::default()).run(&f.layout, &log)?;

        let overlays = TileSet::load(&f.layout.overlay_dir())?;
        assert_eq!(overlays.len(), 2);
        assert_eq!(overlays.tiles()[1].coord(), TileCoord::new(32, 0));
        assert_eq!(overlays.tiles()[0].file_name, "overlay_s_Rein_0_0.png");
        assert_eq!(TileSet::scan(&f.layout.overlay_dir())?.tiles(), overlays.tiles());

        let drawn = image::open(f.layout.overlay_dir().join("overlay_s_Rein_0_0.png"))?.to_rgb8();
        assert_eq!(drawn[(4, 2)], Rgb([255, 0, 0]));
        let untouched =
            image::open(f.layout.overlay_dir().join("overlay_s_Rein_32_0.png"))?.to_rgb8();
        assert!(untouched.pixels().all(|&px| px == Rgb([200, 200, 200])));
        Ok(())
    }

    #[test]
    fn test_missing_artifact_either_way() -> Result<()> {
        let f = fixture(&[(0, 0, vec![1]), (64, 0, vec![2])])?;
        std::fs::remove_file(f.layout.result_dir().join("s_Rein_64_0.json"))?;
        let log = RunLog::open(&f.layout.root().join("predict_log.txt"))?;
        let stage = CountNuclei::new(&Parameters::default());
        let err = stage.run(&f.layout, &log).unwrap_err();
        assert_eq!(PipelineError::kind_of(&err), Some(ErrorKind::MissingArtifact));
        assert!(err.to_string().contains("s_Rein_64_0.png"));

        let f = fixture(&[(0, 0, vec![1])])?;
        std::fs::write(f.layout.result_dir().join("s_Rein_5_5.json"), "{}")?;
        let err = stage.run(&f.layout, &log).unwrap_err();
        assert_eq!(PipelineError::kind_of(&err), Some(ErrorKind::MissingArtifact));
        Ok(())
    }

    #[test]
    fn test_malformed_artifact_leaves_partial_ledger() -> Result<()> {
        let f = fixture(&[(0, 0, vec![1, 2]), (0, 16, vec![9])])?;
        let log = RunLog::open(&f.layout.root().join("predict_log.txt"))?;
        let err = CountNuclei::new(&Parameters::default())
            .run(&f.layout, &log)
            .unwrap_err();
        assert!(format!("{err:#}").contains("unknown class id 9"));

        let rows = read_nucleus_ledger(&f.layout.nucleus_ledger_path())?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tile, "s_Rein_0_0");
        Ok(())
    }
}
