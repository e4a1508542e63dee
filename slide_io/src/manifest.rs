#![allow(missing_docs)]

use crate::error::PipelineError;
use crate::tile_name::{CoordSuffix, TileCoord, TILE_EXTENSION};
use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Sidecar written next to the tiles of one directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Position and size of one tile file, recorded when the tile is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRecord {
    /// File stem of the tile, unique within a slide
    pub tile_id: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Name of the file relative to the manifest's directory
    pub file_name: String,
}

impl TileRecord {
    pub fn coord(&self) -> TileCoord {
        TileCoord::new(self.x, self.y)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileManifest {
    pub tiles: Vec<TileRecord>,
}

impl TileManifest {
    pub fn push(&mut self, record: TileRecord) {
        self.tiles.push(record);
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let writer = BufWriter::new(
            File::create(&path).with_context(|| format!("While creating {path:?}"))?,
        );
        serde_json::to_writer_pretty(writer, self)
            .with_context(|| format!("While writing {path:?}"))?;
        Ok(())
    }

    /// `None` when the directory has no manifest.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        let manifest = serde_json::from_reader(reader)
            .with_context(|| format!("While reading {path:?}"))?;
        Ok(Some(manifest))
    }
}

/// Files of `dir` whose names end in `<x>_<y>.<extension>`, with the
/// coordinates parsed. Files without the suffix are skipped.
pub fn scan_coord_files(dir: &Path, extension: &str) -> Result<Vec<(TileCoord, PathBuf)>> {
    let suffix = CoordSuffix::new(extension)?;
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("While listing {dir:?}"))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            warn!("skipping non UTF-8 file name {file_name:?} in {dir:?}");
            continue;
        };
        match suffix.parse(name) {
            Some(coord) => found.push((coord, entry.path())),
            None => debug!("skipping {name}: no <x>_<y>.{extension} suffix"),
        }
    }
    Ok(found)
}

/// The tiles of one directory with coordinates resolved, in row-major order.
#[derive(Debug, Clone)]
pub struct TileSet {
    dir: PathBuf,
    tiles: Vec<TileRecord>,
}

impl TileSet {
    /// Read the directory's manifest, or scan file names when it has none.
    pub fn load(dir: &Path) -> Result<Self> {
        match TileManifest::read(dir)? {
            Some(manifest) => Self::from_manifest(dir, manifest),
            None => Self::scan(dir),
        }
    }

    pub fn from_manifest(dir: &Path, manifest: TileManifest) -> Result<Self> {
        for record in &manifest.tiles {
            if !dir.join(&record.file_name).is_file() {
                return Err(PipelineError::MissingArtifact(format!(
                    "{} is listed in the manifest of {dir:?} but does not exist",
                    record.file_name
                ))
                .into());
            }
        }
        Ok(Self::new(dir, manifest.tiles))
    }

    /// Recover tile records from `<x>_<y>.png` file names. Only image headers
    /// are read.
    pub fn scan(dir: &Path) -> Result<Self> {
        let tiles = scan_coord_files(dir, TILE_EXTENSION)?
            .into_iter()
            .map(|(coord, path)| {
                let (width, height) = image::image_dimensions(&path)
                    .with_context(|| format!("While reading the header of {path:?}"))?;
                let file_name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(String::from)
                    .unwrap_or_default();
                let tile_id = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(String::from)
                    .unwrap_or_default();
                Ok(TileRecord {
                    tile_id,
                    x: coord.x,
                    y: coord.y,
                    width,
                    height,
                    file_name,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(dir, tiles))
    }

    fn new(dir: &Path, tiles: Vec<TileRecord>) -> Self {
        TileSet {
            dir: dir.to_path_buf(),
            tiles: tiles
                .into_iter()
                .sorted_by_key(|r| (r.coord().row_major_key(), r.file_name.clone()))
                .collect(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tiles(&self) -> &[TileRecord] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn path_of(&self, record: &TileRecord) -> PathBuf {
        self.dir.join(&record.file_name)
    }

    /// Records paired with their absolute paths.
    pub fn into_placed(self) -> Vec<(TileRecord, PathBuf)> {
        let dir = self.dir;
        self.tiles
            .into_iter()
            .map(|record| {
                let path = dir.join(&record.file_name);
                (record, path)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use image::RgbImage;
    use pretty_assertions::assert_eq;

    fn write_tile(dir: &Path, name: &str, w: u32, h: u32) -> Result<()> {
        RgbImage::new(w, h).save(dir.join(name))?;
        Ok(())
    }

    #[test]
    fn test_scan_skips_unparseable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_tile(dir.path(), "s_Rein_64_0.png", 30, 64)?;
        write_tile(dir.path(), "s_Rein_0_0.png", 64, 64)?;
        write_tile(dir.path(), "s_Rein_0_64.png", 64, 20)?;
        write_tile(dir.path(), "thumbnail.png", 8, 8)?;
        std::fs::write(dir.path().join("notes_1_2.txt"), "x")?;

        let set = TileSet::scan(dir.path())?;
        let coords: Vec<_> = set.tiles().iter().map(TileRecord::coord).collect();
        assert_eq!(
            coords,
            [
                TileCoord::new(0, 0),
                TileCoord::new(64, 0),
                TileCoord::new(0, 64)
            ]
        );
        assert_eq!(set.tiles()[1].width, 30);
        assert_eq!(set.tiles()[2].height, 20);
        assert_eq!(set.tiles()[0].tile_id, "s_Rein_0_0");
        Ok(())
    }

    #[test]
    fn test_manifest_preferred_over_names() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_tile(dir.path(), "renamed.png", 16, 16)?;
        let mut manifest = TileManifest::default();
        manifest.push(TileRecord {
            tile_id: "s_Rein_32_48".to_string(),
            x: 32,
            y: 48,
            width: 16,
            height: 16,
            file_name: "renamed.png".to_string(),
        });
        manifest.write(dir.path())?;

        assert_eq!(TileManifest::read(dir.path())?, Some(manifest));
        let set = TileSet::load(dir.path())?;
        assert_eq!(set.len(), 1);
        assert_eq!(set.tiles()[0].coord(), TileCoord::new(32, 48));
        assert_eq!(set.path_of(&set.tiles()[0]), dir.path().join("renamed.png"));
        Ok(())
    }

    #[test]
    fn test_manifest_with_missing_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = TileManifest {
            tiles: vec![TileRecord {
                tile_id: "gone".to_string(),
                x: 0,
                y: 0,
                width: 1,
                height: 1,
                file_name: "gone.png".to_string(),
            }],
        };
        manifest.write(dir.path())?;
        let err = TileSet::load(dir.path()).unwrap_err();
        assert_eq!(PipelineError::kind_of(&err), Some(ErrorKind::MissingArtifact));
        Ok(())
    }
}
