//! Tile coordinates and the `<prefix>_<x>_<y>.<ext>` naming convention.
//!
//! The coordinate suffix is the only part of a tile name consumers may rely
//! on. Once a directory has been ingested, coordinates travel as
//! [`TileCoord`] values and file names are not parsed again.
#![allow(missing_docs)]

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const TILE_EXTENSION: &str = "png";
pub const ARTIFACT_EXTENSION: &str = "json";
pub const OVERLAY_PREFIX: &str = "overlay_";

/// Level-0 offset of a tile's top-left pixel.
///
/// The derived ordering is by `x`, then `y`. For tiles that share a name
/// prefix this equals the natural (numeric-aware) ordering of their file
/// names.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(x: u32, y: u32) -> Self {
        TileCoord { x, y }
    }

    /// Sort key for top-to-bottom, left-to-right order.
    pub fn row_major_key(self) -> (u32, u32) {
        (self.y, self.x)
    }

    /// `<prefix>_<x>_<y>`
    pub fn tile_stem(self, prefix: &str) -> String {
        format!("{prefix}_{self}")
    }

    /// `<prefix>_<x>_<y>.png`
    pub fn tile_file_name(self, prefix: &str) -> String {
        format!("{}.{TILE_EXTENSION}", self.tile_stem(prefix))
    }
}

impl Display for TileCoord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.x, self.y)
    }
}

impl FromStr for TileCoord {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((x, y)) = s.split_once('_') else {
            bail!("Unable to parse {s} as <x>_<y>");
        };
        Ok(TileCoord {
            x: x.parse().with_context(|| format!("Invalid x in {s}"))?,
            y: y.parse().with_context(|| format!("Invalid y in {s}"))?,
        })
    }
}

/// Recognizes the trailing `<x>_<y>.<ext>` of a file name.
#[derive(Debug, Clone)]
pub struct CoordSuffix {
    regex: Regex,
}

impl CoordSuffix {
    pub fn new(extension: &str) -> Result<Self> {
        let pattern = format!(r"([0-9]+)_([0-9]+)\.{}$", regex::escape(extension));
        Ok(CoordSuffix {
            regex: Regex::new(&pattern)?,
        })
    }

    pub fn png() -> Result<Self> {
        Self::new(TILE_EXTENSION)
    }

    /// `None` when the name has no suffix or the numbers do not fit a `u32`.
    pub fn parse(&self, file_name: &str) -> Option<TileCoord> {
        let caps = self.regex.captures(file_name)?;
        Some(TileCoord {
            x: caps[1].parse().ok()?,
            y: caps[2].parse().ok()?,
        })
    }
}
