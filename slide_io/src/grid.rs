#![allow(missing_docs)]

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// One window of the extraction grid. Cells on the right and bottom edges
/// are clipped to the slide and never padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridCell {
    /// 1-based position in row-major iteration order
    pub index: u64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Gap-free, non-overlapping tiling of a `width x height` slide with
/// `patch_size` square windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    width: u32,
    height: u32,
    patch_size: u32,
}

impl PatchGrid {
    pub fn new(width: u32, height: u32, patch_size: u32) -> Result<Self> {
        if patch_size == 0 {
            bail!("patch size must be positive");
        }
        Ok(PatchGrid {
            width,
            height,
            patch_size,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn patch_size(&self) -> u32 {
        self.patch_size
    }

    pub fn columns(&self) -> u32 {
        self.width.div_ceil(self.patch_size)
    }

    pub fn rows(&self) -> u32 {
        self.height.div_ceil(self.patch_size)
    }

    pub fn len(&self) -> u64 {
        u64::from(self.columns()) * u64::from(self.rows())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cells top-to-bottom, then left-to-right, numbered from 1.
    pub fn cells(&self) -> impl Iterator<Item = GridCell> + '_ {
        let step = self.patch_size as usize;
        (0..self.height)
            .step_by(step)
            .flat_map(move |y| (0..self.width).step_by(step).map(move |x| (x, y)))
            .zip(1u64..)
            .map(move |((x, y), index)| GridCell {
                index,
                x,
                y,
                width: self.patch_size.min(self.width - x),
                height: self.patch_size.min(self.height - y),
            })
    }
}
