//!
//! Level-0 access to whole-slide images stored in TIFF containers.
//!
//! Pyramid containers (`.svs`, `.tif`, `.tiff`) keep the full-resolution
//! plane in their first image directory. Ventana `.bif` files keep it on
//! page 2. Pixels are decoded one TIFF chunk (strip or tile) at a time and
//! only the chunk rows overlapping the most recent read are cached.
//!
#![allow(missing_docs)]

use crate::error::PipelineError;
use anyhow::{bail, Context, Result};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::ColorType;

const SVS_EXTENSION: &str = "svs";
const TIF_EXTENSION: &str = "tif";
const TIFF_EXTENSION: &str = "tiff";
const BIF_EXTENSION: &str = "bif";

/// Page of a `.bif` container holding the level-0 plane.
const BIF_LEVEL0_PAGE: usize = 2;

/// Level-0 width and height of a slide in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideDims {
    pub width: u32,
    pub height: u32,
}

/// Read-only access to a slide's level-0 plane.
pub trait SlideReader {
    fn dims(&self) -> SlideDims;

    /// Read a window that lies entirely inside the slide.
    fn read_region(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<RgbImage>;
}

fn check_region(dims: SlideDims, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
    let fits = u64::from(x) + u64::from(width) <= u64::from(dims.width)
        && u64::from(y) + u64::from(height) <= u64::from(dims.height);
    if !fits || width == 0 || height == 0 {
        bail!(PipelineError::GeometryViolation(format!(
            "region {width}x{height} at ({x}, {y}) is outside the {}x{} slide",
            dims.width, dims.height
        )));
    }
    Ok(())
}

/// In-memory rasters are slides too.
impl SlideReader for RgbImage {
    fn dims(&self) -> SlideDims {
        SlideDims {
            width: self.width(),
            height: self.height(),
        }
    }

    fn read_region(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<RgbImage> {
        check_region(SlideReader::dims(self), x, y, width, height)?;
        Ok(image::imageops::crop_imm(self, x, y, width, height).to_image())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideFormat {
    /// Level 0 is the first image directory.
    Pyramid,
    /// Level 0 is a fixed page of a generic tagged-image container.
    TaggedPages,
}

impl SlideFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some(SVS_EXTENSION | TIF_EXTENSION | TIFF_EXTENSION) => Ok(SlideFormat::Pyramid),
            Some(BIF_EXTENSION) => Ok(SlideFormat::TaggedPages),
            _ => Err(PipelineError::UnsupportedExtension {
                path: path.to_path_buf(),
            }
            .into()),
        }
    }

    pub fn level0_page(self) -> usize {
        match self {
            SlideFormat::Pyramid => 0,
            SlideFormat::TaggedPages => BIF_LEVEL0_PAGE,
        }
    }
}

/// Open a slide, dispatching on its extension.
pub fn open_slide(path: &Path) -> Result<TiffSlide> {
    let format = SlideFormat::from_path(path)?;
    TiffSlide::open(path, format.level0_page())
}

/// Level-0 dimensions from the slide's metadata. No pixels are decoded.
pub fn slide_dims(path: &Path) -> Result<SlideDims> {
    Ok(open_slide(path)?.dims())
}

struct Chunk {
    /// pixels per stored row, may exceed `width` for padded edge tiles
    stride: u32,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

pub struct TiffSlide {
    path: PathBuf,
    decoder: Decoder<BufReader<File>>,
    dims: SlideDims,
    samples: usize,
    chunk_width: u32,
    chunk_height: u32,
    chunks_across: u32,
    cache: HashMap<u32, Chunk>,
}

impl TiffSlide {
    pub fn open(path: &Path, page: usize) -> Result<Self> {
        let mut decoder = Decoder::new(BufReader::new(
            File::open(path).with_context(|| format!("Error opening slide {path:?}"))?,
        ))
        .with_context(|| format!("{path:?} is not a readable TIFF container"))?
        .with_limits(Limits::unlimited());

        for _ in 0..page {
            if !decoder.more_images() {
                bail!(PipelineError::UnsupportedPixels {
                    path: path.to_path_buf(),
                    detail: format!("expected at least {} image directories", page + 1),
                });
            }
            decoder.next_image()?;
        }

        let (width, height) = decoder.dimensions()?;
        let samples = match decoder.colortype()? {
            ColorType::RGB(8) | ColorType::YCbCr(8) => 3,
            ColorType::RGBA(8) => 4,
            ColorType::Gray(8) => 1,
            other => bail!(PipelineError::UnsupportedPixels {
                path: path.to_path_buf(),
                detail: format!("colour type {other:?} on page {page}"),
            }),
        };
        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        if chunk_width == 0 || chunk_height == 0 {
            bail!(PipelineError::UnsupportedPixels {
                path: path.to_path_buf(),
                detail: "empty strip or tile size".to_string(),
            });
        }

        Ok(TiffSlide {
            path: path.to_path_buf(),
            decoder,
            dims: SlideDims { width, height },
            samples,
            chunk_width,
            chunk_height,
            chunks_across: width.div_ceil(chunk_width),
            cache: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_chunk(&mut self, index: u32) -> Result<()> {
        if self.cache.contains_key(&index) {
            return Ok(());
        }
        let (width, height) = self.decoder.chunk_data_dimensions(index);
        let data = match self
            .decoder
            .read_chunk(index)
            .with_context(|| format!("While decoding chunk {index} of {:?}", self.path))?
        {
            DecodingResult::U8(data) => data,
            _ => bail!(PipelineError::UnsupportedPixels {
                path: self.path.clone(),
                detail: "only 8-bit samples are supported".to_string(),
            }),
        };
        // Edge tiles come back either trimmed to their valid area or padded
        // to the full tile size.
        let pixels = data.len() / self.samples;
        let stride = if pixels == (width as usize) * (height as usize) {
            width
        } else {
            self.chunk_width
        };
        if (stride as usize) * (height as usize) * self.samples > data.len() {
            bail!(
                "chunk {index} of {:?} holds {} bytes, expected {}x{}x{}",
                self.path,
                data.len(),
                stride,
                height,
                self.samples
            );
        }
        self.cache.insert(
            index,
            Chunk {
                stride,
                width,
                height,
                data,
            },
        );
        Ok(())
    }
}

impl SlideReader for TiffSlide {
    fn dims(&self) -> SlideDims {
        self.dims
    }

    fn read_region(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<RgbImage> {
        check_region(self.dims, x, y, width, height)?;

        let first_row = y / self.chunk_height;
        let last_row = (y + height - 1) / self.chunk_height;
        let first_col = x / self.chunk_width;
        let last_col = (x + width - 1) / self.chunk_width;

        let across = self.chunks_across;
        self.cache.retain(|index, _| index / across >= first_row);

        let mut region = RgbImage::new(width, height);
        for row in first_row..=last_row {
            for col in first_col..=last_col {
                let index = row * across + col;
                self.load_chunk(index)?;
                let chunk = &self.cache[&index];
                let (cx, cy) = (col * self.chunk_width, row * self.chunk_height);

                let x0 = x.max(cx);
                let x1 = (x + width).min(cx + chunk.width);
                let y0 = y.max(cy);
                let y1 = (y + height).min(cy + chunk.height);
                for py in y0..y1 {
                    let row_start = ((py - cy) as usize) * (chunk.stride as usize);
                    for px in x0..x1 {
                        let offset = (row_start + (px - cx) as usize) * self.samples;
                        let pixel = if self.samples == 1 {
                            [chunk.data[offset]; 3]
                        } else {
                            [
                                chunk.data[offset],
                                chunk.data[offset + 1],
                                chunk.data[offset + 2],
                            ]
                        };
                        region.put_pixel(px - x, py - y, Rgb(pixel));
                    }
                }
            }
        }
        Ok(region)
    }
}
