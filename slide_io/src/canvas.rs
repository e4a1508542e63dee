//!
//! Bounded-memory compositing of tiles into one large PNG.
//!
//! [`BandedCanvasWriter`] holds one horizontal band of the canvas at a time.
//! Tiles must arrive in top-to-bottom order of their top edge; a tile that
//! reaches below the current band is kept until the bands it covers have been
//! drawn. Completed bands are streamed to the PNG encoder.
//!
#![allow(missing_docs)]

use crate::error::PipelineError;
use anyhow::{bail, Context, Result};
use image::{imageops, Rgb, RgbImage};
use log::debug;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const CHANNELS: usize = 3;

struct PendingTile {
    x: u32,
    y: u32,
    pixels: RgbImage,
}

impl PendingTile {
    fn bottom(&self) -> u64 {
        u64::from(self.y) + u64::from(self.pixels.height())
    }
}

pub struct BandedCanvasWriter {
    path: PathBuf,
    stream: png::StreamWriter<'static, BufWriter<File>>,
    width: u32,
    height: u32,
    band_height: u32,
    band_top: u32,
    band: RgbImage,
    pending: Vec<PendingTile>,
}

impl BandedCanvasWriter {
    /// Start a black `width x height` canvas at `path`, buffering
    /// `band_height` rows at a time.
    pub fn create(path: &Path, width: u32, height: u32, band_height: u32) -> Result<Self> {
        if width == 0 || height == 0 || band_height == 0 {
            bail!(PipelineError::GeometryViolation(format!(
                "cannot build a {width}x{height} canvas with {band_height}-row bands"
            )));
        }
        let resource = || PipelineError::Resource {
            path: path.to_path_buf(),
        };
        let file = BufWriter::new(File::create(path).with_context(resource)?);
        let mut encoder = png::Encoder::new(file, width, height);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Fast);
        let stream = encoder
            .write_header()
            .with_context(resource)?
            .into_stream_writer()
            .with_context(resource)?;

        Ok(BandedCanvasWriter {
            path: path.to_path_buf(),
            stream,
            width,
            height,
            band_height,
            band_top: 0,
            band: RgbImage::new(width, band_height.min(height)),
            pending: Vec::new(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn band_bottom(&self) -> u64 {
        u64::from(self.band_top) + u64::from(self.band.height())
    }

    /// Draw `tile` with its top-left corner at canvas `(x, y)`. Tile pixels
    /// replace whatever is already there; pixels outside the canvas are
    /// dropped.
    pub fn paste(&mut self, x: u32, y: u32, tile: RgbImage) -> Result<()> {
        if y < self.band_top {
            bail!(
                "tile at ({x}, {y}) arrived after rows up to {} were written",
                self.band_top
            );
        }
        if y >= self.height {
            debug!("tile at ({x}, {y}) lies below the {}-row canvas", self.height);
            return Ok(());
        }
        while u64::from(y) >= self.band_bottom() {
            self.flush_band()?;
        }
        let tile = PendingTile { x, y, pixels: tile };
        self.draw(&tile);
        if tile.bottom() > self.band_bottom() {
            self.pending.push(tile);
        }
        Ok(())
    }

    fn draw(&mut self, tile: &PendingTile) {
        let dy = i64::from(tile.y) - i64::from(self.band_top);
        imageops::replace(&mut self.band, &tile.pixels, i64::from(tile.x), dy);
    }

    fn flush_band(&mut self) -> Result<()> {
        self.stream
            .write_all(self.band.as_raw())
            .with_context(|| PipelineError::Resource {
                path: self.path.clone(),
            })?;
        self.band_top += self.band.height();
        if self.band_top >= self.height {
            self.pending.clear();
            return Ok(());
        }

        let rows = self.band_height.min(self.height - self.band_top);
        self.band = RgbImage::new(self.width, rows);
        let pending = std::mem::take(&mut self.pending);
        for tile in &pending {
            self.draw(tile);
        }
        let bottom = self.band_bottom();
        self.pending = pending
            .into_iter()
            .filter(|tile| tile.bottom() > bottom)
            .collect();
        Ok(())
    }

    /// Write the remaining bands and close the file.
    pub fn finish(mut self) -> Result<PathBuf> {
        while self.band_top < self.height {
            self.flush_band()?;
        }
        let path = self.path;
        self.stream
            .finish()
            .with_context(|| PipelineError::Resource { path: path.clone() })?;
        Ok(path)
    }
}

/// Crop the PNG at `path` to its top-left `crop_width x crop_height` pixels
/// and shrink it by `factor` with box averaging, reading one row at a time.
/// The result is `floor(crop_width / factor) x floor(crop_height / factor)`;
/// trailing rows and columns that do not fill a whole box are dropped.
pub fn crop_and_downsample(
    path: &Path,
    crop_width: u32,
    crop_height: u32,
    factor: u32,
) -> Result<RgbImage> {
    if factor == 0 {
        bail!("downsample factor must be positive");
    }
    let file = File::open(path).with_context(|| format!("While opening {path:?}"))?;
    let decoder =
        png::Decoder::new_with_limits(BufReader::new(file), png::Limits { bytes: usize::MAX });
    let mut reader = decoder
        .read_info()
        .with_context(|| format!("While reading the header of {path:?}"))?;
    let (width, height, color, depth) = {
        let info = reader.info();
        (info.width, info.height, info.color_type, info.bit_depth)
    };
    if color != png::ColorType::Rgb || depth != png::BitDepth::Eight {
        bail!(PipelineError::UnsupportedPixels {
            path: path.to_path_buf(),
            detail: format!("{color:?} {depth:?}, expected 8-bit RGB"),
        });
    }
    if crop_width > width || crop_height > height {
        bail!(PipelineError::GeometryViolation(format!(
            "crop {crop_width}x{crop_height} exceeds the {width}x{height} canvas"
        )));
    }

    let out_width = crop_width / factor;
    let out_height = crop_height / factor;
    if out_width == 0 || out_height == 0 {
        bail!(PipelineError::GeometryViolation(format!(
            "downsampling {crop_width}x{crop_height} by {factor} leaves no pixels"
        )));
    }

    let factor_px = factor as usize;
    let box_area = u64::from(factor) * u64::from(factor);
    let mut sums = vec![0u64; out_width as usize * CHANNELS];
    let mut output = RgbImage::new(out_width, out_height);

    for out_y in 0..out_height {
        sums.fill(0);
        for _ in 0..factor {
            let row = reader
                .next_row()
                .with_context(|| format!("While decoding {path:?}"))?
                .with_context(|| format!("{path:?} ended before row {}", out_y * factor))?;
            let data = row.data();
            for (x, pixel) in data
                .chunks_exact(CHANNELS)
                .take(out_width as usize * factor_px)
                .enumerate()
            {
                let cell = (x / factor_px) * CHANNELS;
                for (sum, &value) in sums[cell..cell + CHANNELS].iter_mut().zip(pixel) {
                    *sum += u64::from(value);
                }
            }
        }
        for (out_x, sum) in sums.chunks_exact(CHANNELS).enumerate() {
            let mean = |s: u64| ((s + box_area / 2) / box_area) as u8;
            output.put_pixel(
                out_x as u32,
                out_y,
                Rgb([mean(sum[0]), mean(sum[1]), mean(sum[2])]),
            );
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn solid(width: u32, height: u32, value: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(value))
    }

    fn marked(value: u8) -> RgbImage {
        let mut tile = solid(256, 256, [value, value, value]);
        tile.put_pixel(10, 10, Rgb([value, 0, 255]));
        tile
    }

    #[test]
    fn test_three_tiles_on_square_canvas() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("canvas.png");
        let mut canvas = BandedCanvasWriter::create(&path, 512, 512, 256)?;
        canvas.paste(0, 0, marked(10))?;
        canvas.paste(256, 0, marked(20))?;
        canvas.paste(0, 256, marked(30))?;
        canvas.finish()?;

        let merged = image::open(&path)?.to_rgb8();
        assert_eq!(merged.dimensions(), (512, 512));
        assert_eq!(merged[(10, 10)], Rgb([10, 0, 255]));
        assert_eq!(merged[(266, 10)], Rgb([20, 0, 255]));
        assert_eq!(merged[(10, 266)], Rgb([30, 0, 255]));
        assert_eq!(merged[(300, 300)], Rgb([0, 0, 0]));
        assert_eq!(merged[(255, 255)], Rgb([10, 10, 10]));
        Ok(())
    }

    #[test]
    fn test_tiles_spanning_several_bands() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("canvas.png");
        let mut canvas = BandedCanvasWriter::create(&path, 40, 100, 7)?;
        canvas.paste(0, 3, solid(20, 90, [1, 2, 3]))?;
        // overlaps the first tile, drawn later so it wins
        canvas.paste(10, 50, solid(30, 50, [9, 9, 9]))?;
        canvas.finish()?;

        let merged = image::open(&path)?.to_rgb8();
        assert_eq!(merged[(5, 2)], Rgb([0, 0, 0]));
        assert_eq!(merged[(5, 3)], Rgb([1, 2, 3]));
        assert_eq!(merged[(19, 92)], Rgb([9, 9, 9]));
        assert_eq!(merged[(5, 92)], Rgb([1, 2, 3]));
        assert_eq!(merged[(5, 93)], Rgb([0, 0, 0]));
        assert_eq!(merged[(39, 99)], Rgb([9, 9, 9]));
        Ok(())
    }

    #[test]
    fn test_out_of_order_paste() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut canvas = BandedCanvasWriter::create(&dir.path().join("c.png"), 8, 8, 2)?;
        canvas.paste(0, 4, solid(2, 2, [1, 1, 1]))?;
        assert!(canvas.paste(0, 0, solid(2, 2, [1, 1, 1])).is_err());
        Ok(())
    }

    #[test]
    fn test_empty_canvas() {
        let dir = tempfile::tempdir().unwrap();
        let err = BandedCanvasWriter::create(&dir.path().join("c.png"), 0, 8, 2)
            .err()
            .unwrap();
        assert_eq!(PipelineError::kind_of(&err), Some(ErrorKind::GeometryViolation));
    }

    #[test]
    fn test_crop_keeps_origin() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("c.png");
        let mut source = solid(50, 40, [0, 0, 0]);
        source.put_pixel(0, 0, Rgb([200, 100, 50]));
        source.save(&path)?;

        let cropped = crop_and_downsample(&path, 30, 20, 1)?;
        assert_eq!(cropped.dimensions(), (30, 20));
        assert_eq!(cropped[(0, 0)], Rgb([200, 100, 50]));
        Ok(())
    }

    #[test]
    fn test_downsample_dimensions_and_means() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("c.png");
        let source = RgbImage::from_fn(205, 137, |x, _| {
            if (x / 10) % 2 == 0 {
                Rgb([100, 0, 0])
            } else {
                Rgb([0, 0, 200])
            }
        });
        source.save(&path)?;

        let small = crop_and_downsample(&path, 205, 137, 10)?;
        assert_eq!(small.dimensions(), (20, 13));
        assert_eq!(small[(0, 0)], Rgb([100, 0, 0]));
        assert_eq!(small[(1, 12)], Rgb([0, 0, 200]));

        // a box straddling both colours averages them
        let shifted = RgbImage::from_fn(20, 10, |x, _| {
            if x < 5 {
                Rgb([100, 0, 0])
            } else {
                Rgb([0, 0, 0])
            }
        });
        shifted.save(&path)?;
        assert_eq!(crop_and_downsample(&path, 20, 10, 10)?[(0, 0)], Rgb([50, 0, 0]));
        Ok(())
    }

    #[test]
    fn test_crop_larger_than_canvas() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("c.png");
        solid(20, 20, [1, 1, 1]).save(&path)?;
        let err = crop_and_downsample(&path, 21, 20, 10).unwrap_err();
        assert_eq!(PipelineError::kind_of(&err), Some(ErrorKind::GeometryViolation));
        let err = crop_and_downsample(&path, 9, 20, 10).unwrap_err();
        assert_eq!(PipelineError::kind_of(&err), Some(ErrorKind::GeometryViolation));
        Ok(())
    }
}
