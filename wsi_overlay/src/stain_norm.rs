//!
//! Stain normalization of tissue patches.
//!
//! A normalizer is fitted once per slide against a reference and then applied
//! to every tissue patch. Reinhard normalization matches the per-channel mean
//! and standard deviation of each patch in lαβ space to the reference.
//!
#![allow(missing_docs)]

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use log::info;
use std::path::Path;
use wsi_parameters::NormMethod;

pub trait StainNormalizer {
    /// Learn the reference appearance from `target`.
    fn fit(&mut self, target: &RgbImage) -> Result<()>;

    fn transform(&self, tile: &RgbImage) -> Result<RgbImage>;
}

/// Leaves patches untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityNormalizer;

impl StainNormalizer for IdentityNormalizer {
    fn fit(&mut self, _target: &RgbImage) -> Result<()> {
        Ok(())
    }

    fn transform(&self, tile: &RgbImage) -> Result<RgbImage> {
        Ok(tile.clone())
    }
}

const RGB_TO_LMS: [[f64; 3]; 3] = [
    [0.3811, 0.5783, 0.0402],
    [0.1967, 0.7244, 0.0782],
    [0.0241, 0.1288, 0.8444],
];

const LMS_TO_RGB: [[f64; 3]; 3] = [
    [4.4679, -3.5873, 0.1193],
    [-1.2186, 2.3809, -0.1624],
    [0.0497, -0.2439, 1.2045],
];

/// Floor applied before taking logarithms.
const MIN_CONE_RESPONSE: f64 = 1.0;

fn mat_mul(m: [[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    m.map(|row| row[0] * v[0] + row[1] * v[1] + row[2] * v[2])
}

fn rgb_to_lab(pixel: Rgb<u8>) -> [f64; 3] {
    let [l, m, s] = mat_mul(RGB_TO_LMS, pixel.0.map(f64::from))
        .map(|cone| cone.max(MIN_CONE_RESPONSE).log10());
    [
        (l + m + s) / 3f64.sqrt(),
        (l + m - 2.0 * s) / 6f64.sqrt(),
        (l - m) / 2f64.sqrt(),
    ]
}

fn lab_to_rgb([lum, alpha, beta]: [f64; 3]) -> Rgb<u8> {
    let a = lum / 3f64.sqrt();
    let b = alpha / 6f64.sqrt();
    let c = beta / 2f64.sqrt();
    let lms = [a + b + c, a + b - c, a - 2.0 * b].map(|log| 10f64.powf(log));
    Rgb(mat_mul(LMS_TO_RGB, lms).map(|v| v.round().clamp(0.0, 255.0) as u8))
}

/// Per-channel mean and standard deviation in lαβ space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabStats {
    pub mean: [f64; 3],
    pub std: [f64; 3],
}

impl LabStats {
    /// Statistics of a typical H&E stained tissue region.
    pub const REFERENCE: LabStats = LabStats {
        mean: [3.87, -0.036, 0.014],
        std: [0.12, 0.030, 0.012],
    };

    fn of_pixels(lab: &[[f64; 3]]) -> Self {
        let n = lab.len().max(1) as f64;
        let mut mean = [0.0; 3];
        for px in lab {
            for (m, v) in mean.iter_mut().zip(px) {
                *m += v / n;
            }
        }
        let mut var = [0.0; 3];
        for px in lab {
            for ((s, v), m) in var.iter_mut().zip(px).zip(mean) {
                *s += (v - m).powi(2) / n;
            }
        }
        LabStats {
            mean,
            std: var.map(f64::sqrt),
        }
    }

    pub fn of_image(image: &RgbImage) -> Self {
        let lab: Vec<_> = image.pixels().map(|&px| rgb_to_lab(px)).collect();
        Self::of_pixels(&lab)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReinhardNormalizer {
    target: LabStats,
}

impl Default for ReinhardNormalizer {
    fn default() -> Self {
        ReinhardNormalizer {
            target: LabStats::REFERENCE,
        }
    }
}

impl ReinhardNormalizer {
    pub fn target(&self) -> LabStats {
        self.target
    }
}

impl StainNormalizer for ReinhardNormalizer {
    fn fit(&mut self, target: &RgbImage) -> Result<()> {
        self.target = LabStats::of_image(target);
        Ok(())
    }

    fn transform(&self, tile: &RgbImage) -> Result<RgbImage> {
        let lab: Vec<_> = tile.pixels().map(|&px| rgb_to_lab(px)).collect();
        let source = LabStats::of_pixels(&lab);
        let mut pixels = lab.into_iter();
        Ok(RgbImage::from_fn(tile.width(), tile.height(), |_, _| {
            let px = pixels.next().unwrap_or_default();
            lab_to_rgb(std::array::from_fn(|c| {
                // a flat channel is shifted but not scaled
                let scale = if source.std[c] > 0.0 {
                    self.target.std[c] / source.std[c]
                } else {
                    1.0
                };
                (px[c] - source.mean[c]) * scale + self.target.mean[c]
            }))
        }))
    }
}

/// Build the normalizer for `method`, fitted against `stain_target` or the
/// built-in reference when no target image is configured.
pub fn fitted_normalizer(
    method: NormMethod,
    stain_target: Option<&Path>,
) -> Result<Box<dyn StainNormalizer>> {
    let mut normalizer: Box<dyn StainNormalizer> = match method {
        NormMethod::Reinhard => Box::<ReinhardNormalizer>::default(),
        NormMethod::Identity => Box::new(IdentityNormalizer),
    };
    if let Some(path) = stain_target {
        let target = image::open(path)
            .with_context(|| format!("While reading stain target {path:?}"))?
            .to_rgb8();
        normalizer.fit(&target)?;
        info!("fitted {method:?} stain normalizer to {path:?}");
    }
    Ok(normalizer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stained(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x + y) % 3 == 0 {
                Rgb([120, 60, 150])
            } else {
                Rgb([230, 170, 210])
            }
        })
    }

    fn max_channel_diff(a: &RgbImage, b: &RgbImage) -> u8 {
        a.pixels()
            .zip(b.pixels())
            .flat_map(|(p, q)| (0..3).map(move |c| p[c].abs_diff(q[c])))
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn test_lab_round_trip() {
        for px in [[0, 0, 0], [255, 255, 255], [200, 120, 180], [10, 200, 40]] {
            let back = lab_to_rgb(rgb_to_lab(Rgb(px)));
            assert!(
                back.0.iter().zip(px).all(|(b, p)| b.abs_diff(p) <= 2),
                "{px:?} -> {back:?}"
            );
        }
    }

    #[test]
    fn test_fitted_to_itself_is_near_identity() -> Result<()> {
        let tile = stained(16, 16);
        let mut normalizer = ReinhardNormalizer::default();
        normalizer.fit(&tile)?;
        let out = normalizer.transform(&tile)?;
        assert!(max_channel_diff(&tile, &out) <= 3);
        Ok(())
    }

    #[test]
    fn test_transform_matches_target_statistics() -> Result<()> {
        let mut normalizer = ReinhardNormalizer::default();
        normalizer.fit(&stained(16, 16))?;
        let pale = RgbImage::from_fn(16, 16, |x, y| {
            if (x + y) % 3 == 0 {
                Rgb([180, 150, 200])
            } else {
                Rgb([240, 225, 235])
            }
        });
        let out = LabStats::of_image(&normalizer.transform(&pale)?);
        let target = normalizer.target();
        assert!(
            out.mean
                .iter()
                .zip(target.mean)
                .all(|(o, t)| (o - t).abs() < 0.02),
            "{out:?} vs {target:?}"
        );
        Ok(())
    }

    #[test]
    fn test_flat_tile() -> Result<()> {
        let flat = RgbImage::from_pixel(4, 4, Rgb([200, 200, 200]));
        let out = ReinhardNormalizer::default().transform(&flat)?;
        assert_eq!(out.dimensions(), (4, 4));
        let first = out[(0, 0)];
        assert!(out.pixels().all(|&px| px == first));
        Ok(())
    }

    #[test]
    fn test_identity() -> Result<()> {
        let tile = stained(5, 3);
        let normalizer = fitted_normalizer(NormMethod::Identity, None)?;
        assert_eq!(normalizer.transform(&tile)?, tile);
        Ok(())
    }

    #[test]
    fn test_missing_target_image() {
        assert!(fitted_normalizer(NormMethod::Reinhard, Some(Path::new("/no/such.png"))).is_err());
    }
}
