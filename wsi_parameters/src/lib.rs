//! wsi_parameters
#![deny(missing_docs)]

use anyhow::{bail, Context, Result};
use log::warn;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// File name looked up next to the running executable.
pub const PARAMETERS_FILE_NAME: &str = "parameters.toml";

/// Scalar used to decide whether a patch contains tissue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureStatistic {
    /// Standard deviation of each colour channel over the window, averaged
    /// over the channels.
    ChannelStd,
    /// Standard deviation across the channels of each pixel, averaged over
    /// the window.
    PixelChromaStd,
}

/// Stain normalization applied to tissue patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormMethod {
    /// Reinhard mean/std colour transfer in lαβ space.
    Reinhard,
    /// Patches are written as read from the slide.
    Identity,
}

impl NormMethod {
    /// Short tag used in slide directory and tile names.
    pub fn tag(self) -> &'static str {
        match self {
            NormMethod::Reinhard => "Rein",
            NormMethod::Identity => "None",
        }
    }
}

/// Tunable parameters of the tiling, counting and merging steps.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Parameters {
    /// Edge length in pixels of the extraction grid.
    pub patch_size: u32,
    /// Patches whose texture statistic exceeds this value are tissue.
    pub threshold_std: f64,
    /// Which texture statistic to compare against `threshold_std`.
    pub texture_statistic: TextureStatistic,
    /// Stain normalization applied to tissue patches.
    pub norm_method: NormMethod,
    /// Reference image the stain normalizer is fitted against. The built-in
    /// reference statistics are used when unset.
    pub stain_target: Option<PathBuf>,
    /// Thickness in pixels of the nucleus contours drawn on overlays.
    pub overlay_line_thickness: u32,
    /// The merged overlay is downsampled by this integer factor.
    pub downsample_factor: u32,
    /// Program and leading arguments of the nucleus segmentation model.
    /// `--tile-list <file> --output-dir <dir>` is appended on invocation.
    pub segmentor_command: Vec<String>,
}

/// Values used when no parameters.toml is found or a key is omitted.
pub const DEFAULT_PARAMETERS: Parameters = Parameters {
    patch_size: 1024,
    threshold_std: 5.0,
    texture_statistic: TextureStatistic::ChannelStd,
    norm_method: NormMethod::Reinhard,
    stain_target: None,
    overlay_line_thickness: 4,
    downsample_factor: 10,
    segmentor_command: Vec::new(),
};

impl Default for Parameters {
    fn default() -> Self {
        DEFAULT_PARAMETERS
    }
}

/// Log every field that differs from its default.
macro_rules! warn_non_default {
    ($params:expr, $($field:ident),+ $(,)?) => {
        $(
            if DEFAULT_PARAMETERS.$field != $params.$field {
                warn!("using non-default {} = {:?}", stringify!($field), $params.$field);
            }
        )+
    };
}

impl Parameters {
    /// Load parameters from `path`, or from parameters.toml next to the
    /// running executable when no path is given. A missing file next to the
    /// executable falls back to the defaults; a missing explicit file is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = if let Some(path) = path {
            path.to_path_buf()
        } else {
            let path = std::env::current_exe()
                .context("Unable to locate the running executable")?
                .with_file_name(PARAMETERS_FILE_NAME);
            if !path.exists() {
                warn!(
                    "could not find {PARAMETERS_FILE_NAME} at {}, falling back to defaults",
                    path.display()
                );
                return Ok(DEFAULT_PARAMETERS);
            }
            path
        };
        let s = std::fs::read_to_string(&path).with_context(|| path.display().to_string())?;
        Self::from_toml_str(&s).with_context(|| path.display().to_string())
    }

    /// Parse and validate parameters from TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let params: Parameters = toml::from_str(s)?;
        params.validate()?;
        warn_non_default!(
            params,
            patch_size,
            threshold_std,
            texture_statistic,
            norm_method,
            stain_target,
            overlay_line_thickness,
            downsample_factor,
            segmentor_command,
        );
        Ok(params)
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 {
            bail!("patch_size must be positive");
        }
        if !self.threshold_std.is_finite() {
            bail!("threshold_std must be finite, got {}", self.threshold_std);
        }
        if self.overlay_line_thickness == 0 {
            bail!("overlay_line_thickness must be positive");
        }
        if self.downsample_factor == 0 {
            bail!("downsample_factor must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let params = Parameters::from_toml_str("patch_size = 512\nnorm_method = \"identity\"")?;
        assert_eq!(params.patch_size, 512);
        assert_eq!(params.norm_method, NormMethod::Identity);
        assert_eq!(params.threshold_std, DEFAULT_PARAMETERS.threshold_std);
        assert_eq!(params.downsample_factor, 10);
        assert!(params.segmentor_command.is_empty());
        Ok(())
    }

    #[test]
    fn test_empty_file_is_default() -> Result<()> {
        assert_eq!(Parameters::from_toml_str("")?, DEFAULT_PARAMETERS);
        Ok(())
    }

    #[test]
    fn test_rejects_unknown_and_invalid() {
        assert!(Parameters::from_toml_str("patch_sise = 12").is_err());
        assert!(Parameters::from_toml_str("patch_size = 0").is_err());
        assert!(Parameters::from_toml_str("downsample_factor = 0").is_err());
        assert!(Parameters::from_toml_str("texture_statistic = \"variance\"").is_err());
    }

    #[test]
    fn test_load_explicit_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(PARAMETERS_FILE_NAME);
        std::fs::write(
            &path,
            "threshold_std = 7.5\ntexture_statistic = \"pixel_chroma_std\"\n\
             segmentor_command = [\"python\", \"segment.py\"]\n",
        )?;
        let params = Parameters::load(Some(&path))?;
        assert_eq!(params.threshold_std, 7.5);
        assert_eq!(params.texture_statistic, TextureStatistic::PixelChromaStd);
        assert_eq!(params.segmentor_command, ["python", "segment.py"]);

        assert!(Parameters::load(Some(&dir.path().join("missing.toml"))).is_err());
        Ok(())
    }

    #[test]
    fn test_norm_tags() {
        assert_eq!(NormMethod::Reinhard.tag(), "Rein");
        assert_eq!(NormMethod::Identity.tag(), "None");
    }
}
