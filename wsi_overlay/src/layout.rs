#![allow(missing_docs)]

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use wsi_parameters::NormMethod;

/// Default root under which slide directories are created.
pub const DEFAULT_UPLOADS_DIR: &str = "./uploads";

const BLANK_DIR: &str = "blank";
const CELL_DIR: &str = "cell";
const OVERLAY_DIR: &str = "overlay";
const RESULT_DIR: &str = "result";

/// Names of the append-only run logs, one per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogName {
    Patch,
    Predict,
    Merge,
}

impl LogName {
    pub fn file_name(self) -> &'static str {
        match self {
            LogName::Patch => "patch-log.txt",
            LogName::Predict => "predict_log.txt",
            LogName::Merge => "merge-log.txt",
        }
    }
}

/// Paths of everything produced for one slide:
///
/// ```text
/// <uploads>/<slide_id>_<tag>/
///     blank/  cell/  overlay/  result/
///     patches_info_<slide_id>_<tag>.csv
///     nucleus_info_<slide_id>_<tag>.csv
///     Merge_<slide_id>_<tag>.png
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideLayout {
    slide_path: PathBuf,
    id_name: String,
    root: PathBuf,
}

impl SlideLayout {
    pub fn new(uploads: &Path, slide_path: &Path, norm_method: NormMethod) -> Result<Self> {
        let slide_id = slide_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .with_context(|| format!("Unable to derive a slide id from {slide_path:?}"))?;
        let id_name = format!("{slide_id}_{}", norm_method.tag());
        Ok(SlideLayout {
            slide_path: slide_path.to_path_buf(),
            root: uploads.join(&id_name),
            id_name,
        })
    }

    pub fn slide_path(&self) -> &Path {
        &self.slide_path
    }

    /// `<slide_id>_<tag>`, the prefix of every tile name
    pub fn id_name(&self) -> &str {
        &self.id_name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blank_dir(&self) -> PathBuf {
        self.root.join(BLANK_DIR)
    }

    pub fn cell_dir(&self) -> PathBuf {
        self.root.join(CELL_DIR)
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.root.join(OVERLAY_DIR)
    }

    /// Where the segmentation model writes its per-tile artifacts
    pub fn result_dir(&self) -> PathBuf {
        self.root.join(RESULT_DIR)
    }

    pub fn patch_ledger_path(&self) -> PathBuf {
        self.root.join(format!("patches_info_{}.csv", self.id_name))
    }

    pub fn nucleus_ledger_path(&self) -> PathBuf {
        self.root.join(format!("nucleus_info_{}.csv", self.id_name))
    }

    /// Tissue tile list handed to the segmentation model
    pub fn tile_list_path(&self) -> PathBuf {
        self.root.join(format!("tile_list_{}.txt", self.id_name))
    }

    pub fn merge_temp_path(&self) -> PathBuf {
        self.root.join(format!("merged_temp_{}.png", self.id_name))
    }

    pub fn merged_path(&self) -> PathBuf {
        self.root.join(format!("Merge_{}.png", self.id_name))
    }

    pub fn log_path(&self, log: LogName) -> PathBuf {
        self.root.join(log.file_name())
    }

    /// Create the slide directory and its four subdirectories.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            self.blank_dir(),
            self.cell_dir(),
            self.overlay_dir(),
            self.result_dir(),
        ] {
            std::fs::create_dir_all(&dir).with_context(|| format!("While creating {dir:?}"))?;
        }
        Ok(())
    }
}
