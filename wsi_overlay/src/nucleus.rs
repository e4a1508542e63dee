//!
//! Nucleus classes, per-tile segmentation artifacts and the interface to the
//! external segmentation model.
//!
#![allow(missing_docs)]

use anyhow::{bail, Context, Result};
use geo_types::{LineString, Polygon};
use image::Rgb;
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufReader, Read};
use std::ops::AddAssign;
use std::path::Path;
use std::process::Command;

/// Class ids produced by the segmentation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NucleusClass {
    Background = 0,
    Epithelial = 1,
    Lymphocyte = 2,
    Macrophage = 3,
    Neutrophil = 4,
}

impl NucleusClass {
    pub const ALL: [NucleusClass; 5] = [
        NucleusClass::Background,
        NucleusClass::Epithelial,
        NucleusClass::Lymphocyte,
        NucleusClass::Macrophage,
        NucleusClass::Neutrophil,
    ];

    pub fn from_id(id: i64) -> Option<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|id| Self::ALL.get(id).copied())
    }

    pub fn id(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            NucleusClass::Background => "Background",
            NucleusClass::Epithelial => "Epithelial",
            NucleusClass::Lymphocyte => "Lymphocyte",
            NucleusClass::Macrophage => "Macrophage",
            NucleusClass::Neutrophil => "Neutrophil",
        }
    }

    /// Contour colour on overlays. Background is not drawn.
    pub fn colour(self) -> Option<Rgb<u8>> {
        match self {
            NucleusClass::Background => None,
            NucleusClass::Epithelial => Some(Rgb([255, 0, 0])),
            NucleusClass::Lymphocyte => Some(Rgb([255, 255, 0])),
            NucleusClass::Macrophage => Some(Rgb([0, 255, 0])),
            NucleusClass::Neutrophil => Some(Rgb([0, 0, 255])),
        }
    }
}

impl Display for NucleusClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Number of nuclei per class.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassCounts([u64; NucleusClass::ALL.len()]);

impl ClassCounts {
    pub fn add(&mut self, class: NucleusClass) {
        self.0[class.id()] += 1;
    }

    pub fn get(&self, class: NucleusClass) -> u64 {
        self.0[class.id()]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Counts in class id order.
    pub fn as_array(&self) -> [u64; NucleusClass::ALL.len()] {
        self.0
    }
}

impl From<[u64; NucleusClass::ALL.len()]> for ClassCounts {
    fn from(counts: [u64; NucleusClass::ALL.len()]) -> Self {
        ClassCounts(counts)
    }
}

impl AddAssign for ClassCounts {
    fn add_assign(&mut self, rhs: Self) {
        for (lhs, rhs) in self.0.iter_mut().zip(rhs.0) {
            *lhs += rhs;
        }
    }
}

/// One nucleus as the model writes it. Other keys (centroid, box, prob) are
/// ignored.
#[derive(Debug, Deserialize)]
struct NucleusRecord {
    #[serde(rename = "type")]
    class_id: i64,
    #[serde(default)]
    contour: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Nucleus {
    pub id: String,
    pub class: NucleusClass,
    /// Tile-local pixel coordinates
    pub contour: Polygon<f64>,
}

/// All nuclei the model found in one tile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NucleusArtifact {
    pub nuclei: Vec<Nucleus>,
}

impl NucleusArtifact {
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("While opening {path:?}"))?;
        Self::from_reader(BufReader::new(file)).with_context(|| format!("While reading {path:?}"))
    }

    /// Parse `{"<id>": {"type": <class>, "contour": [[x, y], ...]}, ...}`.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let records: BTreeMap<String, NucleusRecord> = serde_json::from_reader(reader)?;
        let nuclei = records
            .into_iter()
            .map(|(id, record)| {
                let Some(class) = NucleusClass::from_id(record.class_id) else {
                    bail!("nucleus {id} has unknown class id {}", record.class_id);
                };
                Ok(Nucleus {
                    id,
                    class,
                    contour: Polygon::new(LineString::from(record.contour), vec![]),
                })
            })
            .collect::<Result<_>>()?;
        Ok(NucleusArtifact { nuclei })
    }

    pub fn counts(&self) -> ClassCounts {
        let mut counts = ClassCounts::default();
        for nucleus in &self.nuclei {
            counts.add(nucleus.class);
        }
        counts
    }
}

/// The nucleus segmentation model: reads the tiles listed in `tile_list`
/// (one path per line) and writes one `<tile_stem>.json` artifact per tile
/// into `output_dir`.
pub trait NucleusSegmentor {
    fn segment(&self, tile_list: &Path, output_dir: &Path) -> Result<()>;
}

/// Runs the model as an external program.
#[derive(Debug, Clone)]
pub struct CommandSegmentor {
    program: String,
    args: Vec<String>,
}

impl CommandSegmentor {
    pub fn new(command: &[String]) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("segmentor_command is not configured");
        };
        Ok(CommandSegmentor {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

/// Stands in for a model that could not be configured. Every segmentation
/// fails with the configuration error.
#[derive(Debug, Clone)]
pub struct UnavailableSegmentor {
    reason: String,
}

impl NucleusSegmentor for UnavailableSegmentor {
    fn segment(&self, _tile_list: &Path, _output_dir: &Path) -> Result<()> {
        bail!("{}", self.reason)
    }
}

/// The configured external model, or a segmentor that reports why there is
/// none. Configuration problems surface as failed prediction steps.
pub fn configured_segmentor(command: &[String]) -> Box<dyn NucleusSegmentor> {
    match CommandSegmentor::new(command) {
        Ok(segmentor) => Box::new(segmentor),
        Err(err) => {
            warn!("{err:#}");
            Box::new(UnavailableSegmentor {
                reason: format!("{err:#}"),
            })
        }
    }
}

impl NucleusSegmentor for CommandSegmentor {
    fn segment(&self, tile_list: &Path, output_dir: &Path) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--tile-list")
            .arg(tile_list)
            .arg("--output-dir")
            .arg(output_dir);
        info!("running {command:?}");
        let status = command
            .status()
            .with_context(|| format!("Unable to start segmentation model {}", self.program))?;
        if !status.success() {
            bail!("segmentation model {} exited with {status}", self.program);
        }
        Ok(())
    }
}
