//!
//! CSV ledgers written next to the tiles of a slide.
//!
//! `patches_info_<id>.csv`:
//! ```text
//! Lvl0:,<width>,<height>
//! No.,X,Y,Type
//! 1,0,0,blank
//! ...
//! ```
//!
//! `nucleus_info_<id>.csv`:
//! ```text
//! Tile,Dat File,Background,Epithelial,Lymphocyte,Macrophage,Neutrophil
//! <tile stem>,<artifact stem>,<counts...>
//! END,Total,<summed counts...>
//! ```
//!
#![allow(missing_docs)]

use crate::nucleus::{ClassCounts, NucleusClass};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

const DIMENSIONS_TAG: &str = "Lvl0:";
const PATCH_COLUMNS: [&str; 4] = ["No.", "X", "Y", "Type"];
const TILE_COLUMN: &str = "Tile";
const ARTIFACT_COLUMN: &str = "Dat File";
const END_TAG: &str = "END";
const TOTAL_TAG: &str = "Total";

/// Whether a patch holds tissue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchLabel {
    Blank,
    Cell,
}

impl PatchLabel {
    /// Tissue iff the texture statistic is strictly above the threshold.
    pub fn classify(statistic: f64, threshold: f64) -> Self {
        if statistic > threshold {
            PatchLabel::Cell
        } else {
            PatchLabel::Blank
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRow {
    /// 1-based, in extraction order
    pub index: u64,
    pub x: u32,
    pub y: u32,
    pub label: PatchLabel,
}

fn flexible_writer(path: &Path) -> Result<csv::Writer<File>> {
    csv::WriterBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("While creating {path:?}"))
}

fn flexible_reader(path: &Path) -> Result<csv::Reader<File>> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("While opening {path:?}"))
}

/// Writer for the coordinate/type ledger, kept open for a whole extraction.
pub struct PatchLedgerWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl PatchLedgerWriter {
    pub fn create(path: &Path, width: u32, height: u32) -> Result<Self> {
        let mut writer = flexible_writer(path)?;
        writer.write_record([DIMENSIONS_TAG, &width.to_string(), &height.to_string()])?;
        writer.write_record(PATCH_COLUMNS)?;
        Ok(PatchLedgerWriter {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn append(&mut self, row: &PatchRow) -> Result<()> {
        self.writer
            .serialize(row)
            .with_context(|| format!("While writing row {} to {:?}", row.index, self.path))
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("While flushing {:?}", self.path))
    }
}

/// A coordinate/type ledger read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchLedger {
    pub width: u32,
    pub height: u32,
    pub rows: Vec<PatchRow>,
}

impl PatchLedger {
    pub fn read(path: &Path) -> Result<Self> {
        let mut records = flexible_reader(path)?.into_records();
        let header = records
            .next()
            .with_context(|| format!("{path:?} is empty"))??;
        if header.get(0) != Some(DIMENSIONS_TAG) || header.len() < 3 {
            bail!("{path:?} does not start with a {DIMENSIONS_TAG} row");
        }
        let width = header[1].parse().context("Invalid slide width")?;
        let height = header[2].parse().context("Invalid slide height")?;

        let columns = records
            .next()
            .with_context(|| format!("{path:?} has no column row"))??;
        if columns.iter().ne(PATCH_COLUMNS) {
            bail!("unexpected columns {columns:?} in {path:?}");
        }

        let rows = records
            .map(|record| -> Result<PatchRow> { Ok(record?.deserialize(None)?) })
            .collect::<Result<_>>()
            .with_context(|| format!("While reading {path:?}"))?;
        Ok(PatchLedger {
            width,
            height,
            rows,
        })
    }
}

/// Writer for the per-tile nucleus count ledger. Each row is flushed as it is
/// written so the ledger survives a failure on a later tile.
pub struct NucleusLedgerWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    totals: ClassCounts,
}

impl NucleusLedgerWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let mut writer = flexible_writer(path)?;
        writer.write_record(
            [TILE_COLUMN, ARTIFACT_COLUMN]
                .into_iter()
                .chain(NucleusClass::ALL.map(NucleusClass::label)),
        )?;
        writer.flush()?;
        Ok(NucleusLedgerWriter {
            path: path.to_path_buf(),
            writer,
            totals: ClassCounts::default(),
        })
    }

    fn write_counts(&mut self, first: &str, second: &str, counts: ClassCounts) -> Result<()> {
        let counts = counts.as_array().map(|count| count.to_string());
        self.writer
            .write_record(
                [first, second]
                    .into_iter()
                    .chain(counts.iter().map(String::as_str)),
            )
            .with_context(|| format!("While writing {first} to {:?}", self.path))?;
        self.writer
            .flush()
            .with_context(|| format!("While flushing {:?}", self.path))
    }

    pub fn append(&mut self, tile: &str, artifact: &str, counts: ClassCounts) -> Result<()> {
        self.write_counts(tile, artifact, counts)?;
        self.totals += counts;
        Ok(())
    }

    pub fn totals(&self) -> ClassCounts {
        self.totals
    }

    /// Write the `END,Total` row and return the totals.
    pub fn finish(mut self) -> Result<ClassCounts> {
        let totals = self.totals;
        self.write_counts(END_TAG, TOTAL_TAG, totals)?;
        Ok(totals)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NucleusRow {
    pub tile: String,
    pub artifact: String,
    pub counts: ClassCounts,
}

/// Read every row of a nucleus ledger after the column row, including the
/// `END,Total` row when present.
pub fn read_nucleus_ledger(path: &Path) -> Result<Vec<NucleusRow>> {
    flexible_reader(path)?
        .into_records()
        .skip(1)
        .map(|record| -> Result<NucleusRow> {
            let record = record?;
            if record.len() != 2 + NucleusClass::ALL.len() {
                bail!("expected {} fields in {record:?}", 2 + NucleusClass::ALL.len());
            }
            let mut counts = [0u64; NucleusClass::ALL.len()];
            for (count, field) in counts.iter_mut().zip(record.iter().skip(2)) {
                *count = field.parse()?;
            }
            Ok(NucleusRow {
                tile: record[0].to_string(),
                artifact: record[1].to_string(),
                counts: counts.into(),
            })
        })
        .collect::<Result<_>>()
        .with_context(|| format!("While reading {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_patch_ledger_layout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("patches_info_s_Rein.csv");
        let mut ledger = PatchLedgerWriter::create(&path, 200, 130)?;
        for (index, x, y, label) in [
            (1, 0, 0, PatchLabel::Blank),
            (2, 128, 0, PatchLabel::Cell),
            (3, 0, 128, PatchLabel::Blank),
        ] {
            ledger.append(&PatchRow { index, x, y, label })?;
        }
        ledger.finish()?;

        assert_eq!(
            std::fs::read_to_string(&path)?,
            "Lvl0:,200,130\nNo.,X,Y,Type\n1,0,0,blank\n2,128,0,cell\n3,0,128,blank\n"
        );
        let read = PatchLedger::read(&path)?;
        assert_eq!((read.width, read.height), (200, 130));
        assert_eq!(read.rows[1].label, PatchLabel::Cell);
        assert_eq!(read.rows.len(), 3);
        Ok(())
    }

    #[test]
    fn test_classify_is_strict() {
        assert_eq!(PatchLabel::classify(5.0, 5.0), PatchLabel::Blank);
        assert_eq!(PatchLabel::classify(5.0001, 5.0), PatchLabel::Cell);
        assert_eq!(PatchLabel::classify(0.0, 0.0), PatchLabel::Blank);
    }

    #[test]
    fn test_nucleus_ledger_totals() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nucleus_info_s_Rein.csv");
        let mut ledger = NucleusLedgerWriter::create(&path)?;
        ledger.append("s_Rein_0_0", "s_Rein_0_0", [0, 3, 1, 0, 2].into())?;
        ledger.append("s_Rein_0_1024", "s_Rein_0_1024", [1, 0, 4, 5, 0].into())?;
        let totals = ledger.finish()?;
        assert_eq!(totals.as_array(), [1, 3, 5, 5, 2]);

        let text = std::fs::read_to_string(&path)?;
        assert!(text
            .starts_with("Tile,Dat File,Background,Epithelial,Lymphocyte,Macrophage,Neutrophil\n"));
        assert!(text.ends_with("END,Total,1,3,5,5,2\n"));

        let rows = read_nucleus_ledger(&path)?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].tile, "s_Rein_0_1024");
        Ok(())
    }

    #[test]
    fn test_partial_nucleus_ledger_is_readable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("n.csv");
        let mut ledger = NucleusLedgerWriter::create(&path)?;
        ledger.append("a_0_0", "a_0_0", [0, 1, 0, 0, 0].into())?;
        // dropped without finish, as on a failure mid-way
        drop(ledger);
        let rows = read_nucleus_ledger(&path)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].counts.total(), 1);
        Ok(())
    }
}
