//! Core type definitions shared across the workspace.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A dense row-major `f32` matrix holding one EMG record.
///
/// For multi-channel recordings rows are electrode channels and columns are
/// time steps. HD-EMG frames store the electrode grid directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRecord")]
pub struct Record {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

/// Deserialized form of [`Record`] before its shape is checked
#[derive(Deserialize)]
struct RawRecord {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl TryFrom<RawRecord> for Record {
    type Error = Error;

    fn try_from(raw: RawRecord) -> Result<Self> {
        Record::new(raw.rows, raw.cols, raw.data)
    }
}

impl Record {
    /// Creates a record, checking that `data` matches the shape
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if rows * cols != data.len() {
            return Err(Error::Model(format!(
                "record shape {}x{} does not match {} values",
                rows,
                cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// A record filled with zeros
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Copies columns `[start, start + len)` into a new record
    pub fn column_window(&self, start: usize, len: usize) -> Result<Record> {
        if start + len > self.cols {
            return Err(Error::Model(format!(
                "window [{}, {}) exceeds {} columns",
                start,
                start + len,
                self.cols
            )));
        }
        let mut data = Vec::with_capacity(self.rows * len);
        for r in 0..self.rows {
            data.extend_from_slice(&self.row(r)[start..start + len]);
        }
        Ok(Record {
            rows: self.rows,
            cols: len,
            data,
        })
    }

    /// Reads a record stored as JSON
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::DataUnavailable(format!("failed to read record {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::DataUnavailable(format!("bad record {}: {e}", path.display()))
        })
    }

    /// Writes the record as JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// Where a sample's raw data lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceRef {
    /// Record file on disk, relative paths resolve against the index directory
    Path(PathBuf),
    /// Record embedded in the index itself
    Inline(Record),
}

/// One row of the sample index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub source_ref: SourceRef,
    pub label: usize,
    /// Subject/session identifier; all samples of a group share a fold bucket
    pub group: String,
}

impl Sample {
    pub fn new(source_ref: SourceRef, label: usize, group: impl Into<String>) -> Self {
        Self {
            source_ref,
            label,
            group: group.into(),
        }
    }

    pub fn inline(record: Record, label: usize, group: impl Into<String>) -> Self {
        Self::new(SourceRef::Inline(record), label, group)
    }
}

/// Column names used to read a sample index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnNames {
    pub source: String,
    pub target: String,
    pub group: String,
}

impl ColumnNames {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            group: group.into(),
        }
    }
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self::new("record", "label", "series")
    }
}

/// Supported EMG datasets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    #[serde(rename = "ninapro")]
    NinaPro,
    #[serde(rename = "csl-hdemg")]
    CslHdemg,
    #[serde(rename = "capgmyo")]
    CapgMyo,
    #[serde(rename = "myoarmband")]
    MyoArmband,
}

impl DatasetKind {
    /// Fixed location of the sample index under a processed-data root
    pub fn index_path(&self, root: &Path) -> PathBuf {
        match self {
            DatasetKind::NinaPro => root.join("NinaPro").join("NinaPro.json"),
            DatasetKind::CslHdemg => root.join("csl-hdemg").join("csl-hdemg.json"),
            DatasetKind::CapgMyo => root.join("capgmyo").join("capgmyo.json"),
            DatasetKind::MyoArmband => root.join("myoarmband").join("myoarmband.json"),
        }
    }

    /// Frame datasets keep one file per sample, the rest embed records inline
    pub fn stores_frames(&self) -> bool {
        matches!(self, DatasetKind::CslHdemg | DatasetKind::CapgMyo)
    }

    pub fn default_columns(&self) -> ColumnNames {
        if self.stores_frames() {
            ColumnNames::new("path", "label", "series")
        } else {
            ColumnNames::default()
        }
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetKind::NinaPro => write!(f, "ninapro"),
            DatasetKind::CslHdemg => write!(f, "csl-hdemg"),
            DatasetKind::CapgMyo => write!(f, "capgmyo"),
            DatasetKind::MyoArmband => write!(f, "myoarmband"),
        }
    }
}

impl std::str::FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "ninapro" => Ok(DatasetKind::NinaPro),
            "csl-hdemg" | "csl" => Ok(DatasetKind::CslHdemg),
            "capgmyo" => Ok(DatasetKind::CapgMyo),
            "myoarmband" | "myo-armband" => Ok(DatasetKind::MyoArmband),
            other => Err(Error::Configuration(format!("unknown dataset '{other}'"))),
        }
    }
}

/// Shape information needed to build a model matching a data module.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataParameters {
    pub input_rows: usize,
    pub input_cols: usize,
    pub num_classes: usize,
}

/// Index of a cross-validation fold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FoldIndex(pub usize);

impl FoldIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for FoldIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data split within a fold
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataSplit {
    Train,
    Validation,
    Test,
}

impl std::fmt::Display for DataSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSplit::Train => write!(f, "train"),
            DataSplit::Validation => write!(f, "val"),
            DataSplit::Test => write!(f, "test"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_shape_mismatch() {
        assert!(Record::new(2, 3, vec![0.0; 5]).is_err());
        let record = Record::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(record.shape(), [2, 3]);
        assert_eq!(record.get(1, 2), 6.0);
        assert_eq!(record.row(0), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_deserialize_checks_shape() {
        let bad = serde_json::from_str::<Record>(r#"{"rows":2,"cols":3,"data":[1.0]}"#);
        assert!(bad.is_err());
        let good: Record = serde_json::from_str(r#"{"rows":1,"cols":2,"data":[1.0,2.0]}"#).unwrap();
        assert_eq!(good.shape(), [1, 2]);
    }

    #[test]
    fn test_column_window() {
        let record = Record::new(2, 4, (0..8).map(|v| v as f32).collect()).unwrap();
        let window = record.column_window(1, 2).unwrap();
        assert_eq!(window.shape(), [2, 2]);
        assert_eq!(window.data, vec![1.0, 2.0, 5.0, 6.0]);
        assert!(record.column_window(3, 2).is_err());
    }

    #[test]
    fn test_record_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("r.json");
        let record = Record::new(1, 2, vec![0.5, -0.5]).unwrap();
        record.save(&path).unwrap();
        assert_eq!(Record::load(&path).unwrap(), record);
    }

    #[test]
    fn test_missing_record_is_data_unavailable() {
        let err = Record::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, Error::DataUnavailable(_)));
    }

    #[test]
    fn test_source_ref_untagged() {
        let path: SourceRef = serde_json::from_str("\"frames/0.json\"").unwrap();
        assert_eq!(path, SourceRef::Path(PathBuf::from("frames/0.json")));

        let inline: SourceRef =
            serde_json::from_str(r#"{"rows":1,"cols":1,"data":[2.0]}"#).unwrap();
        assert!(matches!(inline, SourceRef::Inline(_)));
    }

    #[test]
    fn test_dataset_kind_paths() {
        let root = Path::new("data");
        assert_eq!(
            DatasetKind::NinaPro.index_path(root),
            PathBuf::from("data/NinaPro/NinaPro.json")
        );
        assert!(DatasetKind::CslHdemg.stores_frames());
        assert_eq!(DatasetKind::CslHdemg.default_columns().source, "path");
        assert_eq!(DatasetKind::MyoArmband.default_columns().source, "record");
    }

    #[test]
    fn test_dataset_kind_parse() {
        assert_eq!("csl".parse::<DatasetKind>().unwrap(), DatasetKind::CslHdemg);
        assert_eq!("NinaPro".parse::<DatasetKind>().unwrap(), DatasetKind::NinaPro);
        assert!("mnist".parse::<DatasetKind>().is_err());
    }

    #[test]
    fn test_data_split_display() {
        assert_eq!(DataSplit::Train.to_string(), "train");
        assert_eq!(DataSplit::Validation.to_string(), "val");
        assert_eq!(DataSplit::Test.to_string(), "test");
    }
}
