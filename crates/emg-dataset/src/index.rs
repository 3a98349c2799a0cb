//! Sample index: the flat table of `{source_ref, label, group}` rows.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use emg_core::{ColumnNames, Error, Record, Result, Sample, SourceRef};
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Ordered table of samples backing a data module
#[derive(Debug, Clone, PartialEq)]
pub struct SampleIndex {
    samples: Vec<Sample>,
    /// Directory relative record paths resolve against
    base_dir: PathBuf,
}

impl SampleIndex {
    pub fn new(samples: Vec<Sample>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            samples,
            base_dir: base_dir.into(),
        }
    }

    /// Reads an index stored as a JSON array of row objects.
    ///
    /// A missing or unparsable file is reported as [`Error::DataUnavailable`].
    pub fn load(path: &Path, columns: &ColumnNames) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::DataUnavailable(format!("cannot read sample index {}: {e}", path.display()))
        })?;
        let rows: Vec<Map<String, Value>> = serde_json::from_str(&content).map_err(|e| {
            Error::DataUnavailable(format!("corrupt sample index {}: {e}", path.display()))
        })?;

        let samples = rows
            .iter()
            .enumerate()
            .map(|(i, row)| parse_row(i, row, columns))
            .collect::<Result<Vec<_>>>()?;

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        info!(
            "Loaded sample index {} ({} samples)",
            path.display(),
            samples.len()
        );
        Ok(Self { samples, base_dir })
    }

    /// Writes the index with the given column names
    pub fn save(&self, path: &Path, columns: &ColumnNames) -> Result<()> {
        let rows: Vec<Value> = self
            .samples
            .iter()
            .map(|sample| -> Result<Value> {
                let mut row = Map::new();
                row.insert(
                    columns.source.clone(),
                    serde_json::to_value(&sample.source_ref)?,
                );
                row.insert(columns.target.clone(), Value::from(sample.label));
                row.insert(columns.group.clone(), Value::from(sample.group.clone()));
                Ok(Value::Object(row))
            })
            .collect::<Result<_>>()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&rows)?)?;
        debug!("Wrote sample index {} ({} rows)", path.display(), rows.len());
        Ok(())
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn get(&self, i: usize) -> Option<&Sample> {
        self.samples.get(i)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Distinct group values, sorted
    pub fn groups(&self) -> BTreeSet<&str> {
        self.samples.iter().map(|s| s.group.as_str()).collect()
    }

    /// Labels are class indices, so the class count is the largest label + 1
    pub fn num_classes(&self) -> usize {
        self.samples
            .iter()
            .map(|s| s.label + 1)
            .max()
            .unwrap_or(0)
    }
}

fn parse_row(i: usize, row: &Map<String, Value>, columns: &ColumnNames) -> Result<Sample> {
    let field = |name: &str| {
        row.get(name).ok_or_else(|| {
            Error::DataUnavailable(format!("row {i} has no '{name}' column"))
        })
    };

    let source_ref = match field(&columns.source)? {
        Value::String(path) => SourceRef::Path(PathBuf::from(path)),
        value @ Value::Object(_) => SourceRef::Inline(
            serde_json::from_value::<Record>(value.clone())
                .map_err(|e| Error::DataUnavailable(format!("row {i}: bad record: {e}")))?,
        ),
        other => {
            return Err(Error::DataUnavailable(format!(
                "row {i}: unsupported source value {other}"
            )))
        }
    };

    let label = match field(&columns.target)? {
        Value::Number(n) => n.as_u64().map(|v| v as usize),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::DataUnavailable(format!("row {i}: label is not a class index")))?;

    let group = match field(&columns.group)? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(Error::DataUnavailable(format!(
                "row {i}: unsupported group value {other}"
            )))
        }
    };

    Ok(Sample::new(source_ref, label, group))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_with_custom_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        fs::write(
            &path,
            r#"[
                {"path": "frames/a.json", "gesture": 2, "subject": 7},
                {"path": {"rows": 1, "cols": 2, "data": [0.0, 1.0]}, "gesture": "0", "subject": "s1"}
            ]"#,
        )
        .unwrap();

        let columns = ColumnNames::new("path", "gesture", "subject");
        let index = SampleIndex::load(&path, &columns).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.base_dir(), dir.path());
        assert_eq!(index.samples()[0].group, "7");
        assert_eq!(index.samples()[0].label, 2);
        assert!(matches!(index.samples()[1].source_ref, SourceRef::Inline(_)));
        assert_eq!(index.num_classes(), 3);
    }

    #[test]
    fn test_missing_index_is_data_unavailable() {
        let err = SampleIndex::load(Path::new("/missing/index.json"), &ColumnNames::default())
            .unwrap_err();
        assert!(matches!(err, Error::DataUnavailable(_)));
    }

    #[test]
    fn test_inline_record_with_wrong_shape() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        fs::write(
            &path,
            r#"[
                {"record": {"rows": 1, "cols": 1, "data": [0.0]}, "label": 0, "series": "a"},
                {"record": {"rows": 2, "cols": 3, "data": [1.0]}, "label": 1, "series": "b"}
            ]"#,
        )
        .unwrap();

        let err = SampleIndex::load(&path, &ColumnNames::default()).unwrap_err();
        assert!(matches!(err, Error::DataUnavailable(_)));
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn test_missing_column() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        fs::write(&path, r#"[{"record": "a.json", "label": 0}]"#).unwrap();

        let err = SampleIndex::load(&path, &ColumnNames::default()).unwrap_err();
        assert!(err.to_string().contains("series"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("index.json");
        let index = SampleIndex::new(
            vec![
                Sample::new(SourceRef::Path("a.json".into()), 0, "1"),
                Sample::inline(Record::zeros(1, 1), 1, "2"),
            ],
            dir.path(),
        );
        let columns = ColumnNames::default();
        index.save(&path, &columns).unwrap();

        let loaded = SampleIndex::load(&path, &columns).unwrap();
        assert_eq!(loaded.samples(), index.samples());
        assert_eq!(loaded.groups().len(), 2);
    }
}
