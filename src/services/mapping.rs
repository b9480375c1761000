// src/services/mapping.rs

use csv::{ReaderBuilder, Trim};
use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;

use crate::services::config::UnmappedPolicy;
use crate::services::error::MappingError;

pub type FeatureTables = HashMap<String, HashMap<String, f64>>;

/// Categorical-value to number lookup tables, one per feature
///
/// Built once before the pipeline starts and shared read-only between the
/// source and anything else that needs it.
#[derive(Clone, Debug, Default)]
pub struct FeatureMapping {
    tables: FeatureTables,
    unmapped: UnmappedPolicy,
    strict_cells: bool,
}

impl FeatureMapping {
    /// A mapping with no tables; every lookup parses the raw value
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: FeatureTables) -> Self {
        Self {
            tables,
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, unmapped: UnmappedPolicy) -> Self {
        self.unmapped = unmapped;
        self
    }

    /// When set, a cell that is parsed directly and is not a number is an
    /// error instead of 0.0
    pub fn with_strict_cells(mut self, strict_cells: bool) -> Self {
        self.strict_cells = strict_cells;
        self
    }

    /// Loads every `<feature>.csv` file in `dir`
    ///
    /// # Arguments
    /// * `dir` - Directory holding one two-column table per feature. The first
    ///   row of each table is a header and is skipped.
    ///
    /// # Returns
    /// * `Result<Self, MappingError>` - Fails on an unreadable directory or file,
    ///   a row without exactly two columns, or a non-numeric mapped value
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, MappingError> {
        let dir = dir.as_ref();
        info!("Loading feature mappings from {}", dir.display());

        let entries = std::fs::read_dir(dir).map_err(|source| MappingError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| MappingError::ReadDir {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut tables = FeatureTables::new();
        for path in paths {
            let Some(feature) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let table = load_table(&path)?;
            debug!("Feature {} has {} mapped values", feature, table.len());
            tables.entry(feature.to_string()).or_default().extend(table);
        }

        info!("Loaded mappings for {} features", tables.len());
        Ok(Self::from_tables(tables))
    }

    /// Resolves a raw cell value to a number.
    ///
    /// Values of features without a table are parsed directly. For features
    /// with a table, a missing value falls back to the unmapped policy.
    /// Empty or non-numeric cells that are parsed directly become 0.0 unless
    /// strict cells are enabled.
    pub fn lookup(&self, feature: &str, raw: &str) -> Result<f64, MappingError> {
        let raw = raw.trim();
        match self.tables.get(feature) {
            None => self.parse_cell(feature, raw),
            Some(table) => match table.get(raw) {
                Some(value) => Ok(*value),
                None => match self.unmapped {
                    UnmappedPolicy::Zero => Ok(0.0),
                    UnmappedPolicy::ParseRaw => self.parse_cell(feature, raw),
                },
            },
        }
    }

    fn parse_cell(&self, feature: &str, raw: &str) -> Result<f64, MappingError> {
        match raw.parse::<f64>() {
            Ok(value) => Ok(value),
            Err(_) if self.strict_cells => Err(MappingError::NotNumeric {
                feature: feature.to_string(),
                value: raw.to_string(),
            }),
            Err(_) => {
                debug!("Feature {}: {:?} is not numeric, using 0", feature, raw);
                Ok(0.0)
            }
        }
    }

    pub fn features(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn unmapped_policy(&self) -> UnmappedPolicy {
        self.unmapped
    }

    pub fn strict_cells(&self) -> bool {
        self.strict_cells
    }

    /// Owned copy of every table
    pub fn snapshot(&self) -> FeatureTables {
        self.tables.clone()
    }
}

fn load_table(path: &Path) -> Result<HashMap<String, f64>, MappingError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)
        .map_err(|source| MappingError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

    let mut table = HashMap::new();
    for row in reader.records() {
        let row = row.map_err(|source| MappingError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);

        if row.len() != 2 {
            return Err(MappingError::MalformedRow {
                path: path.to_path_buf(),
                line,
                columns: row.len(),
            });
        }

        let value = row[1].parse::<f64>().map_err(|_| MappingError::BadValue {
            path: path.to_path_buf(),
            line,
            value: row[1].to_string(),
        })?;
        table.insert(row[0].to_string(), value);
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_city_table(dir: &Path) {
        std::fs::write(
            dir.join("city.csv"),
            "city,value\nbeijing,1\nnew york,2.5\n",
        )
        .unwrap();
    }

    #[test]
    fn test_load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_city_table(dir.path());
        std::fs::write(dir.path().join("README.txt"), "not a table").unwrap();
        std::fs::create_dir(dir.path().join("nested.csv")).unwrap();

        let mapping = FeatureMapping::load(dir.path()).unwrap();
        assert_eq!(mapping.features(), vec!["city"]);
        assert_eq!(mapping.lookup("city", "beijing").unwrap(), 1.0);
        assert_eq!(mapping.lookup("city", " new york ").unwrap(), 2.5);
        // header row is not a data row
        assert_eq!(mapping.lookup("city", "city").unwrap(), 0.0);
    }

    #[test]
    fn test_unmapped_value_policies() {
        let dir = tempfile::tempdir().unwrap();
        write_city_table(dir.path());

        let zero = FeatureMapping::load(dir.path()).unwrap();
        assert_eq!(zero.lookup("city", "shanghai").unwrap(), 0.0);
        assert_eq!(zero.lookup("city", "").unwrap(), 0.0);

        let parse = zero.clone().with_policy(UnmappedPolicy::ParseRaw);
        assert_eq!(parse.lookup("city", "7").unwrap(), 7.0);
        // not numeric either, so it lands on 0 like any unparseable cell
        assert_eq!(parse.lookup("city", "shanghai").unwrap(), 0.0);

        let strict = parse.with_strict_cells(true);
        assert!(matches!(
            strict.lookup("city", "shanghai"),
            Err(MappingError::NotNumeric { .. })
        ));
        // mapped values never hit the parser
        assert_eq!(strict.lookup("city", "beijing").unwrap(), 1.0);
    }

    #[test]
    fn test_unknown_feature_parses_raw_value() {
        let mapping = FeatureMapping::empty();
        assert_eq!(mapping.lookup("age", "42").unwrap(), 42.0);
        assert_eq!(mapping.lookup("age", " -0.5 ").unwrap(), -0.5);
        assert_eq!(mapping.lookup("age", "forty").unwrap(), 0.0);
        assert_eq!(mapping.lookup("age", "").unwrap(), 0.0);
    }

    #[test]
    fn test_strict_cells_reject_unparseable_values() {
        let mapping = FeatureMapping::empty().with_strict_cells(true);
        assert!(mapping.strict_cells());
        assert_eq!(mapping.lookup("age", "42").unwrap(), 42.0);
        assert!(matches!(
            mapping.lookup("age", ""),
            Err(MappingError::NotNumeric { .. })
        ));
        assert!(matches!(
            mapping.lookup("age", "forty"),
            Err(MappingError::NotNumeric { .. })
        ));
    }

    #[test]
    fn test_lookup_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        write_city_table(dir.path());
        let mapping = FeatureMapping::load(dir.path()).unwrap();

        let first = mapping.lookup("city", "beijing").unwrap();
        for _ in 0..10 {
            assert_eq!(mapping.lookup("city", "beijing").unwrap(), first);
        }
    }

    #[test]
    fn test_malformed_row_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("city.csv"), "city,value\nbeijing,1,extra\n").unwrap();

        match FeatureMapping::load(dir.path()) {
            Err(MappingError::MalformedRow { columns, line, .. }) => {
                assert_eq!(columns, 3);
                assert_eq!(line, 2);
            }
            other => panic!("expected MalformedRow, got {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_mapped_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("city.csv"), "city,value\nbeijing,one\n").unwrap();
        assert!(matches!(
            FeatureMapping::load(dir.path()),
            Err(MappingError::BadValue { .. })
        ));
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FeatureMapping::load(dir.path().join("missing")),
            Err(MappingError::ReadDir { .. })
        ));
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let mut tables = FeatureTables::new();
        tables.insert("city".into(), HashMap::from([("beijing".to_string(), 1.0)]));
        let mapping = FeatureMapping::from_tables(tables);

        let mut copy = mapping.snapshot();
        copy.get_mut("city").unwrap().insert("beijing".into(), 9.0);
        assert_eq!(mapping.lookup("city", "beijing").unwrap(), 1.0);
    }
}
