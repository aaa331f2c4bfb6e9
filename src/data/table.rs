use ndarray::{Array1, Array2, Axis};
use std::io::Read;
use std::path::Path;

use crate::error::{PipelineError, Result};

/// Column schema of the Boston housing features, used by the built-in prediction samples
pub const BOSTON_FEATURES: [&str; 13] = [
    "CRIM", "ZN", "INDUS", "CHAS", "NOX", "RM", "AGE", "DIS", "RAD", "TAX", "PTRATIO", "B", "LSTAT",
];

/// Named numeric columns over a dense row-major matrix
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    names: Vec<String>,
    values: Array2<f64>,
}

impl FeatureTable {
    pub fn new(names: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if names.len() != values.ncols() {
            return Err(PipelineError::MalformedData(format!(
                "{} column names for {} columns",
                names.len(),
                values.ncols()
            )));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(PipelineError::MalformedData(format!("duplicate column '{}'", name)));
            }
        }
        Ok(Self { names, values })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_cols(&self) -> usize {
        self.values.ncols()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            names: self.names.clone(),
            values: self.values.select(Axis(0), rows),
        }
    }

    /// Reorder/subset columns to `names`; every requested column must exist
    pub fn align_to(&self, names: &[String]) -> Result<Array2<f64>> {
        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            let idx = self
                .column_index(name)
                .ok_or_else(|| PipelineError::MissingFeature(name.clone()))?;
            indices.push(idx);
        }
        Ok(self.values.select(Axis(1), &indices))
    }

    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let (names, values) = read_numeric_csv(file, &path.display().to_string())?;
        Self::new(names, values)
    }

    /// Two rows of Boston-schema samples used when no samples file is given
    pub fn boston_example() -> Self {
        let rows: [[f64; 13]; 2] = [
            [0.03, 18.0, 2.31, 0.0, 0.538, 6.575, 65.2, 4.09, 1.0, 296.0, 15.3, 396.9, 4.98],
            [0.1, 0.0, 7.07, 0.0, 0.469, 6.0, 68.2, 3.5, 2.0, 242.0, 17.8, 392.8, 9.14],
        ];
        Self {
            names: BOSTON_FEATURES.iter().map(|s| s.to_string()).collect(),
            values: ndarray::arr2(&rows),
        }
    }
}

/// Row-aligned features and target. `index` carries the original row ids so
/// filtering steps keep row identity.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: FeatureTable,
    target: Array1<f64>,
    index: Vec<usize>,
}

impl Dataset {
    pub fn new(features: FeatureTable, target: Array1<f64>) -> Result<Self> {
        let index = (0..features.n_rows()).collect();
        Self::with_index(features, target, index)
    }

    pub fn with_index(features: FeatureTable, target: Array1<f64>, index: Vec<usize>) -> Result<Self> {
        if features.n_rows() != target.len() || index.len() != target.len() {
            return Err(PipelineError::MalformedData(format!(
                "features have {} rows, target {} values, index {} entries",
                features.n_rows(),
                target.len(),
                index.len()
            )));
        }
        Ok(Self { features, target, index })
    }

    pub fn features(&self) -> &FeatureTable {
        &self.features
    }

    pub fn target(&self) -> &Array1<f64> {
        &self.target
    }

    pub fn index(&self) -> &[usize] {
        &self.index
    }

    pub fn n_rows(&self) -> usize {
        self.target.len()
    }

    pub fn feature_names(&self) -> &[String] {
        self.features.names()
    }

    /// Positional row selection applied to features, target and index together
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            features: self.features.select_rows(rows),
            target: self.target.select(Axis(0), rows),
            index: rows.iter().map(|&r| self.index[r]).collect(),
        }
    }

    pub fn retain(&self, keep: &[bool]) -> Self {
        let rows: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter_map(|(i, &k)| if k { Some(i) } else { None })
            .collect();
        self.select_rows(&rows)
    }

    pub fn with_features(&self, values: Array2<f64>) -> Result<Self> {
        let features = FeatureTable::new(self.features.names.clone(), values)?;
        Self::with_index(features, self.target.clone(), self.index.clone())
    }
}

/// Parse a headered CSV whose cells are all numeric
pub fn read_numeric_csv<R: Read>(reader: R, source: &str) -> Result<(Vec<String>, Array2<f64>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let names: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_matches(|c| c == '\'' || c == '"').to_string())
        .collect();
    if names.is_empty() {
        return Err(PipelineError::MalformedData(format!("{}: no header row", source)));
    }

    let mut flat = Vec::new();
    let mut n_rows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != names.len() {
            return Err(PipelineError::MalformedData(format!(
                "{}: row {} has {} fields, expected {}",
                source,
                row + 1,
                record.len(),
                names.len()
            )));
        }
        for (col, cell) in record.iter().enumerate() {
            let value = parse_cell(cell).ok_or_else(|| {
                PipelineError::MalformedData(format!(
                    "{}: non-numeric value '{}' at row {}, column '{}'",
                    source,
                    cell,
                    row + 1,
                    names[col]
                ))
            })?;
            flat.push(value);
        }
        n_rows += 1;
    }

    if n_rows == 0 {
        return Err(PipelineError::MalformedData(format!("{}: no data rows", source)));
    }

    let values = Array2::from_shape_vec((n_rows, names.len()), flat)
        .map_err(|e| PipelineError::MalformedData(format!("{}: {}", source, e)))?;
    Ok((names, values))
}

/// Numeric cell; nominal values may arrive quoted (`'1'`). Missing markers are rejected.
fn parse_cell(cell: &str) -> Option<f64> {
    let cell = cell.trim().trim_matches(|c| c == '\'' || c == '"');
    if cell.is_empty() || cell == "?" {
        return None;
    }
    cell.parse::<f64>().ok().filter(|v| v.is_finite())
}
