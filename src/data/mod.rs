//! # Sample table
//!
//! In-memory table of ash samples: one id column, the element concentration
//! columns and a single response column, plus any derived columns appended by
//! later stages. Loading validates everything up front so that no analysis
//! stage ever sees a malformed table.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DataError>;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Expected an id column, at least one concentration column and a response column, found {found} columns")]
    MissingColumns { found: usize },

    #[error("Duplicate column name `{0}`")]
    DuplicateColumn(String),

    #[error("Row {row} has {found} fields, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Row {row}, column `{column}`: `{value}` is not a finite number")]
    NotNumeric {
        row: usize,
        column: String,
        value: String,
    },

    #[error("Row {row}, column `{column}`: concentration {value} is negative")]
    NegativeConcentration { row: usize, column: String, value: f64 },

    #[error("Table has no data rows")]
    Empty,

    #[error("Column `{name}` has {found} values, table has {expected} rows")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Unknown column `{0}`")]
    UnknownColumn(String),
}

#[derive(Debug, Clone)]
pub struct SampleTable {
    id_name: String,
    ids: Vec<String>,
    variables: Vec<String>,
    concentrations: Array2<f64>,
    response_name: String,
    response: Array1<f64>,
    derived: Vec<(String, Array1<f64>)>,
}

impl SampleTable {
    pub fn new(
        ids: Vec<String>,
        variables: Vec<String>,
        concentrations: Array2<f64>,
        response_name: impl Into<String>,
        response: Array1<f64>,
    ) -> Result<Self> {
        let n = ids.len();
        if n == 0 {
            return Err(DataError::Empty);
        }
        if concentrations.dim() != (n, variables.len()) {
            return Err(DataError::LengthMismatch {
                name: "concentrations".to_string(),
                expected: n * variables.len(),
                found: concentrations.len(),
            });
        }
        let response_name = response_name.into();
        if response.len() != n {
            return Err(DataError::LengthMismatch {
                name: response_name,
                expected: n,
                found: response.len(),
            });
        }
        for (row, values) in concentrations.outer_iter().enumerate() {
            for (col, &value) in values.iter().enumerate() {
                if !value.is_finite() {
                    return Err(DataError::NotNumeric {
                        row: row + 1,
                        column: variables[col].clone(),
                        value: value.to_string(),
                    });
                }
                if value < 0.0 {
                    return Err(DataError::NegativeConcentration {
                        row: row + 1,
                        column: variables[col].clone(),
                        value,
                    });
                }
            }
        }
        check_unique(
            std::iter::once(response_name.as_str()).chain(variables.iter().map(String::as_str)),
        )?;

        Ok(Self {
            id_name: "id".to_string(),
            ids,
            variables,
            concentrations,
            response_name,
            response,
            derived: Vec::new(),
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    /// Reads a headed CSV: first column ids, last column response, everything
    /// in between a non-negative concentration.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
        if headers.len() < 3 {
            return Err(DataError::MissingColumns {
                found: headers.len(),
            });
        }
        check_unique(headers.iter().map(String::as_str))?;

        let width = headers.len();
        let variables = headers[1..width - 1].to_vec();
        let mut ids = Vec::new();
        let mut values = Vec::new();
        let mut response = Vec::new();

        for (i, record) in rdr.records().enumerate() {
            let record = record?;
            let row = i + 1;
            if record.len() != width {
                return Err(DataError::RaggedRow {
                    row,
                    expected: width,
                    found: record.len(),
                });
            }
            ids.push(record[0].to_string());
            for (j, column) in variables.iter().enumerate() {
                values.push(parse_field(&record[j + 1], row, column)?);
            }
            response.push(parse_field(&record[width - 1], row, &headers[width - 1])?);
        }

        if ids.is_empty() {
            return Err(DataError::Empty);
        }

        let concentrations = concentration_matrix(ids.len(), variables.len(), values)?;

        let mut table = Self::new(
            ids,
            variables,
            concentrations,
            headers[width - 1].clone(),
            Array1::from(response),
        )?;
        table.id_name = headers[0].clone();
        Ok(table)
    }

    pub fn n_samples(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v == name)
    }

    pub fn concentrations(&self) -> ArrayView2<'_, f64> {
        self.concentrations.view()
    }

    pub fn column(&self, index: usize) -> ArrayView1<'_, f64> {
        self.concentrations.column(index)
    }

    /// Overwrites a concentration column, e.g. with its normalized values.
    /// Transformed values may be negative; they only have to be finite.
    pub fn replace_column(&mut self, index: usize, values: &[f64]) -> Result<()> {
        let name = self
            .variables
            .get(index)
            .ok_or_else(|| DataError::UnknownColumn(format!("#{}", index)))?
            .clone();
        if values.len() != self.n_samples() {
            return Err(DataError::LengthMismatch {
                name,
                expected: self.n_samples(),
                found: values.len(),
            });
        }
        if let Some(row) = values.iter().position(|v| !v.is_finite()) {
            return Err(DataError::NotNumeric {
                row: row + 1,
                column: name,
                value: values[row].to_string(),
            });
        }
        self.concentrations
            .column_mut(index)
            .iter_mut()
            .zip(values)
            .for_each(|(dst, &v)| *dst = v);
        Ok(())
    }

    pub fn response_name(&self) -> &str {
        &self.response_name
    }

    pub fn response(&self) -> ArrayView1<'_, f64> {
        self.response.view()
    }

    pub fn add_derived(&mut self, name: impl Into<String>, values: Array1<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.n_samples() {
            return Err(DataError::LengthMismatch {
                name,
                expected: self.n_samples(),
                found: values.len(),
            });
        }
        if name == self.response_name
            || self.variables.contains(&name)
            || self.derived.iter().any(|(d, _)| *d == name)
        {
            return Err(DataError::DuplicateColumn(name));
        }
        self.derived.push((name, values));
        Ok(())
    }

    pub fn derived(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.derived
            .iter()
            .find(|(d, _)| d == name)
            .map(|(_, values)| values.view())
    }

    pub fn derived_names(&self) -> impl Iterator<Item = &str> {
        self.derived.iter().map(|(name, _)| name.as_str())
    }

    /// Writes ids, current concentration values, derived columns and the response.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);

        let mut header = vec![self.id_name.as_str()];
        header.extend(self.variables.iter().map(String::as_str));
        header.extend(self.derived_names());
        header.push(self.response_name.as_str());
        wtr.write_record(&header)?;

        for (i, id) in self.ids.iter().enumerate() {
            let mut record = vec![id.clone()];
            record.extend(self.concentrations.row(i).iter().map(|v| v.to_string()));
            record.extend(self.derived.iter().map(|(_, values)| values[i].to_string()));
            record.push(self.response[i].to_string());
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Row-major values into an `n × width` matrix.
fn concentration_matrix(n: usize, width: usize, values: Vec<f64>) -> Result<Array2<f64>> {
    let found = values.len();
    Array2::from_shape_vec((n, width), values).map_err(|_| DataError::LengthMismatch {
        name: "concentrations".to_string(),
        expected: n * width,
        found,
    })
}

fn parse_field(raw: &str, row: usize, column: &str) -> Result<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DataError::NotNumeric {
            row,
            column: column.to_string(),
            value: raw.to_string(),
        })
}

fn check_unique<'a>(names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(DataError::DuplicateColumn(name.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const SAMPLE: &str = "\
sample,SiO2,Al2O3,Fe2O3,ST
s1,52.1,30.2,4.0,1380
s2,48.3,28.9,0.0,1350
s3,60.0,22.4,8.5,1290
";

    #[test]
    fn test_load_from_reader() {
        let table = SampleTable::from_reader(SAMPLE.as_bytes()).unwrap();

        assert_eq!(table.n_samples(), 3);
        assert_eq!(table.variables(), &["SiO2", "Al2O3", "Fe2O3"]);
        assert_eq!(table.response_name(), "ST");
        assert_eq!(table.ids()[1], "s2");
        assert_eq!(table.variable_index("Fe2O3"), Some(2));
        assert_eq!(table.column(2)[1], 0.0);
        assert_eq!(table.response()[2], 1290.0);
    }

    #[test]
    fn test_rejects_negative_concentration() {
        let csv = "id,a,b,y\n1,1.0,-2.0,3.0\n";
        let err = SampleTable::from_reader(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, DataError::NegativeConcentration { row: 1, .. }));
    }

    #[test]
    fn test_rejects_non_numeric() {
        let csv = "id,a,b,y\n1,1.0,n/a,3.0\n";
        let err = SampleTable::from_reader(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, DataError::NotNumeric { ref column, .. } if column == "b"));

        let csv = "id,a,b,y\n1,1.0,2.0,hot\n";
        assert!(SampleTable::from_reader(csv.as_bytes()).is_err());
    }

    #[test]
    fn test_rejects_ragged_rows_and_missing_columns() {
        let csv = "id,a,b,y\n1,1.0,2.0\n";
        let err = SampleTable::from_reader(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, DataError::RaggedRow { expected: 4, found: 3, .. }));

        let csv = "id,y\n1,2.0\n";
        let err = SampleTable::from_reader(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, DataError::MissingColumns { found: 2 }));

        let csv = "id,a,b,y\n";
        assert!(matches!(
            SampleTable::from_reader(csv.as_bytes()).unwrap_err(),
            DataError::Empty
        ));
    }

    #[test]
    fn test_concentration_matrix_shape() {
        let m = concentration_matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(m, array![[1.0, 2.0], [3.0, 4.0]]);

        let err = concentration_matrix(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap_err();
        assert!(matches!(
            err,
            DataError::LengthMismatch {
                expected: 6,
                found: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_replace_and_derive() {
        let mut table = SampleTable::from_reader(SAMPLE.as_bytes()).unwrap();

        table.replace_column(0, &[-1.0, 0.0, 1.0]).unwrap();
        assert_eq!(table.column(0).to_vec(), vec![-1.0, 0.0, 1.0]);
        assert!(table.replace_column(0, &[1.0, 2.0]).is_err());
        assert!(table.replace_column(0, &[1.0, f64::NAN, 2.0]).is_err());
        assert!(table.replace_column(9, &[1.0, 2.0, 3.0]).is_err());

        table.add_derived("score", array![0.5, -0.5, 0.0]).unwrap();
        assert_eq!(table.derived("score").unwrap()[0], 0.5);
        assert!(table.add_derived("score", array![1.0, 2.0, 3.0]).is_err());
        assert!(table.add_derived("ST", array![1.0, 2.0, 3.0]).is_err());
        assert!(table.add_derived("short", array![1.0]).is_err());
    }

    #[test]
    fn test_write_csv_includes_derived() {
        let mut table = SampleTable::from_reader(SAMPLE.as_bytes()).unwrap();
        table.add_derived("factor1_score", array![1.0, 2.0, 3.0]).unwrap();

        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let first = text.lines().next().unwrap();
        assert_eq!(first, "sample,SiO2,Al2O3,Fe2O3,factor1_score,ST");
        assert_eq!(text.lines().count(), 4);
    }
}
