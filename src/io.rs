// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Tab-separated matrix and table I/O, optionally gzip-compressed (detected
//! by the `.gz` suffix), plus the raw `.npy` vector format used for
//! per-component checkpoints.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use ndarray::Array2;
use serde::Deserialize;

use crate::errors::{Error, Result};

/// A dense numeric matrix with row and column labels attached.
#[derive(Debug, Clone)]
pub struct Matrix {
    pub row_labels: Vec<String>,
    pub col_labels: Vec<String>,
    pub values: Array2<f64>,
}

impl Matrix {
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn has_nan(&self) -> bool {
        self.values.iter().any(|v| v.is_nan())
    }

    /// Keep only the rows flagged in `keep` (same length as `row_labels`).
    pub fn select_rows(&self, keep: &[bool]) -> Matrix {
        assert_eq!(keep.len(), self.nrows());
        let rows: Vec<usize> = (0..self.nrows()).filter(|&i| keep[i]).collect();
        let mut values = Array2::zeros((rows.len(), self.ncols()));
        for (out, &src) in rows.iter().enumerate() {
            values.row_mut(out).assign(&self.values.row(src));
        }
        Matrix {
            row_labels: rows.iter().map(|&i| self.row_labels[i].clone()).collect(),
            col_labels: self.col_labels.clone(),
            values,
        }
    }

    pub fn transposed(self) -> Matrix {
        Matrix {
            values: self.values.t().to_owned(),
            row_labels: self.col_labels,
            col_labels: self.row_labels,
        }
    }
}

/// One row of the eQTL discovery table. Extra columns are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct EqtlRecord {
    #[serde(rename = "SNPName")]
    pub snp: String,
    #[serde(rename = "ProbeName")]
    pub probe: String,
    #[serde(rename = "FDR")]
    pub fdr: f64,
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn open_writer(path: &Path) -> Result<Box<dyn Write>> {
    let file = File::create(path)?;
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(GzEncoder::new(
            BufWriter::new(file),
            Compression::default(),
        )))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

fn parse_cell(field: &str, row: usize, path: &Path) -> Result<f64> {
    match field {
        "" | "NA" | "nan" | "NaN" => Ok(f64::NAN),
        other => other.parse::<f64>().map_err(|_| Error::InvalidNumeric {
            value: other.to_owned(),
            row,
            path: path.to_owned(),
        }),
    }
}

/// Format a value the way the tabular outputs expect: NaN becomes an empty
/// cell, everything else round-trips through the shortest decimal form.
pub fn format_cell(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        format!("{}", value)
    }
}

/// Load a labeled numeric matrix. The first header cell is the index name,
/// the first column of every record the row label.
pub fn load_matrix(path: &Path) -> Result<Matrix> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(open_reader(path)?);

    let col_labels: Vec<String> = rdr
        .headers()?
        .iter()
        .skip(1)
        .map(|s| s.to_owned())
        .collect();

    let mut row_labels = Vec::new();
    let mut cells = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        let mut fields = record.iter();
        row_labels.push(
            fields
                .next()
                .ok_or_else(|| Error::EmptyMatrix {
                    path: path.to_owned(),
                })?
                .to_owned(),
        );
        for field in fields {
            cells.push(parse_cell(field, i, path)?);
        }
    }
    if row_labels.is_empty() {
        return Err(Error::EmptyMatrix {
            path: path.to_owned(),
        });
    }

    let values = Array2::from_shape_vec((row_labels.len(), col_labels.len()), cells)
        .map_err(|_| Error::EmptyMatrix {
            path: path.to_owned(),
        })?;
    debug!(
        "loaded matrix {} with shape ({}, {})",
        path.display(),
        values.nrows(),
        values.ncols()
    );
    Ok(Matrix {
        row_labels,
        col_labels,
        values,
    })
}

/// Save a labeled numeric matrix; NaN cells are written empty.
pub fn save_matrix(
    path: &Path,
    index_label: &str,
    row_labels: &[String],
    col_labels: &[String],
    values: &Array2<f64>,
) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(open_writer(path)?);

    let mut header = Vec::with_capacity(col_labels.len() + 1);
    header.push(index_label.to_owned());
    header.extend(col_labels.iter().cloned());
    wtr.write_record(&header)?;

    for (label, row) in row_labels.iter().zip(values.rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(label.clone());
        record.extend(row.iter().map(|&v| format_cell(v)));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    debug!(
        "saved matrix {} with shape ({}, {})",
        path.display(),
        values.nrows(),
        values.ncols()
    );
    Ok(())
}

/// Save an index-free table of preformatted string rows.
pub fn save_table<I>(path: &Path, header: &[&str], rows: I) -> Result<()>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(open_writer(path)?);
    wtr.write_record(header)?;
    for row in rows {
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Load the eQTL discovery table; requires the `SNPName`, `ProbeName` and
/// `FDR` columns.
pub fn load_eqtls(path: &Path) -> Result<Vec<EqtlRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(open_reader(path)?);

    let headers = rdr.headers()?.clone();
    for required in &["SNPName", "ProbeName", "FDR"] {
        if !headers.iter().any(|h| h == *required) {
            return Err(Error::MissingEqtlColumn {
                column: (*required).to_owned(),
                path: path.to_owned(),
            });
        }
    }

    let mut records = Vec::new();
    for record in rdr.deserialize() {
        let record: EqtlRecord = record?;
        records.push(record);
    }
    Ok(records)
}

/// Load the sample-to-dataset link file: two columns in order, sample
/// identifier then dataset tag.
pub fn load_sample_datasets(path: &Path) -> Result<Vec<(String, String)>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(open_reader(path)?);

    let mut pairs = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let sample = record.get(0).unwrap_or("").to_owned();
        let dataset = record.get(1).unwrap_or("").to_owned();
        pairs.push((sample, dataset));
    }
    Ok(pairs)
}

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Write a float64 vector in NumPy `.npy` v1.0 format (`<f8`, C order).
pub fn save_npy(path: &Path, values: &[f64]) -> Result<()> {
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );
    // Pad with spaces so the payload starts 64-byte aligned.
    let unpadded = NPY_MAGIC.len() + 4 + header.len() + 1;
    let pad = (64 - unpadded % 64) % 64;
    for _ in 0..pad {
        header.push(' ');
    }
    header.push('\n');

    let mut wtr = BufWriter::new(File::create(path)?);
    wtr.write_all(NPY_MAGIC)?;
    wtr.write_all(&[1, 0])?;
    wtr.write_u16::<LittleEndian>(header.len() as u16)?;
    wtr.write_all(header.as_bytes())?;
    for &v in values {
        wtr.write_f64::<LittleEndian>(v)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Read a float64 vector from NumPy `.npy` v1.0 format.
pub fn load_npy(path: &Path) -> Result<Vec<f64>> {
    let invalid = || Error::InvalidComponentFile {
        path: path.to_owned(),
    };

    let mut rdr = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 6];
    rdr.read_exact(&mut magic)?;
    if magic != *NPY_MAGIC {
        return Err(invalid());
    }
    let mut version = [0u8; 2];
    rdr.read_exact(&mut version)?;
    if version[0] != 1 {
        return Err(invalid());
    }
    let header_len = rdr.read_u16::<LittleEndian>()? as usize;
    let mut header = vec![0u8; header_len];
    rdr.read_exact(&mut header)?;
    let header = String::from_utf8(header).map_err(|_| invalid())?;
    if !header.contains("'<f8'") || header.contains("'fortran_order': True") {
        return Err(invalid());
    }
    let shape = header.split("'shape': (").nth(1).ok_or_else(invalid)?;
    let n: usize = shape
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .map_err(|_| invalid())?;

    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(rdr.read_f64::<LittleEndian>()?);
    }
    Ok(values)
}

/// Component checkpoint path inside a `PIC{k}` directory.
pub fn component_path(comp_outdir: &Path) -> PathBuf {
    comp_outdir.join("component.npy")
}
