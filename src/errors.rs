// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("the genotype file header does not match the sample-to-dataset link file")]
    GenotypeSampleMismatch,
    #[error("the expression file header does not match the sample-to-dataset link file")]
    ExpressionSampleMismatch,
    #[error("the covariates file header does not match the sample-to-dataset link file")]
    CovariateSampleMismatch,
    #[error("the {name} file indices do not match the sample-to-dataset link file")]
    TechCovariateSampleMismatch { name: String },
    #[error("the genotype file indices do not match the SNPName column of the eQTL file")]
    GenotypeEqtlMismatch,
    #[error("the expression file indices do not match the ProbeName column of the eQTL file")]
    ExpressionEqtlMismatch,
    #[error("the genotype file and the eQTL file differ in the number of rows")]
    GenotypeEqtlShapeMismatch,
    #[error("the expression file and the eQTL file differ in the number of rows")]
    ExpressionEqtlShapeMismatch,
    #[error("{name} matrix contains NaN values")]
    NanValues { name: String },
    #[error("no eQTLs remain after quality control")]
    NoEqtlsRemaining,
    #[error("eQTL table {path} misses required column {column}")]
    MissingEqtlColumn { column: String, path: PathBuf },
    #[error("matrix {path} contains non-numeric cell '{value}' in row {row}")]
    InvalidNumeric {
        value: String,
        row: usize,
        path: PathBuf,
    },
    #[error("matrix {path} is empty")]
    EmptyMatrix { path: PathBuf },
    #[error("component file {path} is not a little-endian float64 .npy vector")]
    InvalidComponentFile { path: PathBuf },
    #[error("component file {path} holds {found} values, expected one per sample ({expected})")]
    ComponentLengthMismatch {
        path: PathBuf,
        found: usize,
        expected: usize,
    },
}
