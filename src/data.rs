// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Input bundle: paths to the seven input files, their loading order, and
//! the conditioning of covariate matrices (orientation, NaN policy,
//! zero-variance columns) before anything numeric happens.

use std::path::PathBuf;

use getset::Getters;
use log::{info, warn};
use ndarray::Array2;

use crate::errors::{Error, Result};
use crate::io::{self, EqtlRecord, Matrix};

#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct DataFiles {
    eqtl: PathBuf,
    genotype: PathBuf,
    expression: PathBuf,
    covariate: PathBuf,
    sample_to_dataset: Option<PathBuf>,
    tech_covariate: Option<PathBuf>,
    tech_covariate_with_inter: Option<PathBuf>,
}

impl DataFiles {
    pub fn new(
        eqtl: PathBuf,
        genotype: PathBuf,
        expression: PathBuf,
        covariate: PathBuf,
        sample_to_dataset: Option<PathBuf>,
        tech_covariate: Option<PathBuf>,
        tech_covariate_with_inter: Option<PathBuf>,
    ) -> Self {
        DataFiles {
            eqtl,
            genotype,
            expression,
            covariate,
            sample_to_dataset,
            tech_covariate,
            tech_covariate_with_inter,
        }
    }

    pub fn load_eqtls(&self) -> Result<Vec<EqtlRecord>> {
        io::load_eqtls(&self.eqtl)
    }

    pub fn load_genotype(&self) -> Result<Matrix> {
        io::load_matrix(&self.genotype)
    }

    pub fn load_expression(&self) -> Result<Matrix> {
        io::load_matrix(&self.expression)
    }

    pub fn load_covariates(&self) -> Result<Matrix> {
        io::load_matrix(&self.covariate)
    }

    pub fn load_sample_datasets(&self) -> Result<Option<Vec<(String, String)>>> {
        match &self.sample_to_dataset {
            Some(path) => Ok(Some(io::load_sample_datasets(path)?)),
            None => Ok(None),
        }
    }

    pub fn load_tech_covariates(&self) -> Result<Option<Matrix>> {
        match &self.tech_covariate {
            Some(path) => Ok(Some(io::load_matrix(path)?)),
            None => Ok(None),
        }
    }

    pub fn load_tech_covariates_with_inter(&self) -> Result<Option<Matrix>> {
        match &self.tech_covariate_with_inter {
            Some(path) => Ok(Some(io::load_matrix(path)?)),
            None => Ok(None),
        }
    }

    pub fn print_arguments(&self) {
        info!("Data arguments:");
        info!("  > eQTL input path: {}", self.eqtl.display());
        info!("  > Genotype input path: {}", self.genotype.display());
        info!("  > Expression input path: {}", self.expression.display());
        info!(
            "  > Technical covariates input path: {:?}",
            self.tech_covariate
        );
        info!(
            "  > Technical covariates with interaction input path: {:?}",
            self.tech_covariate_with_inter
        );
        info!("  > Covariates input path: {}", self.covariate.display());
        info!("  > Sample-dataset path: {:?}", self.sample_to_dataset);
        info!("");
    }
}

/// Dataset tags ordered by descending sample count (alphabetical on ties;
/// this order is authoritative everywhere) plus the one-hot indicator
/// matrix (samples x datasets).
pub fn construct_dataset_matrix(pairs: &[(String, String)]) -> (Vec<String>, Array2<f64>) {
    let mut counts: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for (_, dataset) in pairs {
        *counts.entry(dataset).or_insert(0) += 1;
    }
    let mut ordered: Vec<(&str, usize)> = counts.into_iter().collect();
    ordered.sort_by_key(|&(_, count)| std::cmp::Reverse(count));
    let datasets: Vec<String> = ordered.iter().map(|(name, _)| (*name).to_owned()).collect();

    let mut indicator = Array2::zeros((pairs.len(), datasets.len()));
    for (s, (_, dataset)) in pairs.iter().enumerate() {
        let d = datasets
            .iter()
            .position(|name| name == dataset)
            .expect("dataset seen during counting");
        indicator[[s, d]] = 1.0;
    }
    (datasets, indicator)
}

/// Orient a technical covariate matrix samples-on-rows, reject NaN, check
/// the sample order and drop zero-variance columns. Returns the values
/// (samples x covariates) and the covariate labels.
pub fn condition_tech_covariates(
    matrix: Matrix,
    name: &str,
    samples: &[String],
) -> Result<(Array2<f64>, Vec<String>)> {
    info!("\tWorking on technical covariates matrix '{}'", name);
    if matrix.has_nan() {
        return Err(Error::NanValues {
            name: name.to_owned(),
        });
    }

    let matrix = if matrix.ncols() == samples.len() {
        warn!("\t  Transposing matrix");
        matrix.transposed()
    } else {
        matrix
    };

    if matrix.row_labels != samples {
        return Err(Error::TechCovariateSampleMismatch {
            name: name.to_owned(),
        });
    }

    let keep: Vec<bool> = (0..matrix.ncols())
        .map(|c| {
            let column = matrix.values.column(c);
            let first = column[0];
            !column.iter().all(|&v| v == first)
        })
        .collect();
    let n_dropped = keep.iter().filter(|&&k| !k).count();
    if n_dropped > 0 {
        warn!("\t  Dropping {} columns with 0 variance", n_dropped);
    }

    let kept: Vec<usize> = (0..matrix.ncols()).filter(|&c| keep[c]).collect();
    let mut values = Array2::zeros((matrix.nrows(), kept.len()));
    for (out, &src) in kept.iter().enumerate() {
        values.column_mut(out).assign(&matrix.values.column(src));
    }
    let labels: Vec<String> = kept
        .iter()
        .map(|&c| matrix.col_labels[c].clone())
        .collect();
    info!(
        "\t  Technical covariates [{}]: {}",
        labels.len(),
        labels.join(", ")
    );
    Ok((values, labels))
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::array;

    fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(s, d)| ((*s).to_owned(), (*d).to_owned()))
            .collect()
    }

    #[test]
    fn datasets_are_ordered_by_descending_size() {
        let pairs = pairs(&[
            ("s1", "small"),
            ("s2", "big"),
            ("s3", "big"),
            ("s4", "big"),
            ("s5", "small"),
            ("s6", "mid"),
            ("s7", "mid"),
        ]);
        let (datasets, indicator) = construct_dataset_matrix(&pairs);
        assert_eq!(datasets, vec!["big", "mid", "small"]);
        assert_eq!(indicator.column(0).sum(), 3.0);
        assert_eq!(indicator[[0, 2]], 1.0);
        assert_eq!(indicator[[1, 0]], 1.0);
        assert_eq!(indicator.sum(), 7.0);
    }

    #[test]
    fn dataset_ties_stay_alphabetical() {
        let pairs = pairs(&[("s1", "zeta"), ("s2", "alpha"), ("s3", "alpha"), ("s4", "zeta")]);
        let (datasets, _) = construct_dataset_matrix(&pairs);
        assert_eq!(datasets, vec!["alpha", "zeta"]);
    }

    #[test]
    fn tech_covariates_are_transposed_and_filtered() {
        let samples: Vec<String> = vec!["s1".into(), "s2".into(), "s3".into()];
        // Covariates on rows: needs a transpose, and "flat" has no variance.
        let matrix = Matrix {
            row_labels: vec!["RIN".into(), "flat".into()],
            col_labels: samples.clone(),
            values: array![[0.2, 0.4, 0.6], [1.0, 1.0, 1.0]],
        };
        let (values, labels) = condition_tech_covariates(matrix, "tech. cov.", &samples).unwrap();
        assert_eq!(labels, vec!["RIN"]);
        assert_eq!(values.dim(), (3, 1));
        assert_eq!(values[[1, 0]], 0.4);
    }

    #[test]
    fn tech_covariates_reject_nan() {
        let samples: Vec<String> = vec!["s1".into(), "s2".into()];
        let matrix = Matrix {
            row_labels: samples.clone(),
            col_labels: vec!["RIN".into()],
            values: array![[0.2], [f64::NAN]],
        };
        assert!(matches!(
            condition_tech_covariates(matrix, "tech. cov.", &samples),
            Err(Error::NanValues { .. })
        ));
    }

    #[test]
    fn tech_covariates_must_match_sample_order() {
        let samples: Vec<String> = vec!["s1".into(), "s2".into()];
        let matrix = Matrix {
            row_labels: vec!["s2".into(), "s1".into()],
            col_labels: vec!["RIN".into()],
            values: array![[0.2], [0.4]],
        };
        assert!(matches!(
            condition_tech_covariates(matrix, "tech. cov.", &samples),
            Err(Error::TechCovariateSampleMismatch { .. })
        ));
    }
}
