// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Assembly of the covariate correction matrices and the residualisation of
//! the expression matrix against them, with or without genotype-interaction
//! terms. The per-row fits run on the worker pool; NaN cells are preserved.

use log::warn;
use nalgebra::{DMatrix, DVector};
use ndarray::{concatenate, Array2, ArrayView2, Axis, Zip};

use crate::stats;

/// The two correction designs shared by every component: `base` enters the
/// model as-is (without the intercept, which is added at fit time), `inter`
/// is multiplied element-wise with the genotype of the row under correction.
#[derive(Debug, Clone, Default)]
pub struct CorrectionMatrices {
    base: Option<Array2<f64>>,
    inter: Option<Array2<f64>>,
    labels: Vec<String>,
}

impl CorrectionMatrices {
    /// Mirror of the construction order used throughout: dataset dummies
    /// (all but the largest), technical covariates, interacting technical
    /// covariates; the interaction design carries all dataset dummies.
    pub fn construct(
        dataset_m: &Array2<f64>,
        dataset_labels: &[String],
        tcov: Option<(&Array2<f64>, &[String])>,
        tcov_inter: Option<(&Array2<f64>, &[String])>,
    ) -> Self {
        let mut base: Option<Array2<f64>> = None;
        let mut inter: Option<Array2<f64>> = None;
        let mut base_labels = vec!["Intercept".to_owned()];
        let mut inter_labels = Vec::new();

        if dataset_m.ncols() > 1 {
            base = Some(dataset_m.slice(ndarray::s![.., 1..]).to_owned());
            base_labels.extend(dataset_labels.iter().skip(1).cloned());
            inter = Some(dataset_m.to_owned());
            inter_labels.extend(
                dataset_labels
                    .iter()
                    .map(|label| format!("{} x Genotype", label)),
            );
        }

        if let Some((m, labels)) = tcov {
            base = Some(hstack(base, m.view()));
            base_labels.extend(labels.iter().cloned());
        }

        if let Some((m, labels)) = tcov_inter {
            base = Some(hstack(base, m.view()));
            base_labels.extend(labels.iter().cloned());
            inter = Some(hstack(inter, m.view()));
            inter_labels.extend(labels.iter().map(|label| format!("{} x Genotype", label)));
        }

        base_labels.extend(inter_labels);
        CorrectionMatrices {
            base,
            inter,
            labels: base_labels,
        }
    }

    /// Append an identified component to both designs; from here on it is
    /// removed from the expression and competes as a genotype interaction.
    pub fn append_component(&mut self, component: &[f64], label: &str) {
        let column =
            ArrayView2::from_shape((component.len(), 1), component).expect("column vector");
        self.base = Some(hstack(self.base.take(), column));
        self.inter = Some(hstack(self.inter.take(), column));
        self.labels.push(label.to_owned());
        self.labels.push(format!("{} x Genotype", label));
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_none() && self.inter.is_none()
    }
}

fn hstack(left: Option<Array2<f64>>, right: ArrayView2<f64>) -> Array2<f64> {
    match left {
        Some(l) => {
            let right_owned = right.to_owned();
            concatenate(Axis(1), &[l.view(), right_owned.view()]).expect("matching sample counts")
        }
        None => right.to_owned(),
    }
}

/// Residualise every expression row against the correction design,
/// including the genotype-interaction block. NaN cells stay NaN; columns
/// with zero variance inside the row's sample mask are dropped (the
/// intercept always stays).
pub fn remove_covariates(
    y_m: &mut Array2<f64>,
    matrices: &CorrectionMatrices,
    geno_m: &Array2<f64>,
) {
    if matrices.is_empty() {
        warn!("no covariates to be removed, skipping step");
        return;
    }

    Zip::from(y_m.axis_iter_mut(Axis(0)))
        .and(geno_m.axis_iter(Axis(0)))
        .par_for_each(|mut y_row, geno_row| {
            let mask: Vec<usize> = (0..y_row.len()).filter(|&s| !y_row[s].is_nan()).collect();
            if mask.is_empty() {
                return;
            }

            let mut columns: Vec<Vec<f64>> = vec![vec![1.0; mask.len()]];
            if let Some(base) = &matrices.base {
                for c in 0..base.ncols() {
                    columns.push(mask.iter().map(|&s| base[[s, c]]).collect());
                }
            }
            if let Some(inter) = &matrices.inter {
                for c in 0..inter.ncols() {
                    columns.push(mask.iter().map(|&s| inter[[s, c]] * geno_row[s]).collect());
                }
            }

            let residuals = masked_residuals(&columns, &mask, &y_row.to_vec());
            for (j, &s) in mask.iter().enumerate() {
                y_row[s] = residuals[j];
            }
        });
}

/// Residualise every expression row against the reduced element-wise design
/// [1, genotype, context]; returns a fresh matrix, NaN cells preserved.
pub fn remove_covariates_elementwise(
    y_m: &Array2<f64>,
    geno_m: &Array2<f64>,
    context: &[f64],
) -> Array2<f64> {
    let mut corrected = y_m.to_owned();
    Zip::from(corrected.axis_iter_mut(Axis(0)))
        .and(geno_m.axis_iter(Axis(0)))
        .par_for_each(|mut y_row, geno_row| {
            let mask: Vec<usize> = (0..y_row.len()).filter(|&s| !y_row[s].is_nan()).collect();
            if mask.is_empty() {
                return;
            }

            let columns = vec![
                vec![1.0; mask.len()],
                mask.iter().map(|&s| geno_row[s]).collect(),
                mask.iter().map(|&s| context[s]).collect(),
            ];

            let residuals = masked_residuals(&columns, &mask, &y_row.to_vec());
            for (j, &s) in mask.iter().enumerate() {
                y_row[s] = residuals[j];
            }
        });
    corrected
}

fn masked_residuals(columns: &[Vec<f64>], mask: &[usize], y_full: &[f64]) -> Vec<f64> {
    let kept: Vec<usize> = (0..columns.len())
        .filter(|&c| c == 0 || !has_zero_variance(&columns[c]))
        .collect();

    let x = DMatrix::from_fn(mask.len(), kept.len(), |r, c| columns[kept[c]][r]);
    let y = DVector::from_iterator(mask.len(), mask.iter().map(|&s| y_full[s]));
    stats::residuals(&x, &y).iter().cloned().collect()
}

fn has_zero_variance(column: &[f64]) -> bool {
    let first = column[0];
    column.iter().all(|&v| v == first)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use ndarray::array;

    fn dataset_two_groups() -> (Array2<f64>, Vec<String>) {
        let mut m = Array2::zeros((6, 2));
        for s in 0..3 {
            m[[s, 0]] = 1.0;
        }
        for s in 3..6 {
            m[[s, 1]] = 1.0;
        }
        (m, vec!["big".to_owned(), "small".to_owned()])
    }

    #[test]
    fn construct_orders_dataset_then_technical() {
        let (dataset_m, labels) = dataset_two_groups();
        let tcov = array![[0.1], [0.4], [0.3], [0.9], [0.2], [0.5]];
        let tcov_labels = vec!["RIN".to_owned()];
        let matrices = CorrectionMatrices::construct(
            &dataset_m,
            &labels,
            Some((&tcov, &tcov_labels)),
            None,
        );
        assert_eq!(
            matrices.labels(),
            &[
                "Intercept".to_owned(),
                "small".to_owned(),
                "RIN".to_owned(),
                "big x Genotype".to_owned(),
                "small x Genotype".to_owned(),
            ]
        );
        assert_eq!(matrices.base.as_ref().unwrap().ncols(), 2);
        assert_eq!(matrices.inter.as_ref().unwrap().ncols(), 2);
    }

    #[test]
    fn single_dataset_without_technical_covariates_is_empty() {
        let dataset_m = Array2::ones((4, 1));
        let matrices =
            CorrectionMatrices::construct(&dataset_m, &["None".to_owned()], None, None);
        assert!(matrices.is_empty());
        assert_eq!(matrices.labels(), &["Intercept".to_owned()]);
    }

    #[test]
    fn residuals_are_orthogonal_to_design() {
        let (dataset_m, labels) = dataset_two_groups();
        let matrices = CorrectionMatrices::construct(&dataset_m, &labels, None, None);
        let geno = array![[0.0, 1.0, 2.0, 0.0, 1.0, 2.0]];
        let mut y = array![[1.2, -0.4, 2.2, 0.3, 1.9, -1.1]];
        remove_covariates(&mut y, &matrices, &geno);

        // Residuals sum to zero overall and within each dataset dummy.
        let total: f64 = y.row(0).iter().sum();
        assert_relative_eq!(total, 0.0, epsilon = 1e-9);
        let small: f64 = y.row(0).iter().skip(3).sum();
        assert_relative_eq!(small, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn nan_cells_are_preserved_and_excluded_from_fit() {
        let (dataset_m, labels) = dataset_two_groups();
        let matrices = CorrectionMatrices::construct(&dataset_m, &labels, None, None);
        let geno = array![[0.0, 1.0, 2.0, 0.0, 1.0, 2.0]];
        let mut y = array![[1.2, f64::NAN, 2.2, 0.3, 1.9, -1.1]];
        remove_covariates(&mut y, &matrices, &geno);
        assert!(y[[0, 1]].is_nan());
        assert!(y.row(0).iter().filter(|v| !v.is_nan()).count() == 5);
    }

    #[test]
    fn elementwise_residuals_remove_genotype_and_context() {
        let geno = array![[0.0, 1.0, 2.0, 0.0, 1.0, 2.0]];
        let context = [-1.0, 0.5, 1.0, -0.5, 0.0, 1.5];
        // y is an exact linear function of genotype and context.
        let y = array![[2.0 - 1.0, 2.5 + 0.5, 3.0 + 1.0, 2.0 - 0.5, 2.5, 3.0 + 1.5]];
        let corrected = remove_covariates_elementwise(&y, &geno, &context);
        for &v in corrected.row(0) {
            assert_relative_eq!(v, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn zero_variance_column_is_dropped_not_fatal() {
        // The context is constant, leaving only intercept + genotype.
        let geno = array![[0.0, 1.0, 2.0, 0.0, 1.0, 2.0]];
        let context = [3.0; 6];
        let y = array![[0.1, 1.1, 1.9, -0.1, 0.9, 2.1]];
        let corrected = remove_covariates_elementwise(&y, &geno, &context);
        let total: f64 = corrected.row(0).iter().sum();
        assert_relative_eq!(total, 0.0, epsilon = 1e-9);
        assert!(corrected.row(0).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn append_component_grows_both_designs() {
        let (dataset_m, labels) = dataset_two_groups();
        let mut matrices = CorrectionMatrices::construct(&dataset_m, &labels, None, None);
        let before = matrices.base.as_ref().unwrap().ncols();
        matrices.append_component(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], "PIC1");
        assert_eq!(matrices.base.as_ref().unwrap().ncols(), before + 1);
        assert_eq!(matrices.inter.as_ref().unwrap().ncols(), 3);
        assert!(matrices
            .labels()
            .iter()
            .any(|l| l == "PIC1 x Genotype"));
    }
}
