// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Interaction-eQTL mapping: for a candidate context vector, every eQTL is
//! tested for a SNP x context interaction with a nested F-test, and the
//! Benjamini-Hochberg significant set is returned together with the
//! per-ieQTL quadratic log-likelihood coefficients that drive the joint
//! optimisation.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;

use crate::io::{format_cell, EqtlRecord};
use crate::stats;

pub const INTERACTION_TABLE_HEADER: [&str; 14] = [
    "snp",
    "gene",
    "covariate",
    "N",
    "beta-intercept",
    "beta-genotype",
    "beta-covariate",
    "beta-interaction",
    "std-intercept",
    "std-genotype",
    "std-covariate",
    "std-interaction",
    "p-value",
    "FDR",
];

/// Interaction fit of a single eQTL on the design [1, g, c, g*c].
#[derive(Debug, Clone)]
pub struct RowFit {
    pub n: usize,
    pub betas: [f64; 4],
    pub std: [f64; 4],
    pub rss_null: f64,
    pub rss_full: f64,
    pub p_value: f64,
}

fn fit_row(genotype: ArrayView1<f64>, expression: ArrayView1<f64>, context: &[f64]) -> RowFit {
    let samples: Vec<usize> = (0..genotype.len())
        .filter(|&s| !genotype[s].is_nan())
        .collect();
    let n = samples.len();

    let x = DMatrix::from_fn(n, 4, |r, c| {
        let s = samples[r];
        match c {
            0 => 1.0,
            1 => genotype[s],
            2 => context[s],
            _ => genotype[s] * context[s],
        }
    });
    let y = DVector::from_iterator(n, samples.iter().map(|&s| expression[s]));

    let x_null = x.columns(0, 3).into_owned();
    let rss_null = {
        let inv = stats::inverse(&x_null);
        let betas = stats::fit(&x_null, &y, &inv);
        stats::rss(&y, &stats::predict(&x_null, &betas))
    };

    let inv = stats::inverse(&x);
    let betas = stats::fit(&x, &y, &inv);
    let rss_full = stats::rss(&y, &stats::predict(&x, &betas));
    let std = stats::std_errors(rss_full, n, 4, &inv);

    RowFit {
        n,
        betas: [betas[0], betas[1], betas[2], betas[3]],
        std: [std[0], std[1], std[2], std[3]],
        rss_null,
        rss_full,
        p_value: stats::f_test_p_value(rss_null, rss_full, 3, 4, n),
    }
}

/// A significant interaction eQTL, reduced to the two per-sample arrays the
/// maximum-likelihood vertex needs: with frozen β the log-likelihood of the
/// context coordinate c_k is the quadratic a_k c_k² + b_k c_k + const.
#[derive(Debug, Clone)]
pub struct IeQtl {
    pub row: usize,
    samples: Vec<usize>,
    cov_coef: Vec<f64>,
    adj_y: Vec<f64>,
}

impl IeQtl {
    fn from_fit(
        row: usize,
        fit: &RowFit,
        genotype: ArrayView1<f64>,
        expression: ArrayView1<f64>,
    ) -> Self {
        let samples: Vec<usize> = (0..genotype.len())
            .filter(|&s| !genotype[s].is_nan())
            .collect();
        let [b0, b1, b2, b3] = fit.betas;
        let cov_coef: Vec<f64> = samples.iter().map(|&s| b2 + b3 * genotype[s]).collect();
        let adj_y: Vec<f64> = samples
            .iter()
            .map(|&s| expression[s] - b0 - b1 * genotype[s])
            .collect();
        IeQtl {
            row,
            samples,
            cov_coef,
            adj_y,
        }
    }

    pub fn samples(&self) -> &[usize] {
        &self.samples
    }

    /// Full-length (a, b) coefficient arrays, zero at missing samples so
    /// that the element-wise sum over ieQTLs is well defined.
    pub fn coefficients(&self, n_samples: usize) -> (Vec<f64>, Vec<f64>) {
        let mut a = vec![0.0; n_samples];
        let mut b = vec![0.0; n_samples];
        for (j, &s) in self.samples.iter().enumerate() {
            a[s] = -self.cov_coef[j] * self.cov_coef[j];
            b[s] = 2.0 * self.cov_coef[j] * self.adj_y[j];
        }
        (a, b)
    }

    /// Log-likelihood (up to the constant) of this ieQTL with the frozen β
    /// and a substituted context vector: -Σ residuals².
    pub fn log_likelihood(&self, context: &[f64]) -> f64 {
        let mut total = 0.0;
        for (j, &s) in self.samples.iter().enumerate() {
            let r = self.adj_y[j] - self.cov_coef[j] * context[s];
            total -= r * r;
        }
        total
    }
}

/// Outcome of mapping one candidate context over the full eQTL panel.
#[derive(Debug)]
pub struct Mapping {
    pub n_hits: usize,
    pub hits_per_sample: Vec<usize>,
    pub min_hits_per_sample: usize,
    pub ieqtls: Vec<IeQtl>,
    pub table: Vec<Vec<String>>,
}

/// Fit the interaction model of every eQTL against `context`, adjust the
/// p-values with Benjamini-Hochberg and collect the significant set
/// (q <= alpha) with its optimisation coefficients.
pub fn find_ieqtls(
    eqtls: &[EqtlRecord],
    geno_m: &Array2<f64>,
    expr_m: &Array2<f64>,
    context: &[f64],
    covariate: &str,
    alpha: f64,
) -> Mapping {
    let n_samples = geno_m.ncols();

    let fits: Vec<RowFit> = (0..eqtls.len())
        .into_par_iter()
        .map(|i| fit_row(geno_m.row(i), expr_m.row(i), context))
        .collect();

    let p_values: Vec<f64> = fits.iter().map(|f| f.p_value).collect();
    let q_values = stats::benjamini_hochberg(&p_values);

    let mut ieqtls = Vec::new();
    let mut hits_per_sample = vec![0usize; n_samples];
    let mut table = Vec::with_capacity(eqtls.len());
    for (i, (fit, eqtl)) in fits.iter().zip(eqtls.iter()).enumerate() {
        if q_values[i] <= alpha {
            let ieqtl = IeQtl::from_fit(i, fit, geno_m.row(i), expr_m.row(i));
            for &s in ieqtl.samples() {
                hits_per_sample[s] += 1;
            }
            ieqtls.push(ieqtl);
        }
        table.push(table_row(eqtl, covariate, fit, q_values[i]));
    }

    Mapping {
        n_hits: ieqtls.len(),
        min_hits_per_sample: hits_per_sample.iter().cloned().min().unwrap_or(0),
        hits_per_sample,
        ieqtls,
        table,
    }
}

fn table_row(eqtl: &EqtlRecord, covariate: &str, fit: &RowFit, fdr: f64) -> Vec<String> {
    let mut row = vec![
        eqtl.snp.clone(),
        eqtl.probe.clone(),
        covariate.to_owned(),
        format_cell(fit.n as f64),
    ];
    row.extend(fit.betas.iter().map(|&v| format_cell(v)));
    row.extend(fit.std.iter().map(|&v| format_cell(v)));
    row.push(format_cell(fit.p_value));
    row.push(format_cell(fdr));
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn eqtl(i: usize) -> EqtlRecord {
        EqtlRecord {
            snp: format!("rs{}", i),
            probe: format!("ENSG{}", i),
            fdr: 0.0,
        }
    }

    /// 60 samples, balanced genotype groups, a smooth context gradient.
    fn synthetic_panel(with_interaction: bool) -> (Array2<f64>, Array2<f64>, Vec<f64>) {
        let s = 60;
        let genotype: Vec<f64> = (0..s).map(|i| (i % 3) as f64).collect();
        let context: Vec<f64> = (0..s).map(|i| (i as f64) / 10.0 - 3.0).collect();
        let expression: Vec<f64> = (0..s)
            .map(|i| {
                let g = genotype[i];
                let c = context[i];
                let interaction = if with_interaction { 1.5 * g * c } else { 0.0 };
                0.4 * g + interaction + 0.01 * ((i * 7 % 13) as f64 - 6.0)
            })
            .collect();
        let geno_m = Array2::from_shape_vec((1, s), genotype).unwrap();
        let expr_m = Array2::from_shape_vec((1, s), expression).unwrap();
        (geno_m, expr_m, context)
    }

    #[test]
    fn planted_interaction_is_significant() {
        let (geno_m, expr_m, context) = synthetic_panel(true);
        let mapping = find_ieqtls(&[eqtl(0)], &geno_m, &expr_m, &context, "ctx", 0.05);
        assert_eq!(mapping.n_hits, 1);
        assert_eq!(mapping.min_hits_per_sample, 1);
        assert!(mapping.hits_per_sample.iter().all(|&h| h == 1));
        assert_eq!(mapping.table.len(), 1);
    }

    #[test]
    fn pure_eqtl_without_interaction_is_not() {
        // Noise is projected out of the full design, so the interaction
        // term has nothing left to explain beyond the main effects.
        let (geno_m, _, context) = synthetic_panel(false);
        let s = geno_m.ncols();
        let x = DMatrix::from_fn(s, 4, |r, c| match c {
            0 => 1.0,
            1 => geno_m[[0, r]],
            2 => context[r],
            _ => geno_m[[0, r]] * context[r],
        });
        let noise =
            DVector::from_iterator(s, (0..s).map(|i| 0.05 * (((i * 7) % 13) as f64 - 6.0)));
        let noise_orth = stats::residuals(&x, &noise);
        let expression: Vec<f64> = (0..s)
            .map(|i| 0.4 * geno_m[[0, i]] + 0.1 * context[i] + noise_orth[i])
            .collect();
        let expr_m = Array2::from_shape_vec((1, s), expression).unwrap();
        let mapping = find_ieqtls(&[eqtl(0)], &geno_m, &expr_m, &context, "ctx", 0.05);
        assert_eq!(mapping.n_hits, 0);
        assert_eq!(mapping.min_hits_per_sample, 0);
    }

    #[test]
    fn exact_model_pvalue_is_one_without_interaction_residual() {
        // A perfect eQTL leaves all-zero residuals once the main effect is
        // removed; both nested fits are exact and the p-value is 1.
        let s = 6;
        let geno_m =
            Array2::from_shape_vec((1, s), vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]).unwrap();
        let expr_m = Array2::zeros((1, s));
        let context = vec![-1.0, 0.0, 1.0, -1.0, 0.0, 1.0];
        let mapping = find_ieqtls(&[eqtl(0)], &geno_m, &expr_m, &context, "ctx", 0.05);
        assert_eq!(mapping.n_hits, 0);
        let fdr_cell: f64 = mapping.table[0].last().unwrap().parse().unwrap();
        assert!(fdr_cell > 0.99);
    }

    #[test]
    fn vertex_of_single_ieqtl_matches_analytic_optimum() {
        let (geno_m, expr_m, context) = synthetic_panel(true);
        let mapping = find_ieqtls(&[eqtl(0)], &geno_m, &expr_m, &context, "ctx", 0.05);
        let ieqtl = &mapping.ieqtls[0];
        let (a, b) = ieqtl.coefficients(geno_m.ncols());
        let vertex = stats::vertex_xpos(&a, &b);

        // Per sample the optimum is (y - β0 - β1 g) / (β2 + β3 g) wherever
        // the interaction coefficient is non-zero.
        for (j, &s) in ieqtl.samples().iter().enumerate() {
            if ieqtl.cov_coef[j] != 0.0 {
                assert_relative_eq!(
                    vertex[s],
                    ieqtl.adj_y[j] / ieqtl.cov_coef[j],
                    epsilon = 1e-9
                );
            }
        }
    }

    #[test]
    fn log_likelihood_matches_negative_rss_at_fit_context() {
        let (geno_m, expr_m, context) = synthetic_panel(true);
        let fit = fit_row(geno_m.row(0), expr_m.row(0), &context);
        let ieqtl = IeQtl::from_fit(0, &fit, geno_m.row(0), expr_m.row(0));
        assert_relative_eq!(
            ieqtl.log_likelihood(&context),
            -fit.rss_full,
            epsilon = 1e-9
        );
        // Moving to the per-sample optimum can only improve it.
        let (a, b) = ieqtl.coefficients(geno_m.ncols());
        let mut optimum = stats::vertex_xpos(&a, &b);
        for (s, v) in optimum.iter_mut().enumerate() {
            if v.is_nan() {
                *v = context[s];
            }
        }
        assert!(ieqtl.log_likelihood(&optimum) >= ieqtl.log_likelihood(&context));
    }

    #[test]
    fn missing_genotypes_are_masked_out() {
        let (mut geno_m, mut expr_m, context) = synthetic_panel(true);
        geno_m[[0, 4]] = f64::NAN;
        expr_m[[0, 4]] = f64::NAN;
        let mapping = find_ieqtls(&[eqtl(0)], &geno_m, &expr_m, &context, "ctx", 0.05);
        assert_eq!(mapping.n_hits, 1);
        assert_eq!(mapping.hits_per_sample[4], 0);
        assert_eq!(mapping.min_hits_per_sample, 0);
        let n_cell: f64 = mapping.table[0][3].parse().unwrap();
        assert_eq!(n_cell, 59.0);
    }
}
