// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Ordinary-least-squares kernel and the handful of closed-form statistics
//! the interaction mapping relies on. Design matrices here are tiny
//! (d <= ~20), so the normal equations are solved by direct inversion with a
//! pseudo-inverse fallback rather than an iterative solver.

use std::cmp::Ordering;

use log::warn;
use nalgebra::{DMatrix, DVector};
use statrs::function::beta::beta_reg;

/// Smallest positive normal double; underflowed p-values are clamped here.
pub const MIN_P_VALUE: f64 = 2.2250738585072014e-308;

/// (XᵀX)⁻¹, falling back to the Moore-Penrose pseudo-inverse when the
/// normal matrix is singular.
pub fn inverse(x: &DMatrix<f64>) -> DMatrix<f64> {
    let xtx = x.transpose() * x;
    match xtx.clone().try_inverse() {
        Some(inv) => inv,
        None => {
            warn!("singular normal matrix, falling back to pseudo-inverse");
            pseudo_inverse(xtx)
        }
    }
}

fn pseudo_inverse(m: DMatrix<f64>) -> DMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let svd = m.svd(true, true);
    let eps = svd.singular_values.max() * 1e-15;
    svd.pseudo_inverse(eps.max(0.0))
        .unwrap_or_else(|_| DMatrix::zeros(ncols, nrows))
}

/// β = (XᵀX)⁻¹ Xᵀ y with the inverse supplied by the caller.
pub fn fit(x: &DMatrix<f64>, y: &DVector<f64>, inv: &DMatrix<f64>) -> DVector<f64> {
    inv * (x.transpose() * y)
}

pub fn predict(x: &DMatrix<f64>, betas: &DVector<f64>) -> DVector<f64> {
    x * betas
}

/// Residual sum of squares of `y` against fitted values.
pub fn rss(y: &DVector<f64>, y_hat: &DVector<f64>) -> f64 {
    let mut total = 0.0;
    for (a, b) in y.iter().zip(y_hat.iter()) {
        let r = a - b;
        total += r * r;
    }
    total
}

/// OLS residuals of `y` on `x`, with singularity handled by `inverse`.
pub fn residuals(x: &DMatrix<f64>, y: &DVector<f64>) -> DVector<f64> {
    let inv = inverse(x);
    let betas = fit(x, y, &inv);
    y - predict(x, &betas)
}

/// Standard errors: sqrt(RSS / (n - d) * diag((XᵀX)⁻¹)).
pub fn std_errors(rss: f64, n: usize, df: usize, inv: &DMatrix<f64>) -> Vec<f64> {
    let s2 = rss / (n - df) as f64;
    (0..inv.nrows()).map(|j| (s2 * inv[(j, j)]).sqrt()).collect()
}

/// p-value of the nested F-test of a smaller model (RSS `rss1`, df `df1`)
/// against a larger one (`rss2`, `df2`), computed through the regularised
/// incomplete beta function.
pub fn f_test_p_value(rss1: f64, rss2: f64, df1: usize, df2: usize, n: usize) -> f64 {
    if rss2 >= rss1 {
        return 1.0;
    }
    let dfn = (df2 - df1) as f64;
    let dfd = (n - df2) as f64;
    let f_value = ((rss1 - rss2) / dfn) / (rss2 / dfd);
    if !f_value.is_finite() {
        // Exact fit; the statistic overflows and the tail mass underflows.
        return MIN_P_VALUE;
    }
    let x = 1.0 - (dfn * f_value) / (dfn * f_value + dfd);
    let p = beta_reg(dfd / 2.0, dfn / 2.0, x);
    if p < MIN_P_VALUE {
        MIN_P_VALUE
    } else {
        p
    }
}

/// Element-wise vertex x = -b / (2a) of quadratics, NaN where a == 0.
pub fn vertex_xpos(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter()
        .zip(b.iter())
        .map(|(&a, &b)| if a == 0.0 { f64::NAN } else { -b / (2.0 * a) })
        .collect()
}

/// Pearson correlation coefficient without small-sample correction.
pub fn pearson_r(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let x_mean = x.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;
    let mut dev_sum = 0.0;
    let mut x_rss = 0.0;
    let mut y_rss = 0.0;
    for (&xv, &yv) in x.iter().zip(y.iter()) {
        let xd = xv - x_mean;
        let yd = yv - y_mean;
        dev_sum += xd * yd;
        x_rss += xd * xd;
        y_rss += yd * yd;
    }
    dev_sum / (x_rss * y_rss).sqrt()
}

/// Benjamini-Hochberg adjusted q-values, returned in the input order.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| {
        p_values[i]
            .partial_cmp(&p_values[j])
            .unwrap_or(Ordering::Equal)
    });

    let mut q_values = vec![f64::NAN; m];
    let mut running = 1.0_f64;
    for (rank, &idx) in order.iter().enumerate().rev() {
        let raw = p_values[idx] * m as f64 / (rank + 1) as f64;
        let capped = if raw > 1.0 { 1.0 } else { raw };
        if capped < running {
            running = capped;
        }
        q_values[idx] = running;
    }
    q_values
}
